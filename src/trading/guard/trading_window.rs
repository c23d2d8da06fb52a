//! 交易时间窗守卫
//!
//! 依据交易所本地时区判断：工作日、节假日、盘中时间段，
//! 以及窗口边界两侧的静默带（开收盘前后 grace 分钟内不下单）。

use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::app_error::{AppError, AppResult};
use crate::trading::model::execution::{SkipCode, SkipReason};
use crate::trading::model::task::ScheduledTask;
use crate::trading::guard::{Guard, GuardDecision};

/// 时间窗配置的文件形态
#[derive(Debug, Clone, Deserialize)]
pub struct TradingWindowFile {
    /// IANA 时区名，如 "America/New_York"
    pub timezone: String,
    /// 允许交易的星期，1=周一 .. 7=周日
    pub weekdays: Vec<u8>,
    /// 盘中开始时间，"HH:MM"
    pub start: String,
    /// 盘中结束时间，"HH:MM"
    pub end: String,
    /// 边界静默分钟数
    #[serde(default)]
    pub grace_minutes: u32,
    /// 节假日列表，"YYYY-MM-DD"
    #[serde(default)]
    pub holidays: Vec<String>,
}

/// 校验后的时间窗策略，evaluate 为纯函数
#[derive(Debug, Clone)]
pub struct TradingWindowPolicy {
    tz: Tz,
    weekdays: HashSet<Weekday>,
    start: NaiveTime,
    end: NaiveTime,
    grace: Duration,
    holidays: BTreeSet<NaiveDate>,
}

fn weekday_from_num(n: u8) -> Option<Weekday> {
    match n {
        1 => Some(Weekday::Mon),
        2 => Some(Weekday::Tue),
        3 => Some(Weekday::Wed),
        4 => Some(Weekday::Thu),
        5 => Some(Weekday::Fri),
        6 => Some(Weekday::Sat),
        7 => Some(Weekday::Sun),
        _ => None,
    }
}

impl TradingWindowPolicy {
    /// 一次性校验全部字段，任何一项非法都直接报配置错误
    pub fn from_file(file: &TradingWindowFile) -> AppResult<Self> {
        let tz: Tz = file
            .timezone
            .parse()
            .map_err(|_| AppError::config(format!("无效时区: {}", file.timezone)))?;

        if file.weekdays.is_empty() {
            return Err(AppError::config("weekdays 不能为空"));
        }
        let mut weekdays = HashSet::new();
        for &n in &file.weekdays {
            let wd = weekday_from_num(n)
                .ok_or_else(|| AppError::config(format!("无效星期编号: {}", n)))?;
            weekdays.insert(wd);
        }

        let start = crate::time_util::parse_hm(&file.start)
            .map_err(|_| AppError::config(format!("无效开始时间: {}", file.start)))?;
        let end = crate::time_util::parse_hm(&file.end)
            .map_err(|_| AppError::config(format!("无效结束时间: {}", file.end)))?;
        if start >= end {
            return Err(AppError::config(format!(
                "开始时间必须早于结束时间: {} >= {}",
                file.start, file.end
            )));
        }

        let grace = Duration::minutes(file.grace_minutes as i64);
        let half = (end - start) / 2;
        if grace > half {
            return Err(AppError::config(format!(
                "静默带过宽（{} 分钟），窗口内没有可交易时段",
                file.grace_minutes
            )));
        }

        let mut holidays = BTreeSet::new();
        for h in &file.holidays {
            let d = NaiveDate::parse_from_str(h, "%Y-%m-%d")
                .map_err(|_| AppError::config(format!("无效节假日格式: {}", h)))?;
            holidays.insert(d);
        }

        Ok(Self {
            tz,
            weekdays,
            start,
            end,
            grace,
            holidays,
        })
    }

    pub async fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let raw = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| AppError::config(format!("读取时间窗配置失败: {}", e)))?;
        let file: TradingWindowFile = serde_json::from_str(&raw)
            .map_err(|e| AppError::config(format!("解析时间窗配置失败: {}", e)))?;
        Self::from_file(&file)
    }

    /// 判断 UTC 时刻是否可交易；检查顺序固定：
    /// 星期 -> 节假日 -> 盘中时段 -> 边界静默带
    pub fn check(&self, now_utc: DateTime<Utc>) -> GuardDecision {
        let local = now_utc.with_timezone(&self.tz);
        let date = local.date_naive();
        let time = local.time();

        if !self.weekdays.contains(&local.weekday()) {
            return GuardDecision::Skip(SkipReason::with_detail(
                SkipCode::OutsideWeekday,
                format!("{} 非交易日", local.weekday()),
            ));
        }

        if self.holidays.contains(&date) {
            return GuardDecision::Skip(SkipReason::with_detail(
                SkipCode::Holiday,
                date.format("%Y-%m-%d").to_string(),
            ));
        }

        if time < self.start || time >= self.end {
            return GuardDecision::Skip(SkipReason::with_detail(
                SkipCode::OutsideHours,
                format!(
                    "当地时间 {} 不在 {} - {} 内",
                    time.format("%H:%M"),
                    self.start.format("%H:%M"),
                    self.end.format("%H:%M")
                ),
            ));
        }

        if self.grace > Duration::zero() {
            let open_blackout_end = self.start + self.grace;
            let close_blackout_start = self.end - self.grace;
            if time < open_blackout_end || time >= close_blackout_start {
                return GuardDecision::Skip(SkipReason::with_detail(
                    SkipCode::GracePeriodBlackout,
                    format!("开收盘 {} 分钟内不交易", self.grace.num_minutes()),
                ));
            }
        }

        GuardDecision::Allow
    }
}

/// 时间窗守卫，持有可热更新的策略
pub struct TradingWindowGuard {
    policy: Arc<RwLock<TradingWindowPolicy>>,
}

impl TradingWindowGuard {
    pub fn new(policy: TradingWindowPolicy) -> Self {
        Self {
            policy: Arc::new(RwLock::new(policy)),
        }
    }

    /// 运行中替换策略；校验在构造新策略时已完成，失败不影响旧策略
    pub async fn reload(&self, policy: TradingWindowPolicy) {
        let mut guard = self.policy.write().await;
        *guard = policy;
        info!("交易时间窗配置已热更新");
    }

    pub async fn reload_from(&self, path: impl AsRef<Path>) -> AppResult<()> {
        let policy = TradingWindowPolicy::load(path).await?;
        self.reload(policy).await;
        Ok(())
    }
}

#[async_trait]
impl Guard for TradingWindowGuard {
    fn name(&self) -> &'static str {
        "trading_window"
    }

    async fn evaluate(&self, _task: &ScheduledTask, now: DateTime<Utc>) -> GuardDecision {
        self.policy.read().await.check(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn nyse_policy(grace: u32) -> TradingWindowPolicy {
        TradingWindowPolicy::from_file(&TradingWindowFile {
            timezone: "America/New_York".to_string(),
            weekdays: vec![1, 2, 3, 4, 5],
            start: "09:30".to_string(),
            end: "16:00".to_string(),
            grace_minutes: grace,
            holidays: vec!["2026-07-03".to_string()],
        })
        .unwrap()
    }

    fn ny_utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        chrono_tz::America::New_York
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn skip_code(decision: GuardDecision) -> SkipCode {
        match decision {
            GuardDecision::Skip(r) => r.code,
            GuardDecision::Allow => panic!("期望 Skip"),
        }
    }

    #[test]
    fn test_saturday_is_skipped() {
        // 2026-08-29 是周六
        let p = nyse_policy(0);
        let decision = p.check(ny_utc(2026, 8, 29, 10, 0));
        assert_eq!(skip_code(decision), SkipCode::OutsideWeekday);
    }

    #[test]
    fn test_holiday_is_skipped() {
        let p = nyse_policy(0);
        // 2026-07-03 是周五且在节假日表中
        let decision = p.check(ny_utc(2026, 7, 3, 11, 0));
        assert_eq!(skip_code(decision), SkipCode::Holiday);
    }

    #[test]
    fn test_outside_hours() {
        let p = nyse_policy(0);
        assert_eq!(
            skip_code(p.check(ny_utc(2026, 8, 28, 8, 0))),
            SkipCode::OutsideHours
        );
        // 收盘时刻本身不在窗口内
        assert_eq!(
            skip_code(p.check(ny_utc(2026, 8, 28, 16, 0))),
            SkipCode::OutsideHours
        );
    }

    #[test]
    fn test_grace_blackout_bands() {
        let p = nyse_policy(15);
        // 开盘后 14 分钟仍在静默带内
        assert_eq!(
            skip_code(p.check(ny_utc(2026, 8, 28, 9, 44))),
            SkipCode::GracePeriodBlackout
        );
        // 开盘后 15 分钟放行
        assert_eq!(p.check(ny_utc(2026, 8, 28, 9, 45)), GuardDecision::Allow);
        // 收盘前 15 分钟进入静默带
        assert_eq!(
            skip_code(p.check(ny_utc(2026, 8, 28, 15, 45))),
            SkipCode::GracePeriodBlackout
        );
        assert_eq!(p.check(ny_utc(2026, 8, 28, 15, 44)), GuardDecision::Allow);
    }

    #[test]
    fn test_midday_allowed_without_grace() {
        let p = nyse_policy(0);
        assert_eq!(p.check(ny_utc(2026, 8, 28, 12, 0)), GuardDecision::Allow);
    }

    #[test]
    fn test_dst_offset_respected() {
        // 冬令时 (EST, UTC-5)：UTC 15:00 = 当地 10:00，盘中
        let winter = Utc.with_ymd_and_hms(2026, 1, 15, 15, 0, 0).unwrap();
        let p = nyse_policy(0);
        assert_eq!(p.check(winter), GuardDecision::Allow);
        // 夏令时 (EDT, UTC-4)：UTC 13:00 = 当地 09:00，盘前
        let summer = Utc.with_ymd_and_hms(2026, 6, 15, 13, 0, 0).unwrap();
        assert_eq!(skip_code(p.check(summer)), SkipCode::OutsideHours);
    }

    #[tokio::test]
    async fn test_reload_swaps_policy_in_place() {
        use crate::trading::model::task::{ScheduleFrequency, TaskSpec};

        let guard_under_test = TradingWindowGuard::new(nyse_policy(0));
        let task = ScheduledTask::from_spec(
            TaskSpec {
                task_id: "t1".to_string(),
                name: "窗口测试".to_string(),
                symbols: vec!["AAPL".to_string()],
                strategies: vec!["all".to_string()],
                frequency: ScheduleFrequency::Daily,
            },
            Utc::now(),
        )
        .unwrap();

        // 周五盘中放行
        let friday_noon = ny_utc(2026, 8, 28, 12, 0);
        assert_eq!(
            guard_under_test.evaluate(&task, friday_noon).await,
            GuardDecision::Allow
        );

        // 热更新为把周五移出交易日的策略后，同一时刻被跳过
        let weekend_only = TradingWindowPolicy::from_file(&TradingWindowFile {
            timezone: "America/New_York".to_string(),
            weekdays: vec![6, 7],
            start: "09:30".to_string(),
            end: "16:00".to_string(),
            grace_minutes: 0,
            holidays: vec![],
        })
        .unwrap();
        guard_under_test.reload(weekend_only).await;
        assert_eq!(
            skip_code(guard_under_test.evaluate(&task, friday_noon).await),
            SkipCode::OutsideWeekday
        );
    }

    #[test]
    fn test_validation_rejects_bad_config() {
        let mut f = TradingWindowFile {
            timezone: "Mars/Olympus".to_string(),
            weekdays: vec![1],
            start: "09:30".to_string(),
            end: "16:00".to_string(),
            grace_minutes: 0,
            holidays: vec![],
        };
        assert!(TradingWindowPolicy::from_file(&f).is_err());

        f.timezone = "America/New_York".to_string();
        f.weekdays = vec![8];
        assert!(TradingWindowPolicy::from_file(&f).is_err());

        f.weekdays = vec![1];
        f.start = "25:00".to_string();
        assert!(TradingWindowPolicy::from_file(&f).is_err());

        f.start = "16:00".to_string();
        assert!(TradingWindowPolicy::from_file(&f).is_err());

        f.start = "09:30".to_string();
        f.grace_minutes = 300;
        assert!(TradingWindowPolicy::from_file(&f).is_err());
    }
}
