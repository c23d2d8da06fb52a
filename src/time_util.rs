//! 调度时间计算
//!
//! 负责把 ScheduleFrequency 换算为下一次触发时刻，调度器再将其
//! 转换为单调时钟（Instant）截止点，避免墙钟回拨造成漂移。

use anyhow::anyhow;
use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc, Weekday};

use crate::trading::model::task::ScheduleFrequency;

/// 日级任务的默认锚点时间（开盘时间，UTC）
pub const DEFAULT_DAILY_ANCHOR: &str = "09:30";

/// 解析 "HH:MM" 字符串
pub fn parse_hm(text: &str) -> anyhow::Result<NaiveTime> {
    let mut parts = text.trim().split(':');
    let hour: u32 = parts
        .next()
        .ok_or_else(|| anyhow!("时间格式非法: {}", text))?
        .parse()
        .map_err(|_| anyhow!("时间格式非法: {}", text))?;
    let minute: u32 = match parts.next() {
        Some(m) => m.parse().map_err(|_| anyhow!("时间格式非法: {}", text))?,
        None => 0,
    };
    NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(|| anyhow!("时间越界: {}", text))
}

/// 子日级频率对应的固定间隔
pub fn fixed_interval(frequency: &ScheduleFrequency) -> Option<Duration> {
    let minutes = match frequency {
        ScheduleFrequency::EveryMinute => 1,
        ScheduleFrequency::Every5Minutes => 5,
        ScheduleFrequency::Every15Minutes => 15,
        ScheduleFrequency::Every30Minutes => 30,
        ScheduleFrequency::Hourly => 60,
        ScheduleFrequency::Every2Hours => 2 * 60,
        ScheduleFrequency::Every4Hours => 4 * 60,
        _ => return None,
    };
    Some(Duration::minutes(minutes))
}

/// 计算严格晚于 `after` 的下一次触发时刻
///
/// 子日级频率按固定间隔推进；Daily 在每天锚点时间触发，
/// Weekly 在周一锚点时间触发，Monthly 在每月 1 日锚点时间触发。
pub fn next_fire_after(
    frequency: &ScheduleFrequency,
    after: DateTime<Utc>,
    anchor: NaiveTime,
) -> DateTime<Utc> {
    if let Some(interval) = fixed_interval(frequency) {
        return after + interval;
    }

    match frequency {
        ScheduleFrequency::Daily => {
            let candidate = at_anchor(after, anchor);
            if candidate > after {
                candidate
            } else {
                candidate + Duration::days(1)
            }
        }
        ScheduleFrequency::Weekly => {
            let mut candidate = at_anchor(after, anchor);
            while candidate.weekday() != Weekday::Mon || candidate <= after {
                candidate = candidate + Duration::days(1);
            }
            candidate
        }
        ScheduleFrequency::Monthly => {
            let mut candidate = first_of_month(after, anchor);
            if candidate <= after {
                candidate = first_of_month(candidate + Duration::days(40), anchor);
            }
            candidate
        }
        // 固定间隔分支已在上方处理
        _ => after + Duration::minutes(1),
    }
}

fn at_anchor(reference: DateTime<Utc>, anchor: NaiveTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&reference.date_naive().and_time(anchor))
}

fn first_of_month(reference: DateTime<Utc>, anchor: NaiveTime) -> DateTime<Utc> {
    let first = reference
        .date_naive()
        .with_day(1)
        .expect("每月必有 1 日")
        .and_time(anchor);
    Utc.from_utc_datetime(&first)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_parse_hm() {
        assert_eq!(parse_hm("09:30").unwrap(), NaiveTime::from_hms_opt(9, 30, 0).unwrap());
        assert_eq!(parse_hm("16").unwrap(), NaiveTime::from_hms_opt(16, 0, 0).unwrap());
        assert!(parse_hm("25:00").is_err());
        assert!(parse_hm("abc").is_err());
    }

    #[test]
    fn test_fixed_interval_frequencies() {
        let base = utc(2024, 6, 3, 10, 0);
        let next = next_fire_after(&ScheduleFrequency::Every5Minutes, base, anchor());
        assert_eq!(next, utc(2024, 6, 3, 10, 5));

        let next = next_fire_after(&ScheduleFrequency::Every4Hours, base, anchor());
        assert_eq!(next, utc(2024, 6, 3, 14, 0));
    }

    #[test]
    fn test_daily_before_and_after_anchor() {
        // 锚点之前触发当天，之后顺延到次日
        let next = next_fire_after(&ScheduleFrequency::Daily, utc(2024, 6, 3, 8, 0), anchor());
        assert_eq!(next, utc(2024, 6, 3, 9, 30));

        let next = next_fire_after(&ScheduleFrequency::Daily, utc(2024, 6, 3, 9, 30), anchor());
        assert_eq!(next, utc(2024, 6, 4, 9, 30));
    }

    #[test]
    fn test_weekly_lands_on_monday() {
        // 2024-06-05 是周三，下一次应为 2024-06-10 周一
        let next = next_fire_after(&ScheduleFrequency::Weekly, utc(2024, 6, 5, 12, 0), anchor());
        assert_eq!(next, utc(2024, 6, 10, 9, 30));
        assert_eq!(next.weekday(), Weekday::Mon);
    }

    #[test]
    fn test_monthly_first_day() {
        let next = next_fire_after(&ScheduleFrequency::Monthly, utc(2024, 6, 5, 12, 0), anchor());
        assert_eq!(next, utc(2024, 7, 1, 9, 30));

        // 当月 1 日锚点之前仍属当月
        let next = next_fire_after(&ScheduleFrequency::Monthly, utc(2024, 6, 1, 8, 0), anchor());
        assert_eq!(next, utc(2024, 6, 1, 9, 30));
    }

    fn anchor() -> NaiveTime {
        NaiveTime::from_hms_opt(9, 30, 0).unwrap()
    }
}
