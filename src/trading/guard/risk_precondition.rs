//! 券商风控前置守卫
//!
//! 每次评估都拉取最新账户快照，绝不使用缓存。
//! 快照不可用时失败关闭：跳过本次执行而不是放行。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::trading::guard::{Guard, GuardDecision};
use crate::trading::model::execution::{RiskSnapshot, SkipCode, SkipReason};
use crate::trading::model::task::ScheduledTask;
use crate::trading::provider::RiskLimitsSource;

const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RiskPreconditionGuard {
    source: Arc<dyn RiskLimitsSource>,
    snapshot_timeout: Duration,
}

impl RiskPreconditionGuard {
    pub fn new(source: Arc<dyn RiskLimitsSource>) -> Self {
        Self {
            source,
            snapshot_timeout: SNAPSHOT_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub fn with_timeout(source: Arc<dyn RiskLimitsSource>, timeout: Duration) -> Self {
        Self {
            source,
            snapshot_timeout: timeout,
        }
    }

    /// 对快照做组合级检查，返回第一条被触发的限额
    fn check_snapshot(snapshot: &RiskSnapshot) -> Option<SkipReason> {
        if snapshot.equity <= 0.0 {
            return Some(SkipReason::with_detail(
                SkipCode::RiskLimitExceeded,
                "账户净值非正",
            ));
        }

        let total_ratio = snapshot.total_exposure / snapshot.equity;
        if total_ratio > snapshot.limits.max_total_exposure_ratio {
            return Some(SkipReason::with_detail(
                SkipCode::RiskLimitExceeded,
                format!(
                    "总敞口占比 {:.4} 超过上限 {:.4}",
                    total_ratio, snapshot.limits.max_total_exposure_ratio
                ),
            ));
        }

        let cash_ratio = snapshot.cash / snapshot.equity;
        if cash_ratio < snapshot.limits.min_cash_reserve_ratio {
            return Some(SkipReason::with_detail(
                SkipCode::RiskLimitExceeded,
                format!(
                    "现金储备占比 {:.4} 低于下限 {:.4}",
                    cash_ratio, snapshot.limits.min_cash_reserve_ratio
                ),
            ));
        }

        for (symbol, exposure) in &snapshot.positions {
            let ratio = exposure / snapshot.equity;
            if ratio > snapshot.limits.max_symbol_exposure_ratio {
                return Some(SkipReason::with_detail(
                    SkipCode::RiskLimitExceeded,
                    format!(
                        "品种 {} 敞口占比 {:.4} 超过上限 {:.4}",
                        symbol, ratio, snapshot.limits.max_symbol_exposure_ratio
                    ),
                ));
            }
        }

        None
    }
}

#[async_trait]
impl Guard for RiskPreconditionGuard {
    fn name(&self) -> &'static str {
        "risk_precondition"
    }

    async fn evaluate(&self, task: &ScheduledTask, _now: DateTime<Utc>) -> GuardDecision {
        let snapshot =
            match tokio::time::timeout(self.snapshot_timeout, self.source.current_snapshot()).await
            {
                Ok(Ok(snapshot)) => snapshot,
                Ok(Err(e)) => {
                    warn!("任务 {} 风控快照获取失败: {}", task.task_id, e);
                    return GuardDecision::Skip(SkipReason::with_detail(
                        SkipCode::RiskCheckUnavailable,
                        e.to_string(),
                    ));
                }
                Err(_) => {
                    warn!("任务 {} 风控快照获取超时", task.task_id);
                    return GuardDecision::Skip(SkipReason::with_detail(
                        SkipCode::RiskCheckUnavailable,
                        format!("快照获取超过 {} 秒", self.snapshot_timeout.as_secs()),
                    ));
                }
            };

        match Self::check_snapshot(&snapshot) {
            Some(reason) => GuardDecision::Skip(reason),
            None => GuardDecision::Allow,
        }
    }
}
