//! 运行前守卫
//!
//! 守卫可以否决一次执行（Skip + 原因），否决不是错误。
//! 守卫按固定顺序组成链条，遇到第一个 Skip 即停止。

pub mod risk_precondition;
pub mod trading_window;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::trading::model::execution::SkipReason;
use crate::trading::model::task::ScheduledTask;

/// 守卫裁决
#[derive(Debug, Clone, PartialEq)]
pub enum GuardDecision {
    Allow,
    Skip(SkipReason),
}

/// 运行前守卫接口
///
/// 实现不得 panic，也不得把内部故障抛给调用方：
/// 依赖不可用时按失败关闭（fail-closed）返回 Skip。
#[async_trait]
pub trait Guard: Send + Sync {
    fn name(&self) -> &'static str;

    async fn evaluate(&self, task: &ScheduledTask, now: DateTime<Utc>) -> GuardDecision;
}

/// 有序守卫链
pub struct GuardChain {
    guards: Vec<Arc<dyn Guard>>,
}

impl GuardChain {
    pub fn new(guards: Vec<Arc<dyn Guard>>) -> Self {
        Self { guards }
    }

    /// 依次执行，返回第一个 Skip；全部放行时返回 Allow
    pub async fn evaluate(&self, task: &ScheduledTask, now: DateTime<Utc>) -> GuardDecision {
        for guard in &self.guards {
            match guard.evaluate(task, now).await {
                GuardDecision::Allow => continue,
                GuardDecision::Skip(reason) => {
                    info!(
                        "守卫 {} 跳过任务 {}: {}",
                        guard.name(),
                        task.task_id,
                        reason
                    );
                    return GuardDecision::Skip(reason);
                }
            }
        }
        GuardDecision::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading::model::execution::SkipCode;
    use crate::trading::model::task::{ScheduleFrequency, TaskSpec};

    struct AlwaysAllow;
    struct AlwaysSkip(SkipCode);

    #[async_trait]
    impl Guard for AlwaysAllow {
        fn name(&self) -> &'static str {
            "allow"
        }
        async fn evaluate(&self, _task: &ScheduledTask, _now: DateTime<Utc>) -> GuardDecision {
            GuardDecision::Allow
        }
    }

    #[async_trait]
    impl Guard for AlwaysSkip {
        fn name(&self) -> &'static str {
            "skip"
        }
        async fn evaluate(&self, _task: &ScheduledTask, _now: DateTime<Utc>) -> GuardDecision {
            GuardDecision::Skip(SkipReason::new(self.0))
        }
    }

    fn task() -> ScheduledTask {
        ScheduledTask::from_spec(
            TaskSpec {
                task_id: "t1".to_string(),
                name: "测试任务".to_string(),
                symbols: vec!["AAPL".to_string()],
                strategies: vec!["all".to_string()],
                frequency: ScheduleFrequency::Daily,
            },
            Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_chain_stops_at_first_skip() {
        let chain = GuardChain::new(vec![
            Arc::new(AlwaysAllow),
            Arc::new(AlwaysSkip(SkipCode::Holiday)),
            Arc::new(AlwaysSkip(SkipCode::OutsideHours)),
        ]);
        match chain.evaluate(&task(), Utc::now()).await {
            GuardDecision::Skip(reason) => assert_eq!(reason.code, SkipCode::Holiday),
            GuardDecision::Allow => panic!("应被第二个守卫拦截"),
        }
    }

    #[tokio::test]
    async fn test_chain_allows_when_all_pass() {
        let chain = GuardChain::new(vec![Arc::new(AlwaysAllow), Arc::new(AlwaysAllow)]);
        assert_eq!(chain.evaluate(&task(), Utc::now()).await, GuardDecision::Allow);
    }
}
