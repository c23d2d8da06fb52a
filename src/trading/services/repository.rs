//! 执行审计存储
//!
//! 每次执行尝试恰好写入一条 ExecutionSummary，包括被守卫跳过的执行。
//! 查询结果按开始时间升序，时间相同时按 execution_id 排序，保证稳定。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::app_error::{AppError, AppResult};
use crate::trading::model::execution::{ExecutionSummary, OutcomeKind};

/// 执行记录查询条件，各字段为 AND 关系
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub task_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub outcome: Option<OutcomeKind>,
}

impl ExecutionFilter {
    fn matches(&self, summary: &ExecutionSummary) -> bool {
        if let Some(task_id) = &self.task_id {
            if &summary.task_id != task_id {
                return false;
            }
        }
        if let Some(from) = self.from {
            if summary.started_at < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if summary.started_at >= to {
                return false;
            }
        }
        if let Some(outcome) = self.outcome {
            if summary.outcome.kind() != outcome {
                return false;
            }
        }
        true
    }
}

#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// 追加一条执行记录，execution_id 重复视为不变量被破坏
    async fn append(&self, summary: ExecutionSummary) -> AppResult<()>;

    async fn query(&self, filter: &ExecutionFilter) -> AppResult<Vec<ExecutionSummary>>;
}

/// 内存实现，进程重启后记录丢失
#[derive(Default)]
pub struct InMemoryExecutionRepository {
    records: RwLock<Vec<ExecutionSummary>>,
}

#[async_trait]
impl ExecutionRepository for InMemoryExecutionRepository {
    async fn append(&self, summary: ExecutionSummary) -> AppResult<()> {
        let mut records = self.records.write().await;
        if records.iter().any(|r| r.execution_id == summary.execution_id) {
            return Err(AppError::InvariantViolation(format!(
                "执行记录重复: {}",
                summary.execution_id
            )));
        }
        records.push(summary);
        Ok(())
    }

    async fn query(&self, filter: &ExecutionFilter) -> AppResult<Vec<ExecutionSummary>> {
        let records = self.records.read().await;
        let mut hits: Vec<ExecutionSummary> = records
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        hits.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.execution_id.cmp(&b.execution_id))
        });
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    use crate::trading::model::execution::{ExecutionSummary, SkipCode, SkipReason};
    use crate::trading::model::task::{ScheduleFrequency, ScheduledTask, TaskSpec};

    fn task(id: &str) -> ScheduledTask {
        ScheduledTask::from_spec(
            TaskSpec {
                task_id: id.to_string(),
                name: format!("任务 {}", id),
                symbols: vec!["AAPL".to_string()],
                strategies: vec!["all".to_string()],
                frequency: ScheduleFrequency::Hourly,
            },
            Utc::now(),
        )
        .unwrap()
    }

    fn skipped(task_id: &str, at: DateTime<Utc>) -> ExecutionSummary {
        ExecutionSummary::skipped(&task(task_id), SkipReason::new(SkipCode::OutsideHours), at)
    }

    #[tokio::test]
    async fn test_append_and_query_all() {
        let repo = InMemoryExecutionRepository::default();
        let now = Utc::now();
        repo.append(skipped("t1", now)).await.unwrap();
        repo.append(skipped("t2", now + Duration::seconds(1)))
            .await
            .unwrap();

        let all = repo.query(&ExecutionFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].task_id, "t1");
    }

    #[tokio::test]
    async fn test_duplicate_execution_id_rejected() {
        let repo = InMemoryExecutionRepository::default();
        let summary = skipped("t1", Utc::now());
        repo.append(summary.clone()).await.unwrap();
        assert!(matches!(
            repo.append(summary).await,
            Err(AppError::InvariantViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_filter_by_task_and_time_window() {
        let repo = InMemoryExecutionRepository::default();
        let base = Utc::now();
        repo.append(skipped("t1", base)).await.unwrap();
        repo.append(skipped("t1", base + Duration::hours(1)))
            .await
            .unwrap();
        repo.append(skipped("t2", base)).await.unwrap();

        let filter = ExecutionFilter {
            task_id: Some("t1".to_string()),
            from: Some(base + Duration::minutes(30)),
            ..Default::default()
        };
        let hits = repo.query(&filter).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].started_at, base + Duration::hours(1));

        // to 为右开区间
        let filter = ExecutionFilter {
            to: Some(base),
            ..Default::default()
        };
        assert!(repo.query(&filter).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_filter_by_outcome_kind() {
        let repo = InMemoryExecutionRepository::default();
        repo.append(skipped("t1", Utc::now())).await.unwrap();

        let filter = ExecutionFilter {
            outcome: Some(OutcomeKind::Skipped),
            ..Default::default()
        };
        assert_eq!(repo.query(&filter).await.unwrap().len(), 1);

        let filter = ExecutionFilter {
            outcome: Some(OutcomeKind::Completed),
            ..Default::default()
        };
        assert!(repo.query(&filter).await.unwrap().is_empty());
    }
}
