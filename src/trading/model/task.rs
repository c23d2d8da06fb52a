//! 计划任务配置模型
//!
//! 任务只能通过 TaskRegistry 变更；task_id 创建后不可变，
//! 更新必须保留 id 与创建时间（禁止删除后重建）。

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// 调度频率枚举
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleFrequency {
    #[serde(rename = "minute")]
    EveryMinute,
    #[serde(rename = "5min")]
    Every5Minutes,
    #[serde(rename = "15min")]
    Every15Minutes,
    #[serde(rename = "30min")]
    Every30Minutes,
    #[serde(rename = "hour")]
    Hourly,
    #[serde(rename = "2hours")]
    Every2Hours,
    #[serde(rename = "4hours")]
    Every4Hours,
    #[serde(rename = "daily")]
    Daily,
    #[serde(rename = "weekly")]
    Weekly,
    #[serde(rename = "monthly")]
    Monthly,
}

/// 任务生命周期状态
///
/// 删除为软删除：保留记录以保证历史 ExecutionSummary 的引用完整性。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskLifecycle {
    Active,
    Paused,
    Deleted,
}

/// 计划任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub task_id: String,
    pub name: String,
    /// 目标交易品种（非空）
    pub symbols: Vec<String>,
    /// 策略选择列表，"all" 表示全部
    pub strategies: Vec<String>,
    pub frequency: ScheduleFrequency,
    pub enabled: bool,
    pub status: TaskLifecycle,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
}

/// 创建/更新任务时由调用方提供的可变字段
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: String,
    pub name: String,
    pub symbols: Vec<String>,
    pub strategies: Vec<String>,
    pub frequency: ScheduleFrequency,
}

impl TaskSpec {
    /// 单次校验：非法配置在这里立即失败，不推迟到运行期
    pub fn validate(&self) -> AppResult<()> {
        if self.task_id.trim().is_empty() {
            return Err(AppError::config("task_id 不能为空"));
        }
        if self.name.trim().is_empty() {
            return Err(AppError::config(format!("任务 {} 缺少名称", self.task_id)));
        }
        if self.symbols.is_empty() {
            return Err(AppError::config(format!(
                "任务 {} 必须至少包含一个交易品种",
                self.task_id
            )));
        }
        if self.symbols.iter().any(|s| s.trim().is_empty()) {
            return Err(AppError::config(format!("任务 {} 含有空的品种代码", self.task_id)));
        }
        if self.strategies.is_empty() {
            return Err(AppError::config(format!(
                "任务 {} 必须至少选择一个策略",
                self.task_id
            )));
        }
        Ok(())
    }
}

/// 去重且保持首次出现的顺序
fn dedup_symbols(symbols: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    symbols
        .into_iter()
        .filter(|s| seen.insert(s.clone()))
        .collect()
}

impl ScheduledTask {
    /// 由校验过的 TaskSpec 创建新任务
    pub fn from_spec(spec: TaskSpec, now: DateTime<Utc>) -> AppResult<Self> {
        spec.validate()?;
        let symbols = dedup_symbols(spec.symbols);
        Ok(Self {
            task_id: spec.task_id,
            name: spec.name,
            symbols,
            strategies: spec.strategies,
            frequency: spec.frequency,
            enabled: true,
            status: TaskLifecycle::Active,
            created_at: now,
            updated_at: now,
            last_run: None,
        })
    }

    /// 应用更新：仅替换可变字段，id 与 created_at 保持不变
    pub fn apply_update(&mut self, spec: TaskSpec, now: DateTime<Utc>) -> AppResult<()> {
        spec.validate()?;
        if spec.task_id != self.task_id {
            return Err(AppError::InvariantViolation(format!(
                "更新不允许改变 task_id: {} -> {}",
                self.task_id, spec.task_id
            )));
        }
        self.name = spec.name;
        self.symbols = dedup_symbols(spec.symbols);
        self.strategies = spec.strategies;
        self.frequency = spec.frequency;
        self.updated_at = now;
        Ok(())
    }

    /// 是否应参与调度
    pub fn is_schedulable(&self) -> bool {
        self.enabled && self.status == TaskLifecycle::Active
    }

    /// 是否选择了全部策略
    pub fn wants_all_strategies(&self) -> bool {
        self.strategies
            .iter()
            .any(|s| s.eq_ignore_ascii_case("all") || s == "*")
    }
}
