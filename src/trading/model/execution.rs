//! 执行审计记录模型
//!
//! ExecutionSummary 是每次执行尝试的唯一审计记录：
//! 每次尝试（放行、跳过或失败）恰好产生一条，创建后不可变，
//! 并恰好向 ExecutionRepository 追加一次。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::trading::model::task::ScheduledTask;

/// 守卫跳过原因，code 为稳定的机器可读标识
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipReason {
    pub code: SkipCode,
    /// 供人阅读的补充说明
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipCode {
    #[serde(rename = "outside-weekday")]
    OutsideWeekday,
    #[serde(rename = "holiday")]
    Holiday,
    #[serde(rename = "outside-hours")]
    OutsideHours,
    #[serde(rename = "within-grace-period-blackout")]
    GracePeriodBlackout,
    #[serde(rename = "risk-check-unavailable")]
    RiskCheckUnavailable,
    #[serde(rename = "risk-limit-exceeded")]
    RiskLimitExceeded,
}

impl SkipCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipCode::OutsideWeekday => "outside-weekday",
            SkipCode::Holiday => "holiday",
            SkipCode::OutsideHours => "outside-hours",
            SkipCode::GracePeriodBlackout => "within-grace-period-blackout",
            SkipCode::RiskCheckUnavailable => "risk-check-unavailable",
            SkipCode::RiskLimitExceeded => "risk-limit-exceeded",
        }
    }
}

impl SkipReason {
    pub fn new(code: SkipCode) -> Self {
        Self { code, detail: None }
    }

    pub fn with_detail(code: SkipCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: Some(detail.into()),
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.detail {
            Some(d) => write!(f, "{}: {}", self.code.as_str(), d),
            None => write!(f, "{}", self.code.as_str()),
        }
    }
}

/// 管线阶段，用于失败归因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineStage {
    Reset,
    DataFetch,
    Strategy,
    SignalGeneration,
    Sizing,
    RiskValidation,
    OrderSubmission,
}

/// 执行结果
///
/// 阶段级错误（影响全部品种）记为 Failed；
/// 局部错误嵌入 Completed 的逐品种/逐订单记录中。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionOutcome {
    Completed,
    Skipped(SkipReason),
    Failed { stage: PipelineStage, error: String },
}

/// 结果粗分类，用于历史查询过滤
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeKind {
    Completed,
    Skipped,
    Failed,
}

impl ExecutionOutcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            ExecutionOutcome::Completed => OutcomeKind::Completed,
            ExecutionOutcome::Skipped(_) => OutcomeKind::Skipped,
            ExecutionOutcome::Failed { .. } => OutcomeKind::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalDirection {
    Buy,
    Sell,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SignalStatus {
    /// 已转化为提交的订单
    Executed,
    /// 风控或数量校验拒绝
    Rejected { reason: String },
    /// 低于置信度阈值被丢弃（正常结果，非错误）
    Dropped { reason: String },
}

/// 归一化后的交易信号
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRecord {
    pub symbol: String,
    pub strategy: String,
    pub direction: SignalDirection,
    /// 置信度，截断到 [0, 1]
    pub confidence: f64,
    pub target_price: Option<f64>,
    pub reasoning: String,
    pub quantity: f64,
    pub status: SignalStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    Submitted,
    Filled,
    Rejected,
    Failed,
    Cancelled,
}

/// 订单记录，broker_order_id 由券商侧分配
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub symbol: String,
    pub direction: SignalDirection,
    pub quantity: f64,
    pub reference_price: f64,
    pub broker_order_id: Option<String>,
    pub status: OrderState,
    pub reason: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
}

/// 风险限制配置（比例均相对账户权益）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskLimits {
    /// 单品种最大敞口占比
    pub max_symbol_exposure_ratio: f64,
    /// 组合最大总敞口占比
    pub max_total_exposure_ratio: f64,
    /// 单笔交易最大占比
    pub max_single_trade_ratio: f64,
    /// 最小现金储备占比
    pub min_cash_reserve_ratio: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_symbol_exposure_ratio: 0.1,
            max_total_exposure_ratio: 0.8,
            max_single_trade_ratio: 0.05,
            min_cash_reserve_ratio: 0.1,
        }
    }
}

/// 风险快照：每次守卫/管线调用时从 RiskLimitsSource 重新取得，
/// 不跨 tick 缓存（限制可能在两次触发之间变化）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub equity: f64,
    pub cash: f64,
    pub total_exposure: f64,
    /// 每个品种的持仓市值
    pub positions: BTreeMap<String, f64>,
    pub limits: RiskLimits,
    pub captured_at: DateTime<Utc>,
}

impl RiskSnapshot {
    pub fn symbol_exposure(&self, symbol: &str) -> f64 {
        self.positions.get(symbol).copied().unwrap_or(0.0)
    }
}

/// 单品种执行明细
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolReport {
    pub signals: Vec<SignalRecord>,
    pub order_count: usize,
    pub errors: Vec<String>,
}

/// 一次执行尝试的审计记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub execution_id: Uuid,
    pub task_id: String,
    pub task_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub outcome: ExecutionOutcome,
    pub symbols: BTreeMap<String, SymbolReport>,
    pub orders: Vec<OrderRecord>,
    pub executed_signals: usize,
    pub rejected_signals: usize,
    pub total_signals: usize,
    pub risk_snapshot: Option<RiskSnapshot>,
    pub task_errors: Vec<String>,
    pub elapsed_ms: i64,
}

impl ExecutionSummary {
    /// 守卫跳过时由调度器直接构造（不经过编排器）
    pub fn skipped(task: &ScheduledTask, reason: SkipReason, now: DateTime<Utc>) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            task_id: task.task_id.clone(),
            task_name: task.name.clone(),
            started_at: now,
            completed_at: now,
            outcome: ExecutionOutcome::Skipped(reason.clone()),
            symbols: BTreeMap::new(),
            orders: Vec::new(),
            executed_signals: 0,
            rejected_signals: 0,
            total_signals: 0,
            risk_snapshot: None,
            task_errors: vec![reason.to_string()],
            elapsed_ms: 0,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.outcome, ExecutionOutcome::Skipped(_))
    }
}
