//! 外部协作方接口定义
//!
//! 核心只通过这些窄接口消费行情、策略、下单与风控额度，
//! 具体实现（券商客户端、远程策略服务等）在本 crate 之外。
//! 所有实现必须 Send + Sync，调用方负责超时与有限重试。

pub mod simulation;

use anyhow::Result;
use async_trait::async_trait;

use crate::trading::model::execution::{
    ExecutionSummary, OrderState, RiskSnapshot, SignalDirection,
};

/// K线数据项
#[derive(Debug, Clone, PartialEq)]
pub struct CandleItem {
    pub ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl CandleItem {
    /// 构造并校验：高低开收关系非法时拒绝
    pub fn new(ts: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Result<Self> {
        let ordered = low <= open && low <= close && low <= high && high >= open && high >= close;
        if !ordered || volume < 0.0 || low < 0.0 {
            return Err(anyhow::anyhow!("K线数据非法: ts={}", ts));
        }
        Ok(Self {
            ts,
            open,
            high,
            low,
            close,
            volume,
        })
    }
}

/// 策略原始输出（尚未归一化）
#[derive(Debug, Clone)]
pub struct StrategyCandidate {
    pub strategy: String,
    /// 原始信号：符号表示方向，绝对值表示强度（可大于1）
    pub raw_signal: f64,
    pub confidence: f64,
    pub target_price: Option<f64>,
    pub reason: String,
}

/// 提交给券商的订单请求
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub direction: SignalDirection,
    pub quantity: f64,
    pub reference_price: f64,
}

/// 券商回执
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub broker_order_id: String,
    pub status: OrderState,
}

/// 行情数据提供方
#[async_trait]
pub trait DataProvider: Send + Sync {
    /// 拉取指定品种最近 lookback 根K线，按时间升序返回
    async fn fetch_recent(&self, symbol: &str, lookback: usize) -> Result<Vec<CandleItem>>;
}

/// 策略运行方
#[async_trait]
pub trait StrategyRunner: Send + Sync {
    /// 对一个品种的行情序列运行一个策略，产出候选信号
    ///
    /// # 返回
    /// - `Ok(Some)` - 产生了可执行的候选信号
    /// - `Ok(None)` - 策略无信号（正常结果）
    /// - `Err` - 策略执行失败（记录为该品种的错误，不中断整体运行）
    async fn run(
        &self,
        strategy_id: &str,
        symbol: &str,
        series: &[CandleItem],
    ) -> Result<Option<StrategyCandidate>>;

    /// 可用策略清单（解析 "all" 通配时使用）
    fn available_strategies(&self) -> Vec<String>;
}

/// 订单执行方（券商侧）
#[async_trait]
pub trait OrderExecutor: Send + Sync {
    /// 提交订单，返回券商分配的订单号与初始状态
    async fn submit(&self, order: &OrderRequest) -> Result<OrderAck>;

    /// 查询订单状态
    async fn get_status(&self, broker_order_id: &str) -> Result<OrderState>;
}

/// 风险限额来源
///
/// 快照必须每次调用重新获取，不得跨运行缓存。
#[async_trait]
pub trait RiskLimitsSource: Send + Sync {
    async fn current_snapshot(&self) -> Result<RiskSnapshot>;
}

/// 通知接收方（邮件/IM/webhook 等，尽力送达）
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, summary: &ExecutionSummary) -> Result<()>;
}
