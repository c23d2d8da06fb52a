//! 任务执行编排器
//!
//! 一次执行 = 数据拉取 -> 策略 -> 信号归一化 -> 仓位计算 ->
//! 订单级风控 -> 下单，最终产出一条 ExecutionSummary。
//! execute 不返回 Err：任何故障都折叠进摘要的 outcome 里。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::watch;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::trading::model::execution::{
    ExecutionOutcome, ExecutionSummary, OrderRecord, OrderState, PipelineStage, RiskSnapshot,
    SignalDirection, SignalRecord, SignalStatus, SymbolReport,
};
use crate::trading::model::task::ScheduledTask;
use crate::trading::provider::{
    CandleItem, DataProvider, OrderExecutor, OrderRequest, RiskLimitsSource, StrategyCandidate,
    StrategyRunner,
};

/// 流水线参数
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// 每个品种拉取的K线根数
    pub lookback: usize,
    /// 低于该置信度的信号直接丢弃
    pub min_confidence: f64,
    /// 单笔交易动用的权益比例
    pub risk_per_trade: f64,
    /// 单次外部调用超时
    pub call_timeout: Duration,
    /// 外部调用最大重试次数（不含首次）
    pub max_retries: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            lookback: 100,
            min_confidence: 0.3,
            risk_per_trade: 0.02,
            call_timeout: Duration::from_secs(10),
            max_retries: 2,
        }
    }
}

pub struct TaskManager {
    data: Arc<dyn DataProvider>,
    strategies: Arc<dyn StrategyRunner>,
    executor: Arc<dyn OrderExecutor>,
    risk: Arc<dyn RiskLimitsSource>,
    config: PipelineConfig,
}

/// 订单级风控的滚动账面，随本轮已放行的订单更新
struct ProjectedAccount {
    cash: f64,
    total_exposure: f64,
    symbol_exposure: BTreeMap<String, f64>,
}

impl ProjectedAccount {
    fn from_snapshot(snapshot: &RiskSnapshot) -> Self {
        Self {
            cash: snapshot.cash,
            total_exposure: snapshot.total_exposure,
            symbol_exposure: snapshot.positions.clone(),
        }
    }
}

impl TaskManager {
    pub fn new(
        data: Arc<dyn DataProvider>,
        strategies: Arc<dyn StrategyRunner>,
        executor: Arc<dyn OrderExecutor>,
        risk: Arc<dyn RiskLimitsSource>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            data,
            strategies,
            executor,
            risk,
            config,
        }
    }

    /// 带超时与有限重试地执行一次外部调用
    async fn call_with_retry<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let timeout = self.config.call_timeout;
        let strategy = ExponentialBackoff::from_millis(100)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(self.config.max_retries);
        let f = &f;
        Retry::spawn(strategy, move || async move {
            match tokio::time::timeout(timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("调用超时（{} 秒）", timeout.as_secs())),
            }
        })
        .await
    }

    /// 解析任务选择的策略清单，"all" 展开为全部可用策略
    fn resolve_strategies(&self, task: &ScheduledTask) -> Vec<String> {
        if task.wants_all_strategies() {
            self.strategies.available_strategies()
        } else {
            task.strategies.clone()
        }
    }

    /// 原始候选归一化为交易信号；raw_signal 为 0 视为无信号
    fn normalize(symbol: &str, candidate: &StrategyCandidate, last_close: f64) -> Option<SignalRecord> {
        if candidate.raw_signal == 0.0 {
            return None;
        }
        let direction = if candidate.raw_signal > 0.0 {
            SignalDirection::Buy
        } else {
            SignalDirection::Sell
        };
        Some(SignalRecord {
            symbol: symbol.to_string(),
            strategy: candidate.strategy.clone(),
            direction,
            confidence: candidate.confidence.clamp(0.0, 1.0),
            target_price: candidate.target_price.or(Some(last_close)),
            reasoning: candidate.reason.clone(),
            quantity: 0.0,
            status: SignalStatus::Dropped {
                reason: String::new(),
            },
        })
    }

    /// 依据账户权益与信号强度计算下单数量，卖出受持仓约束
    fn determine_quantity(
        &self,
        snapshot: &RiskSnapshot,
        signal: &SignalRecord,
        raw_strength: f64,
        price: f64,
    ) -> f64 {
        if price <= 0.0 || snapshot.equity <= 0.0 {
            return 0.0;
        }
        let strength = raw_strength.abs().clamp(0.0, 1.0);
        let budget = snapshot.equity * self.config.risk_per_trade * strength;
        let mut quantity = budget / price;
        if signal.direction == SignalDirection::Sell {
            let held = snapshot.symbol_exposure(&signal.symbol) / price;
            quantity = quantity.min(held);
        }
        if quantity < f64::EPSILON {
            0.0
        } else {
            quantity
        }
    }

    /// 订单级风控：单笔占比、现金储备、品种敞口、总敞口
    fn validate_order(
        account: &mut ProjectedAccount,
        snapshot: &RiskSnapshot,
        signal: &SignalRecord,
        price: f64,
    ) -> Result<(), String> {
        let notional = signal.quantity * price;
        let limits = &snapshot.limits;

        let trade_ratio = notional / snapshot.equity;
        if trade_ratio > limits.max_single_trade_ratio {
            return Err(format!(
                "单笔占比 {:.4} 超过上限 {:.4}",
                trade_ratio, limits.max_single_trade_ratio
            ));
        }

        match signal.direction {
            SignalDirection::Buy => {
                let reserve = snapshot.equity * limits.min_cash_reserve_ratio;
                if account.cash - notional < reserve {
                    return Err(format!(
                        "买入后现金 {:.2} 低于储备要求 {:.2}",
                        account.cash - notional,
                        reserve
                    ));
                }
                let symbol_after = account
                    .symbol_exposure
                    .get(&signal.symbol)
                    .copied()
                    .unwrap_or(0.0)
                    + notional;
                if symbol_after / snapshot.equity > limits.max_symbol_exposure_ratio {
                    return Err(format!(
                        "品种 {} 买入后敞口占比 {:.4} 超过上限 {:.4}",
                        signal.symbol,
                        symbol_after / snapshot.equity,
                        limits.max_symbol_exposure_ratio
                    ));
                }
                let total_after = account.total_exposure + notional;
                if total_after / snapshot.equity > limits.max_total_exposure_ratio {
                    return Err(format!(
                        "买入后总敞口占比 {:.4} 超过上限 {:.4}",
                        total_after / snapshot.equity,
                        limits.max_total_exposure_ratio
                    ));
                }
                account.cash -= notional;
                account.total_exposure = total_after;
                *account
                    .symbol_exposure
                    .entry(signal.symbol.clone())
                    .or_insert(0.0) += notional;
            }
            SignalDirection::Sell => {
                account.cash += notional;
                account.total_exposure = (account.total_exposure - notional).max(0.0);
                if let Some(exposure) = account.symbol_exposure.get_mut(&signal.symbol) {
                    *exposure = (*exposure - notional).max(0.0);
                }
            }
        }
        Ok(())
    }

    /// 执行一次任务，无论成败都返回完整的执行摘要
    pub async fn execute(
        &self,
        task: &ScheduledTask,
        stop_rx: &watch::Receiver<bool>,
    ) -> ExecutionSummary {
        let started_at = Utc::now();
        let start = std::time::Instant::now();
        let execution_id = Uuid::new_v4();
        info!("开始执行任务 {} ({})", task.name, execution_id);

        // 每轮全新状态，不携带上一轮的残留
        let mut symbols: BTreeMap<String, SymbolReport> = task
            .symbols
            .iter()
            .map(|s| (s.clone(), SymbolReport::default()))
            .collect();
        let task_errors: Vec<String> = Vec::new();

        let strategy_ids = self.resolve_strategies(task);

        // 阶段一：行情拉取，单品种失败不中断
        let mut series_by_symbol: BTreeMap<String, Vec<CandleItem>> = BTreeMap::new();
        for symbol in task.symbols.iter() {
            let fetched = self
                .call_with_retry(|| self.data.fetch_recent(symbol, self.config.lookback))
                .await;
            match fetched {
                Ok(series) if !series.is_empty() => {
                    series_by_symbol.insert(symbol.clone(), series);
                }
                Ok(_) => {
                    let msg = "行情数据为空".to_string();
                    warn!("品种 {} {}", symbol, msg);
                    if let Some(report) = symbols.get_mut(symbol) {
                        report.errors.push(msg);
                    }
                }
                Err(e) => {
                    let msg = format!("行情拉取失败: {}", e);
                    warn!("品种 {} {}", symbol, msg);
                    if let Some(report) = symbols.get_mut(symbol) {
                        report.errors.push(msg);
                    }
                }
            }
        }
        if series_by_symbol.is_empty() {
            error!("任务 {} 所有品种行情拉取失败", task.task_id);
            return self.finish(
                execution_id,
                task,
                started_at,
                start,
                ExecutionOutcome::Failed {
                    stage: PipelineStage::DataFetch,
                    error: "所有品种行情拉取失败".to_string(),
                },
                symbols,
                Vec::new(),
                None,
                task_errors,
            );
        }

        // 阶段二/三：策略运行与信号归一化
        struct Pending {
            signal: SignalRecord,
            raw_strength: f64,
            price: f64,
        }
        let mut pending: Vec<Pending> = Vec::new();
        for (symbol, series) in &series_by_symbol {
            let last_close = series.last().map(|c| c.close).unwrap_or(0.0);
            for strategy_id in &strategy_ids {
                let run = self
                    .call_with_retry(|| self.strategies.run(strategy_id, symbol, series))
                    .await;
                match run {
                    Ok(Some(candidate)) => {
                        if let Some(signal) = Self::normalize(symbol, &candidate, last_close) {
                            let price = signal.target_price.unwrap_or(last_close);
                            pending.push(Pending {
                                signal,
                                raw_strength: candidate.raw_signal,
                                price,
                            });
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        let msg = format!("策略 {} 执行失败: {}", strategy_id, e);
                        warn!("品种 {} {}", symbol, msg);
                        if let Some(report) = symbols.get_mut(symbol) {
                            report.errors.push(msg);
                        }
                    }
                }
            }
        }

        // 阶段四/五需要最新账户快照；快照拿不到属于阶段级失败
        let snapshot = match self
            .call_with_retry(|| self.risk.current_snapshot())
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("任务 {} 风控快照获取失败: {}", task.task_id, e);
                return self.finish(
                    execution_id,
                    task,
                    started_at,
                    start,
                    ExecutionOutcome::Failed {
                        stage: PipelineStage::RiskValidation,
                        error: format!("风控快照获取失败: {}", e),
                    },
                    symbols,
                    Vec::new(),
                    None,
                    task_errors,
                );
            }
        };

        // 阶段四：仓位计算与置信度过滤
        let mut account = ProjectedAccount::from_snapshot(&snapshot);
        let mut to_submit: Vec<(SignalRecord, f64)> = Vec::new();
        let mut orders: Vec<OrderRecord> = Vec::new();
        for mut item in pending {
            if item.signal.confidence < self.config.min_confidence {
                item.signal.status = SignalStatus::Dropped {
                    reason: format!(
                        "置信度 {:.2} 低于阈值 {:.2}",
                        item.signal.confidence, self.config.min_confidence
                    ),
                };
                record_signal(&mut symbols, item.signal);
                continue;
            }
            let quantity =
                self.determine_quantity(&snapshot, &item.signal, item.raw_strength, item.price);
            if quantity <= 0.0 {
                item.signal.status = SignalStatus::Rejected {
                    reason: "无法确定可执行数量".to_string(),
                };
                record_signal(&mut symbols, item.signal);
                continue;
            }
            item.signal.quantity = quantity;

            // 阶段五：订单级风控
            match Self::validate_order(&mut account, &snapshot, &item.signal, item.price) {
                Ok(()) => to_submit.push((item.signal, item.price)),
                Err(reason) => {
                    warn!("品种 {} 订单被风控拒绝: {}", item.signal.symbol, reason);
                    item.signal.status = SignalStatus::Rejected { reason };
                    record_signal(&mut symbols, item.signal);
                }
            }
        }

        // 阶段六：下单。停止信号出现后不再提交新订单
        for (mut signal, price) in to_submit {
            if *stop_rx.borrow() {
                signal.status = SignalStatus::Rejected {
                    reason: "调度器停止信号".to_string(),
                };
                orders.push(OrderRecord {
                    symbol: signal.symbol.clone(),
                    direction: signal.direction,
                    quantity: signal.quantity,
                    reference_price: price,
                    broker_order_id: None,
                    status: OrderState::Cancelled,
                    reason: Some("调度器停止信号".to_string()),
                    submitted_at: None,
                });
                record_signal(&mut symbols, signal);
                continue;
            }

            let request = OrderRequest {
                symbol: signal.symbol.clone(),
                direction: signal.direction,
                quantity: signal.quantity,
                reference_price: price,
            };
            let submitted_at = Utc::now();
            match self.call_with_retry(|| self.executor.submit(&request)).await {
                Ok(ack) => {
                    info!(
                        "品种 {} 下单成功: {} {:?} {:.4} @ {:.2}",
                        signal.symbol, ack.broker_order_id, signal.direction, signal.quantity, price
                    );
                    orders.push(OrderRecord {
                        symbol: signal.symbol.clone(),
                        direction: signal.direction,
                        quantity: signal.quantity,
                        reference_price: price,
                        broker_order_id: Some(ack.broker_order_id),
                        status: ack.status,
                        reason: None,
                        submitted_at: Some(submitted_at),
                    });
                    if let Some(report) = symbols.get_mut(&signal.symbol) {
                        report.order_count += 1;
                    }
                    signal.status = SignalStatus::Executed;
                }
                Err(e) => {
                    // 单笔下单失败不连累其他订单
                    error!("品种 {} 下单失败: {}", signal.symbol, e);
                    orders.push(OrderRecord {
                        symbol: signal.symbol.clone(),
                        direction: signal.direction,
                        quantity: signal.quantity,
                        reference_price: price,
                        broker_order_id: None,
                        status: OrderState::Failed,
                        reason: Some(e.to_string()),
                        submitted_at: Some(submitted_at),
                    });
                    signal.status = SignalStatus::Rejected {
                        reason: format!("下单失败: {}", e),
                    };
                }
            }
            record_signal(&mut symbols, signal);
        }

        self.finish(
            execution_id,
            task,
            started_at,
            start,
            ExecutionOutcome::Completed,
            symbols,
            orders,
            Some(snapshot),
            task_errors,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        execution_id: Uuid,
        task: &ScheduledTask,
        started_at: chrono::DateTime<Utc>,
        start: std::time::Instant,
        outcome: ExecutionOutcome,
        symbols: BTreeMap<String, SymbolReport>,
        orders: Vec<OrderRecord>,
        risk_snapshot: Option<RiskSnapshot>,
        mut task_errors: Vec<String>,
    ) -> ExecutionSummary {
        if let ExecutionOutcome::Failed { error, .. } = &outcome {
            task_errors.push(error.clone());
        }
        let mut executed_signals = 0;
        let mut rejected_signals = 0;
        let mut total_signals = 0;
        for report in symbols.values() {
            for signal in &report.signals {
                total_signals += 1;
                match signal.status {
                    SignalStatus::Executed => executed_signals += 1,
                    SignalStatus::Rejected { .. } => rejected_signals += 1,
                    SignalStatus::Dropped { .. } => {}
                }
            }
        }
        ExecutionSummary {
            execution_id,
            task_id: task.task_id.clone(),
            task_name: task.name.clone(),
            started_at,
            completed_at: Utc::now(),
            outcome,
            symbols,
            orders,
            executed_signals,
            rejected_signals,
            total_signals,
            risk_snapshot,
            task_errors,
            elapsed_ms: start.elapsed().as_millis() as i64,
        }
    }
}

fn record_signal(symbols: &mut BTreeMap<String, SymbolReport>, signal: SignalRecord) {
    symbols
        .entry(signal.symbol.clone())
        .or_default()
        .signals
        .push(signal);
}
