//! 进程内模拟协作方
//!
//! 模拟券商维护内存账户与持仓，订单按参考价立即成交；
//! 用于默认装配与测试替身，不连接任何真实网络。

use std::collections::{BTreeMap, HashMap};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::info;

use crate::trading::model::execution::{OrderState, RiskLimits, RiskSnapshot, SignalDirection};
use crate::trading::provider::{
    CandleItem, DataProvider, OrderAck, OrderExecutor, OrderRequest, RiskLimitsSource,
    StrategyCandidate, StrategyRunner,
};

const SIM_COMMISSION_RATE: f64 = 0.001;

#[derive(Debug)]
struct SimPosition {
    quantity: f64,
    last_price: f64,
}

#[derive(Debug)]
struct BrokerState {
    cash: f64,
    positions: HashMap<String, SimPosition>,
    order_seq: u64,
    orders: HashMap<String, OrderState>,
}

/// 模拟券商：同时充当订单执行方与风险限额来源
pub struct SimulationBroker {
    state: Mutex<BrokerState>,
    limits: RiskLimits,
}

impl SimulationBroker {
    pub fn new(initial_capital: f64) -> Self {
        Self::with_limits(initial_capital, RiskLimits::default())
    }

    pub fn with_limits(initial_capital: f64, limits: RiskLimits) -> Self {
        Self {
            state: Mutex::new(BrokerState {
                cash: initial_capital,
                positions: HashMap::new(),
                order_seq: 0,
                orders: HashMap::new(),
            }),
            limits,
        }
    }

    /// 测试用：直接建仓
    pub async fn seed_position(&self, symbol: &str, quantity: f64, price: f64) {
        let mut state = self.state.lock().await;
        state.positions.insert(
            symbol.to_string(),
            SimPosition {
                quantity,
                last_price: price,
            },
        );
    }
}

#[async_trait]
impl OrderExecutor for SimulationBroker {
    async fn submit(&self, order: &OrderRequest) -> Result<OrderAck> {
        let mut state = self.state.lock().await;

        let trade_value = order.quantity * order.reference_price;
        let commission = trade_value * SIM_COMMISSION_RATE;

        match order.direction {
            SignalDirection::Buy => {
                let total = trade_value + commission;
                if total > state.cash {
                    return Err(anyhow!(
                        "现金不足: 需要 {:.2}, 可用 {:.2}",
                        total,
                        state.cash
                    ));
                }
                state.cash -= total;
                let position = state
                    .positions
                    .entry(order.symbol.clone())
                    .or_insert(SimPosition {
                        quantity: 0.0,
                        last_price: order.reference_price,
                    });
                position.quantity += order.quantity;
                position.last_price = order.reference_price;
            }
            SignalDirection::Sell => {
                let held = state
                    .positions
                    .get(&order.symbol)
                    .map(|p| p.quantity)
                    .unwrap_or(0.0);
                if held < order.quantity {
                    return Err(anyhow!(
                        "持仓不足: {} 可卖 {}, 请求 {}",
                        order.symbol,
                        held,
                        order.quantity
                    ));
                }
                state.cash += trade_value - commission;
                if let Some(position) = state.positions.get_mut(&order.symbol) {
                    position.quantity -= order.quantity;
                    position.last_price = order.reference_price;
                }
            }
        }

        state.order_seq += 1;
        let broker_order_id = format!("SIM-{:06}", state.order_seq);
        state
            .orders
            .insert(broker_order_id.clone(), OrderState::Filled);
        info!(
            "模拟成交: {} {:?} x{} @ {:.2} ({})",
            order.symbol, order.direction, order.quantity, order.reference_price, broker_order_id
        );

        Ok(OrderAck {
            broker_order_id,
            status: OrderState::Filled,
        })
    }

    async fn get_status(&self, broker_order_id: &str) -> Result<OrderState> {
        let state = self.state.lock().await;
        state
            .orders
            .get(broker_order_id)
            .copied()
            .ok_or_else(|| anyhow!("订单不存在: {}", broker_order_id))
    }
}

#[async_trait]
impl RiskLimitsSource for SimulationBroker {
    async fn current_snapshot(&self) -> Result<RiskSnapshot> {
        let state = self.state.lock().await;
        let mut positions = BTreeMap::new();
        let mut total_exposure = 0.0;
        for (symbol, position) in &state.positions {
            let value = position.quantity * position.last_price;
            if value > 0.0 {
                positions.insert(symbol.clone(), value);
                total_exposure += value;
            }
        }
        Ok(RiskSnapshot {
            equity: state.cash + total_exposure,
            cash: state.cash,
            total_exposure,
            positions,
            limits: self.limits.clone(),
            captured_at: Utc::now(),
        })
    }
}

/// 确定性合成行情：按品种名派生基准价，叠加正弦波动
pub struct SimulatedDataProvider;

impl SimulatedDataProvider {
    fn base_price(symbol: &str) -> f64 {
        let seed: u32 = symbol.bytes().map(u32::from).sum();
        50.0 + f64::from(seed % 400)
    }
}

#[async_trait]
impl DataProvider for SimulatedDataProvider {
    async fn fetch_recent(&self, symbol: &str, lookback: usize) -> Result<Vec<CandleItem>> {
        let base = Self::base_price(symbol);
        let now_ms = Utc::now().timestamp_millis();
        let step_ms: i64 = 60_000;

        let mut series = Vec::with_capacity(lookback);
        for i in 0..lookback {
            let phase = i as f64 / 10.0;
            let close = base * (1.0 + 0.01 * phase.sin());
            let open = base * (1.0 + 0.01 * (phase - 0.1).sin());
            let high = open.max(close) * 1.002;
            let low = open.min(close) * 0.998;
            let ts = now_ms - step_ms * (lookback - i) as i64;
            series.push(CandleItem::new(ts, open, high, low, close, 1_000.0)?);
        }
        Ok(series)
    }
}

/// 简单动量探针：收盘价偏离均值时给出方向信号
///
/// 仅用于默认装配与测试，真实策略算法在本 crate 之外。
pub struct SimulatedStrategyRunner {
    strategies: Vec<String>,
}

impl SimulatedStrategyRunner {
    pub fn new() -> Self {
        Self {
            strategies: vec!["momentum_probe".to_string()],
        }
    }
}

impl Default for SimulatedStrategyRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StrategyRunner for SimulatedStrategyRunner {
    async fn run(
        &self,
        strategy_id: &str,
        symbol: &str,
        series: &[CandleItem],
    ) -> Result<Option<StrategyCandidate>> {
        if series.len() < 2 {
            return Err(anyhow!("{} 行情数据不足", symbol));
        }

        let mean: f64 = series.iter().map(|c| c.close).sum::<f64>() / series.len() as f64;
        let last = series.last().map(|c| c.close).unwrap_or(mean);
        let deviation = (last - mean) / mean;

        if deviation.abs() < 1e-4 {
            return Ok(None);
        }

        let direction = if deviation > 0.0 { "BUY" } else { "SELL" };
        Ok(Some(StrategyCandidate {
            strategy: strategy_id.to_string(),
            raw_signal: deviation.signum(),
            confidence: (deviation.abs() * 200.0).min(1.0),
            target_price: Some(last),
            reason: format!("{} 偏离均值 {:.3}%，给出 {} 信号", symbol, deviation * 100.0, direction),
        }))
    }

    fn available_strategies(&self) -> Vec<String> {
        self.strategies.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_buy_then_snapshot_reflects_position() {
        let broker = SimulationBroker::new(100_000.0);
        let ack = broker
            .submit(&OrderRequest {
                symbol: "AAPL".to_string(),
                direction: SignalDirection::Buy,
                quantity: 10.0,
                reference_price: 100.0,
            })
            .await
            .unwrap();
        assert_eq!(ack.status, OrderState::Filled);
        assert_eq!(broker.get_status(&ack.broker_order_id).await.unwrap(), OrderState::Filled);

        let snapshot = broker.current_snapshot().await.unwrap();
        assert_eq!(snapshot.symbol_exposure("AAPL"), 1_000.0);
        assert!(snapshot.cash < 99_001.0);
    }

    #[tokio::test]
    async fn test_sell_without_position_rejected() {
        let broker = SimulationBroker::new(10_000.0);
        let result = broker
            .submit(&OrderRequest {
                symbol: "MSFT".to_string(),
                direction: SignalDirection::Sell,
                quantity: 5.0,
                reference_price: 200.0,
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_simulated_series_is_ordered() {
        let provider = SimulatedDataProvider;
        let series = provider.fetch_recent("AAPL", 30).await.unwrap();
        assert_eq!(series.len(), 30);
        assert!(series.windows(2).all(|w| w[0].ts < w[1].ts));
    }
}
