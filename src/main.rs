use std::sync::Arc;

use anyhow::Result;
use dotenv::dotenv;
use tracing::{error, info};

use auto_trader::app_config::env::{env_is_true, env_or_default, env_parse_or};
use auto_trader::app_config::log::setup_logging;
use auto_trader::job::task_scheduler::TradingScheduler;
use auto_trader::time_util::{parse_hm, DEFAULT_DAILY_ANCHOR};
use auto_trader::trading::guard::risk_precondition::RiskPreconditionGuard;
use auto_trader::trading::guard::trading_window::{TradingWindowGuard, TradingWindowPolicy};
use auto_trader::trading::guard::{Guard, GuardChain};
use auto_trader::trading::provider::simulation::{
    SimulatedDataProvider, SimulatedStrategyRunner, SimulationBroker,
};
use auto_trader::trading::provider::NotificationSink;
use auto_trader::trading::services::notification::{LogNotifier, NotificationRelay, WebhookNotifier};
use auto_trader::trading::services::registry::{JsonFileConfigStore, TaskRegistry};
use auto_trader::trading::services::repository::InMemoryExecutionRepository;
use auto_trader::trading::task::task_manager::{PipelineConfig, TaskManager};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let _log_guards = setup_logging()?;

    // 交易时间窗配置，加载失败直接退出
    let window_path = env_or_default("TRADING_WINDOW_CONFIG", "config/trading_window.json");
    let window_policy = TradingWindowPolicy::load(&window_path).await?;

    // 默认接入模拟券商；真实券商实现 OrderExecutor/RiskLimitsSource 后在此替换
    let initial_capital: f64 = env_parse_or("SIM_INITIAL_CAPITAL", 100_000.0);
    let broker = Arc::new(SimulationBroker::new(initial_capital));

    let guards = GuardChain::new(vec![
        Arc::new(TradingWindowGuard::new(window_policy)) as Arc<dyn Guard>,
        Arc::new(RiskPreconditionGuard::new(broker.clone())),
    ]);

    let manager = Arc::new(TaskManager::new(
        Arc::new(SimulatedDataProvider),
        Arc::new(SimulatedStrategyRunner::new()),
        broker.clone(),
        broker,
        PipelineConfig {
            risk_per_trade: env_parse_or("RISK_PER_TRADE", 0.02),
            min_confidence: env_parse_or("MIN_SIGNAL_CONFIDENCE", 0.3),
            ..PipelineConfig::default()
        },
    ));

    let tasks_path = env_or_default("TASKS_CONFIG", "config/tasks.json");
    let registry = Arc::new(TaskRegistry::load(Arc::new(JsonFileConfigStore::new(tasks_path))).await?);

    let mut sinks: Vec<Arc<dyn NotificationSink>> = vec![Arc::new(LogNotifier)];
    if env_is_true("NOTIFY_WEBHOOK_ENABLED", true) {
        match WebhookNotifier::from_env() {
            Ok(webhook) => sinks.push(Arc::new(webhook)),
            Err(e) => info!("webhook 通知未启用: {}", e),
        }
    } else {
        info!("webhook 通知已通过 NOTIFY_WEBHOOK_ENABLED 关闭");
    }

    let anchor = parse_hm(&env_or_default("DAILY_ANCHOR", DEFAULT_DAILY_ANCHOR))?;
    let scheduler = TradingScheduler::new(
        registry,
        Arc::new(guards),
        manager,
        Arc::new(InMemoryExecutionRepository::default()),
        Arc::new(NotificationRelay::new(sinks)),
        anchor,
    );

    let status = scheduler.start().await;
    info!("调度器状态: {}", status);

    // 捕捉 Ctrl+C 信号以平滑关闭
    tokio::signal::ctrl_c().await?;
    info!("收到退出信号，开始平滑关闭");
    let status = scheduler.stop().await;
    if status.in_flight > 0 {
        error!("仍有 {} 个执行未结束", status.in_flight);
    }
    info!("调度器已退出: {}", status);

    Ok(())
}
