//! 执行结果通知
//!
//! 通知是尽力送达：发送失败只记 warn，不影响执行结果的持久化。

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use tracing::{info, warn};

use crate::trading::model::execution::{ExecutionOutcome, ExecutionSummary};
use crate::trading::provider::NotificationSink;

/// 通知中继，包一层错误吞噬
pub struct NotificationRelay {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl NotificationRelay {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }

    /// 逐个发送，单个通道失败不影响其余通道
    pub async fn dispatch(&self, summary: &ExecutionSummary) {
        for sink in &self.sinks {
            if let Err(e) = sink.send(summary).await {
                warn!(
                    "执行 {} 通知发送失败: {}",
                    summary.execution_id, e
                );
            }
        }
    }
}

/// Webhook 通知器，POST 完整的 ExecutionSummary JSON
/// 需要设置: NOTIFY_WEBHOOK_URL
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn from_env() -> Result<Self> {
        let url = std::env::var("NOTIFY_WEBHOOK_URL")
            .map_err(|_| anyhow::anyhow!("NOTIFY_WEBHOOK_URL not set"))?;
        Ok(Self {
            client: Client::new(),
            url,
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn send(&self, summary: &ExecutionSummary) -> Result<()> {
        let response = self.client.post(&self.url).json(summary).send().await?;
        if response.status().is_success() {
            info!("📨 执行 {} 通知已送达 webhook", summary.execution_id);
            Ok(())
        } else {
            let status = response.status();
            Err(anyhow::anyhow!("webhook 返回 {}", status))
        }
    }
}

/// 仅写日志的通知器，默认兜底
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn send(&self, summary: &ExecutionSummary) -> Result<()> {
        match &summary.outcome {
            ExecutionOutcome::Completed => info!(
                "✅ 任务 {} 执行完成: 信号 {} 条，下单 {} 笔，耗时 {} ms",
                summary.task_name, summary.total_signals, summary.orders.len(), summary.elapsed_ms
            ),
            ExecutionOutcome::Skipped(reason) => info!(
                "⏭️ 任务 {} 本轮跳过: {}",
                summary.task_name, reason
            ),
            ExecutionOutcome::Failed { stage, error } => warn!(
                "❌ 任务 {} 在 {:?} 阶段失败: {}",
                summary.task_name, stage, error
            ),
        }
        Ok(())
    }
}
