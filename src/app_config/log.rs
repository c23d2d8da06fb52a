use std::env;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, FmtSubscriber, Layer, Registry};

use crate::app_config::env::env_or_default;

/// 日志文件句柄，需在进程生命周期内持有，否则丢失缓冲日志
pub struct LogGuards {
    _info_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
    _error_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

// 设置日志
pub fn setup_logging() -> anyhow::Result<LogGuards> {
    let app_env = env_or_default("APP_ENV", "LOCAL");

    if app_env == "LOCAL" {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(Level::INFO)
            .with_ansi(true)
            .with_target(false)
            .with_thread_ids(true)
            .with_level(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
        Ok(LogGuards {
            _info_guard: None,
            _error_guard: None,
        })
    } else {
        let log_dir = env::var("LOG_DIR").unwrap_or_else(|_| "log_files".to_string());
        let info_file = RollingFileAppender::new(Rotation::DAILY, &log_dir, "info.log");
        let error_file = RollingFileAppender::new(Rotation::DAILY, &log_dir, "error.log");

        let (info_non_blocking, info_guard) = tracing_appender::non_blocking(info_file);
        let (error_non_blocking, error_guard) = tracing_appender::non_blocking(error_file);

        let subscriber = Registry::default()
            .with(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_thread_ids(true)
                    .with_level(true)
                    .with_writer(info_non_blocking)
                    .with_filter(EnvFilter::new("info")),
            )
            .with(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_thread_ids(true)
                    .with_level(true)
                    .with_writer(error_non_blocking)
                    .with_filter(EnvFilter::new("error")),
            );

        tracing::subscriber::set_global_default(subscriber)?;
        Ok(LogGuards {
            _info_guard: Some(info_guard),
            _error_guard: Some(error_guard),
        })
    }
}
