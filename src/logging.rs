//! Logging Module
//!
//! Initializes the tracing subscriber for application logs: stdout always,
//! plus hourly rolling files when a log directory is configured.

use crate::config::LoggingConfig;
use crate::{QuotaError, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global subscriber. Returns the appender guard when file
/// logging is enabled; the caller must hold it for the process lifetime or
/// buffered lines are lost on exit.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    match &config.log_dir {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir).map_err(|e| {
                QuotaError::ConfigError(format!(
                    "Failed to create log directory {:?}: {}",
                    log_dir, e
                ))
            })?;
            let appender =
                RollingFileAppender::new(Rotation::HOURLY, log_dir, "quota-engine.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);

            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false),
                )
                .try_init()
                .map_err(|e| {
                    QuotaError::ConfigError(format!("Failed to init logging: {}", e))
                })?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .try_init()
                .map_err(|e| {
                    QuotaError::ConfigError(format!("Failed to init logging: {}", e))
                })?;
            Ok(None)
        }
    }
}
