//! Configuration Module
//!
//! Handles configuration loading from YAML files, environment variables,
//! and command-line arguments, in that precedence order (CLI wins).

use crate::policy::TierOverride;
use crate::types::SubscriptionTier;
use crate::{QuotaError, Result};
use clap::{Arg, Command};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Custom deserializer for Duration from string format like "30s", "5m", "24h"
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty duration string".to_string());
        }

        let mut num_end = 0;
        for (i, c) in s.chars().enumerate() {
            if c.is_ascii_digit() || c == '.' {
                num_end = i + 1;
            } else {
                break;
            }
        }

        if num_end == 0 {
            return Err(format!("No number found in duration string: {}", s));
        }

        let value: f64 = s[..num_end]
            .parse()
            .map_err(|e| format!("Failed to parse number '{}': {}", &s[..num_end], e))?;

        let duration = match s[num_end..].trim() {
            "ms" | "millis" => Duration::from_secs_f64(value / 1000.0),
            "" | "s" | "sec" | "secs" | "second" | "seconds" => Duration::from_secs_f64(value),
            "m" | "min" | "mins" | "minute" | "minutes" => Duration::from_secs_f64(value * 60.0),
            "h" | "hr" | "hour" | "hours" => Duration::from_secs_f64(value * 3600.0),
            "d" | "day" | "days" => Duration::from_secs_f64(value * 86400.0),
            unit => return Err(format!("Unknown duration unit: {}", unit)),
        };
        Ok(duration)
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bearer token required by the admin sweep endpoint.
    #[serde(default = "default_admin_token")]
    pub admin_token: String,
    #[serde(default = "default_shutdown_timeout", with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

fn default_bind_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_admin_token() -> String {
    "change-me".to_string()
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
            admin_token: default_admin_token(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Rate limiter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_attempts_per_window")]
    pub max_attempts_per_window: u32,
    #[serde(default = "default_rate_window", with = "duration_serde")]
    pub window: Duration,
}

fn default_max_attempts_per_window() -> u32 {
    10
}

fn default_rate_window() -> Duration {
    Duration::from_secs(60)
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts_per_window: default_max_attempts_per_window(),
            window: default_rate_window(),
        }
    }
}

/// Admission gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    #[serde(default = "default_admission_timeout", with = "duration_serde")]
    pub admission_timeout: Duration,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Per-tier limit overrides layered onto the built-in defaults.
    #[serde(default)]
    pub tiers: HashMap<SubscriptionTier, TierOverride>,
}

fn default_admission_timeout() -> Duration {
    Duration::from_secs(2)
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            admission_timeout: default_admission_timeout(),
            rate_limit: RateLimitConfig::default(),
            tiers: HashMap::new(),
        }
    }
}

/// Background flusher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushConfig {
    #[serde(default = "default_flush_interval", with = "duration_serde")]
    pub interval: Duration,
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(5)
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            interval: default_flush_interval(),
        }
    }
}

/// Upload retry coordinator defaults; callers may override per batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay", with = "duration_serde")]
    pub base_delay: Duration,
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,
    #[serde(default = "default_attempt_timeout", with = "duration_serde")]
    pub attempt_timeout: Duration,
}

fn default_max_parallel() -> usize {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_millis(1000)
}

fn default_max_delay() -> Duration {
    Duration::from_millis(10000)
}

fn default_attempt_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            max_retries: default_max_retries(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            attempt_timeout: default_attempt_timeout(),
        }
    }
}

/// Cleanup reconciler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sweep_interval", with = "duration_serde")]
    pub sweep_interval: Duration,
    #[serde(default = "default_stale_threshold", with = "duration_serde")]
    pub stale_threshold: Duration,
    #[serde(default = "default_blob_prefix")]
    pub blob_prefix: String,
}

fn default_true() -> bool {
    true
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(3600)
}

fn default_stale_threshold() -> Duration {
    Duration::from_secs(86400)
}

fn default_blob_prefix() -> String {
    "uploads/".to_string()
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            sweep_interval: default_sweep_interval(),
            stale_threshold: default_stale_threshold(),
            blob_prefix: default_blob_prefix(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// When set, application logs also roll into hourly files here.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_dir: None,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub flush: FlushConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from CLI args, config file, and environment
    pub fn load() -> Result<Self> {
        let matches = Self::build_cli().get_matches();

        let mut config = Self::default();

        if let Some(config_path) = matches.get_one::<String>("config") {
            config = Self::load_from_file(config_path)?;
        }

        config.apply_env_overrides();
        config.apply_cli_overrides(&matches);
        config.validate()?;

        info!(
            bind = %config.server.bind_addr,
            port = config.server.port,
            flush_interval_secs = config.flush.interval.as_secs(),
            sweep_interval_secs = config.cleanup.sweep_interval.as_secs(),
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            QuotaError::ConfigError(format!("Failed to read config file {}: {}", path, e))
        })?;
        let config: Config = serde_yaml::from_str(&content).map_err(|e| {
            QuotaError::ConfigError(format!("Failed to parse config file {}: {}", path, e))
        })?;
        Ok(config)
    }

    fn build_cli() -> Command {
        Command::new("quota-engine")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Storage quota admission and upload-reliability engine")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path"),
            )
            .arg(
                Arg::new("port")
                    .long("port")
                    .value_name("PORT")
                    .help("HTTP port (default: 8080)"),
            )
            .arg(
                Arg::new("bind-addr")
                    .long("bind-addr")
                    .value_name("ADDR")
                    .help("Bind address (default: 127.0.0.1)"),
            )
            .arg(
                Arg::new("flush-interval")
                    .long("flush-interval")
                    .value_name("DURATION")
                    .help("Usage flush interval, e.g. 5s (default: 5s)"),
            )
            .arg(
                Arg::new("sweep-interval")
                    .long("sweep-interval")
                    .value_name("DURATION")
                    .help("Cleanup sweep interval, e.g. 1h (default: 1h)"),
            )
            .arg(
                Arg::new("cleanup-enabled")
                    .long("cleanup-enabled")
                    .value_name("BOOL")
                    .help("Enable the periodic cleanup sweep (default: true)"),
            )
            .arg(
                Arg::new("log-level")
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level filter (default: info)"),
            )
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("QUOTA_ENGINE_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }

        if let Ok(addr) = std::env::var("QUOTA_ENGINE_BIND_ADDR") {
            self.server.bind_addr = addr;
        }

        if let Ok(token) = std::env::var("QUOTA_ENGINE_ADMIN_TOKEN") {
            self.server.admin_token = token;
        }

        if let Ok(interval) = std::env::var("QUOTA_ENGINE_FLUSH_INTERVAL") {
            if let Ok(interval) = duration_serde::parse_duration(&interval) {
                self.flush.interval = interval;
            }
        }

        if let Ok(interval) = std::env::var("QUOTA_ENGINE_SWEEP_INTERVAL") {
            if let Ok(interval) = duration_serde::parse_duration(&interval) {
                self.cleanup.sweep_interval = interval;
            }
        }

        if let Ok(enabled) = std::env::var("QUOTA_ENGINE_CLEANUP_ENABLED") {
            self.cleanup.enabled = enabled.to_lowercase() == "true";
        }

        if let Ok(level) = std::env::var("QUOTA_ENGINE_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    pub fn apply_cli_overrides(&mut self, matches: &clap::ArgMatches) {
        if let Some(port) = matches.get_one::<String>("port") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }

        if let Some(addr) = matches.get_one::<String>("bind-addr") {
            self.server.bind_addr = addr.clone();
        }

        if let Some(interval) = matches.get_one::<String>("flush-interval") {
            if let Ok(interval) = duration_serde::parse_duration(interval) {
                self.flush.interval = interval;
            }
        }

        if let Some(interval) = matches.get_one::<String>("sweep-interval") {
            if let Ok(interval) = duration_serde::parse_duration(interval) {
                self.cleanup.sweep_interval = interval;
            }
        }

        if let Some(enabled) = matches.get_one::<String>("cleanup-enabled") {
            self.cleanup.enabled = enabled.to_lowercase() == "true";
        }

        if let Some(level) = matches.get_one::<String>("log-level") {
            self.logging.level = level.clone();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.flush.interval.is_zero() {
            return Err(QuotaError::ConfigError(
                "flush.interval must be greater than zero".to_string(),
            ));
        }
        if self.quota.admission_timeout.is_zero() {
            return Err(QuotaError::ConfigError(
                "quota.admission_timeout must be greater than zero".to_string(),
            ));
        }
        if self.quota.rate_limit.max_attempts_per_window == 0 {
            return Err(QuotaError::ConfigError(
                "quota.rate_limit.max_attempts_per_window must be greater than zero".to_string(),
            ));
        }
        if self.upload.max_parallel == 0 {
            return Err(QuotaError::ConfigError(
                "upload.max_parallel must be greater than zero".to_string(),
            ));
        }
        if self.upload.max_retries == 0 {
            return Err(QuotaError::ConfigError(
                "upload.max_retries must be greater than zero".to_string(),
            ));
        }
        if self.upload.base_delay > self.upload.max_delay {
            return Err(QuotaError::ConfigError(
                "upload.base_delay must not exceed upload.max_delay".to_string(),
            ));
        }
        if self.cleanup.blob_prefix.is_empty() {
            return Err(QuotaError::ConfigError(
                "cleanup.blob_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
