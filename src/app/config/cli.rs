use super::groups::RetryConfig;
use super::serde_helpers::{
    load_env_enum, load_env_list, load_env_path_opt, load_env_string, load_env_var,
};
use super::{ConfigError, ConnectionSettings, EndpointKind, LogLevel};
use crate::reliability::RetryStrategy;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(author, version, about, long_about = None)]
#[serde(default)]
pub struct Config {
    /// HEC endpoint URLs (comma separated)
    #[arg(
        long,
        env = "HEC_URLS",
        value_delimiter = ',',
        default_value = "https://127.0.0.1:8088"
    )]
    pub urls: Vec<String>,

    /// HEC token
    #[arg(long, env = "HEC_TOKEN", default_value = "")]
    pub token: String,

    /// Collector endpoint (event or raw)
    #[arg(long, env = "HEC_ENDPOINT_KIND", default_value = "event")]
    pub endpoint_kind: EndpointKind,

    /// Channels opened against each discovered destination
    #[arg(long, env = "HEC_CHANNELS_PER_DESTINATION", default_value = "4")]
    pub channels_per_destination: usize,

    /// Upper bound on pool size (replacement may exceed it)
    #[arg(long, env = "HEC_MAX_TOTAL_CHANNELS", default_value = "8")]
    pub max_total_channels: usize,

    /// In-flight cap per channel
    #[arg(long, env = "HEC_MAX_UNACKED_PER_CHANNEL", default_value = "500")]
    pub max_unacked_per_channel: usize,

    /// How long a batch may wait for a channel, in milliseconds
    #[arg(long, env = "HEC_SEND_TIMEOUT_MS", default_value = "60000")]
    pub send_timeout_ms: u64,

    /// How long a batch may wait for its acknowledgement, in milliseconds
    #[arg(long, env = "HEC_ACK_TIMEOUT_MS", default_value = "300000")]
    pub ack_timeout_ms: u64,

    /// Ack poll interval in milliseconds
    #[arg(long, env = "HEC_ACK_POLL_MS", default_value = "1000")]
    pub ack_poll_ms: u64,

    /// Declare a channel dead when its oldest unacked batch is older than this (0 disables)
    #[arg(long, env = "HEC_UNRESPONSIVE_CHANNEL_DECOM_MS", default_value = "0")]
    pub unresponsive_channel_decom_ms: u64,

    /// Channel lifespan before scheduled replacement (0 disables)
    #[arg(long, env = "HEC_CHANNEL_DECOM_MS", default_value = "300000")]
    pub channel_decom_ms: u64,

    /// Flush buffered events once a batch exceeds this many bytes (0 sends every event)
    #[arg(long, env = "HEC_EVENT_BATCH_SIZE", default_value = "0")]
    pub event_batch_size: usize,

    /// Redrive attempts for retryable failures
    #[arg(long, env = "HEC_MAX_RETRIES", default_value = "10")]
    pub max_retries: u32,

    /// Base backoff between redrives, in milliseconds
    #[arg(long, env = "HEC_RETRY_BASE_DELAY_MS", default_value = "500")]
    pub retry_base_delay_ms: u64,

    /// Backoff growth between redrives
    #[arg(long, env = "HEC_RETRY_STRATEGY", value_enum, default_value = "exponential-backoff")]
    pub retry_strategy: RetryStrategy,

    /// Report checkpoints in batch order
    #[arg(long, env = "HEC_ENABLE_CHECKPOINTS")]
    pub enable_checkpoints: bool,

    /// Enable gzip compression for event posts
    #[arg(long, env = "HEC_ENABLE_COMPRESSION")]
    pub enable_compression: bool,

    /// Accept invalid TLS certificates (test clusters only)
    #[arg(long, env = "HEC_DISABLE_CERT_VALIDATION")]
    pub disable_cert_validation: bool,

    /// Per-request HTTP timeout in seconds
    #[arg(long, env = "HEC_REQUEST_TIMEOUT_SECS", default_value = "30")]
    pub request_timeout_secs: u64,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: LogLevel,

    /// Configuration file path (optional)
    #[arg(long, env = "HEC_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Retry configuration (derived, not exposed as CLI args)
    #[serde(skip)]
    #[arg(skip)]
    pub retry_config: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            urls: vec!["https://127.0.0.1:8088".to_string()],
            token: String::new(),
            endpoint_kind: EndpointKind::Event,
            channels_per_destination: 4,
            max_total_channels: 8,
            max_unacked_per_channel: 500,
            send_timeout_ms: 60_000,
            ack_timeout_ms: 300_000,
            ack_poll_ms: 1_000,
            unresponsive_channel_decom_ms: 0,
            channel_decom_ms: 300_000,
            event_batch_size: 0,
            max_retries: 10,
            retry_base_delay_ms: 500,
            retry_strategy: RetryStrategy::ExponentialBackoff,
            enable_checkpoints: false,
            enable_compression: false,
            disable_cert_validation: false,
            request_timeout_secs: 30,
            log_level: LogLevel::Info,
            config_file: None,
            retry_config: RetryConfig::default(),
        }
    }
}

impl Config {
    pub fn from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let mut config = Config::try_parse_from(args)
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;
        if let Some(path) = config.config_file.clone() {
            config = Self::from_file(path)?;
        }
        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        // A whole TOML document in HEC_CONFIG wins over individual variables
        if let Ok(raw) = std::env::var("HEC_CONFIG") {
            return Self::from_toml_str(&raw);
        }

        let mut config = Config::default();

        load_env_list("HEC_URLS", &mut config.urls);
        load_env_string("HEC_TOKEN", &mut config.token);
        load_env_enum("HEC_ENDPOINT_KIND", &mut config.endpoint_kind)?;
        load_env_var(
            "HEC_CHANNELS_PER_DESTINATION",
            &mut config.channels_per_destination,
        )?;
        load_env_var("HEC_MAX_TOTAL_CHANNELS", &mut config.max_total_channels)?;
        load_env_var(
            "HEC_MAX_UNACKED_PER_CHANNEL",
            &mut config.max_unacked_per_channel,
        )?;
        load_env_var("HEC_SEND_TIMEOUT_MS", &mut config.send_timeout_ms)?;
        load_env_var("HEC_ACK_TIMEOUT_MS", &mut config.ack_timeout_ms)?;
        load_env_var("HEC_ACK_POLL_MS", &mut config.ack_poll_ms)?;
        load_env_var(
            "HEC_UNRESPONSIVE_CHANNEL_DECOM_MS",
            &mut config.unresponsive_channel_decom_ms,
        )?;
        load_env_var("HEC_CHANNEL_DECOM_MS", &mut config.channel_decom_ms)?;
        load_env_var("HEC_EVENT_BATCH_SIZE", &mut config.event_batch_size)?;
        load_env_var("HEC_MAX_RETRIES", &mut config.max_retries)?;
        load_env_var("HEC_RETRY_BASE_DELAY_MS", &mut config.retry_base_delay_ms)?;
        load_env_enum("HEC_RETRY_STRATEGY", &mut config.retry_strategy)?;
        load_env_var("HEC_ENABLE_CHECKPOINTS", &mut config.enable_checkpoints)?;
        load_env_var("HEC_ENABLE_COMPRESSION", &mut config.enable_compression)?;
        load_env_var(
            "HEC_DISABLE_CERT_VALIDATION",
            &mut config.disable_cert_validation,
        )?;
        load_env_var("HEC_REQUEST_TIMEOUT_SECS", &mut config.request_timeout_secs)?;
        load_env_enum("LOG_LEVEL", &mut config.log_level)?;
        load_env_path_opt("HEC_CONFIG_FILE", &mut config.config_file);

        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(raw)?;
        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    pub fn post_process(&mut self) -> Result<(), ConfigError> {
        // Trim and de-duplicate URLs, keeping the configured order
        let mut seen = Vec::with_capacity(self.urls.len());
        for url in &self.urls {
            let url = url.trim().trim_end_matches('/').to_string();
            if !url.is_empty() && !seen.contains(&url) {
                seen.push(url);
            }
        }
        self.urls = seen;

        self.retry_config = RetryConfig {
            max_attempts: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            strategy: self.retry_strategy,
            ..RetryConfig::default()
        };

        Ok(())
    }

    pub fn parsed_urls(&self) -> Result<Vec<Url>, ConfigError> {
        self.urls
            .iter()
            .map(|raw| {
                Url::parse(raw)
                    .map_err(|e| ConfigError::InvalidUrl(format!("Invalid HEC URL '{raw}': {e}")))
            })
            .collect()
    }

    /// Runtime view of this configuration with durations resolved.
    pub fn to_settings(&self) -> Result<ConnectionSettings, ConfigError> {
        let non_zero = |ms: u64| (ms > 0).then_some(Duration::from_millis(ms));
        Ok(ConnectionSettings {
            urls: self.parsed_urls()?,
            token: self.token.clone(),
            endpoint_kind: self.endpoint_kind,
            channels_per_destination: self.channels_per_destination,
            max_total_channels: self.max_total_channels,
            max_unacked_per_channel: self.max_unacked_per_channel,
            send_timeout: Duration::from_millis(self.send_timeout_ms),
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            ack_poll_interval: Duration::from_millis(self.ack_poll_ms),
            unresponsive_channel_decom: non_zero(self.unresponsive_channel_decom_ms),
            channel_decom: non_zero(self.channel_decom_ms),
            event_batch_size: self.event_batch_size,
            enable_checkpoints: self.enable_checkpoints,
            enable_compression: self.enable_compression,
            disable_cert_validation: self.disable_cert_validation,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            retry: self.retry_config.clone(),
            ..ConnectionSettings::default()
        })
    }
}
