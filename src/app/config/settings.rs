use super::{EndpointKind, RetryConfig};
use std::time::Duration;
use url::Url;

/// Resolved connection settings shared by the pool, its channels and the
/// timeout checker.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub urls: Vec<Url>,
    pub token: String,
    pub endpoint_kind: EndpointKind,
    pub channels_per_destination: usize,
    pub max_total_channels: usize,
    pub max_unacked_per_channel: usize,
    pub send_timeout: Duration,
    pub ack_timeout: Duration,
    pub ack_poll_interval: Duration,
    pub unresponsive_channel_decom: Option<Duration>,
    pub channel_decom: Option<Duration>,
    pub event_batch_size: usize,
    pub enable_checkpoints: bool,
    pub enable_compression: bool,
    pub disable_cert_validation: bool,
    pub request_timeout: Duration,
    pub retry: RetryConfig,
    /// Pause between full unsuccessful round-robin sweeps.
    pub dispatch_backoff: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            token: String::new(),
            endpoint_kind: EndpointKind::Event,
            channels_per_destination: 4,
            max_total_channels: 8,
            max_unacked_per_channel: 500,
            send_timeout: Duration::from_secs(60),
            ack_timeout: Duration::from_secs(300),
            ack_poll_interval: Duration::from_secs(1),
            unresponsive_channel_decom: None,
            channel_decom: Some(Duration::from_secs(300)),
            event_batch_size: 0,
            enable_checkpoints: false,
            enable_compression: false,
            disable_cert_validation: false,
            request_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            dispatch_backoff: Duration::from_millis(100),
        }
    }
}
