use super::ids::{BatchId, ChannelId};
use crate::app::config::ConfigError;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HecError {
    /// Broken internal invariant: a bug, never retried.
    #[error("Illegal state: {0}")]
    IllegalState(String),
    #[error("Send timeout: batch {batch_id} not accepted by any channel within {timeout:?}")]
    SendTimeout { batch_id: BatchId, timeout: Duration },
    #[error("Acknowledgement timeout: batch {batch_id} not acknowledged within {timeout:?}")]
    AckTimeout { batch_id: BatchId, timeout: Duration },
    #[error("Server error: {0}")]
    Server(#[from] HecServerError),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Batch {batch_id} failed after {attempts} attempts: {last_error}")]
    MaxRetries {
        batch_id: BatchId,
        attempts: u32,
        last_error: String,
    },
    #[error("Channel {channel} is dead: {reason}")]
    ChannelDeath { channel: ChannelId, reason: String },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl HecError {
    /// Whether redriving the batch on another channel can help.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Server(err) => err.error_type == ServerErrorType::RecoverableServer,
            Self::Transport(_) | Self::Http(_) | Self::ChannelDeath { .. } => true,
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::SendTimeout { .. } | Self::AckTimeout { .. })
    }

    pub fn server_error_type(&self) -> Option<ServerErrorType> {
        match self {
            Self::Server(err) => Some(err.error_type),
            _ => None,
        }
    }
}

/// Classification of HEC status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerErrorType {
    /// Token disabled, invalid index, data channel missing.
    NonRecoverable,
    /// Token or authorization problems an operator can fix.
    RecoverableConfig,
    /// The request body itself was rejected.
    RecoverableData,
    /// Server busy or unhealthy; another channel may succeed.
    RecoverableServer,
    Unknown,
}

impl ServerErrorType {
    pub fn from_code(code: i32) -> Self {
        match code {
            3 | 10 | 11 => Self::NonRecoverable,
            1 | 2 | 4 | 7 | 14 => Self::RecoverableConfig,
            5 | 6 | 12 | 13 => Self::RecoverableData,
            8 | 9 => Self::RecoverableServer,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ServerErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NonRecoverable => "non-recoverable",
            Self::RecoverableConfig => "recoverable-config",
            Self::RecoverableData => "recoverable-data",
            Self::RecoverableServer => "recoverable-server",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Structured error body returned by the endpoint.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{error_type} error from {url} (HTTP {status}, code {code}): {text}")]
pub struct HecServerError {
    pub code: i32,
    pub text: String,
    pub status: u16,
    pub url: String,
    pub error_type: ServerErrorType,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    text: String,
    #[serde(default = "unknown_code")]
    code: i32,
}

fn unknown_code() -> i32 {
    -1
}

impl HecServerError {
    pub fn new(code: i32, text: impl Into<String>, status: u16, url: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
            status,
            url: url.into(),
            error_type: ServerErrorType::from_code(code),
        }
    }

    /// Parses a `{"text":..,"code":..}` body; anything else keeps the raw
    /// body as text with an unknown code.
    pub fn from_response_body(body: &str, status: u16, url: impl Into<String>) -> Self {
        match serde_json::from_str::<ErrorBody>(body) {
            Ok(parsed) => Self::new(parsed.code, parsed.text, status, url),
            Err(_) => Self::new(unknown_code(), body.trim(), status, url),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_classification() {
        for code in [3, 10, 11] {
            assert_eq!(ServerErrorType::from_code(code), ServerErrorType::NonRecoverable);
        }
        for code in [1, 2, 4, 7, 14] {
            assert_eq!(ServerErrorType::from_code(code), ServerErrorType::RecoverableConfig);
        }
        for code in [5, 6, 12, 13] {
            assert_eq!(ServerErrorType::from_code(code), ServerErrorType::RecoverableData);
        }
        for code in [8, 9] {
            assert_eq!(ServerErrorType::from_code(code), ServerErrorType::RecoverableServer);
        }
        assert_eq!(ServerErrorType::from_code(0), ServerErrorType::Unknown);
        assert_eq!(ServerErrorType::from_code(42), ServerErrorType::Unknown);
    }

    #[test]
    fn test_parse_error_body() {
        let err = HecServerError::from_response_body(
            r#"{"text":"Invalid token","code":4}"#,
            403,
            "http://localhost:8088/services/collector/event",
        );
        assert_eq!(err.code, 4);
        assert_eq!(err.text, "Invalid token");
        assert_eq!(err.error_type, ServerErrorType::RecoverableConfig);
    }

    #[test]
    fn test_parse_non_json_body() {
        let err = HecServerError::from_response_body("Bad Gateway\n", 502, "http://x");
        assert_eq!(err.code, -1);
        assert_eq!(err.text, "Bad Gateway");
        assert_eq!(err.error_type, ServerErrorType::Unknown);
    }

    #[test]
    fn test_retryable_classification() {
        let busy = HecError::Server(HecServerError::new(9, "Server is busy", 503, "http://x"));
        assert!(busy.is_retryable());

        let bad_token = HecError::Server(HecServerError::new(4, "Invalid token", 403, "http://x"));
        assert!(!bad_token.is_retryable());

        assert!(HecError::Transport("connection reset".into()).is_retryable());
        assert!(!HecError::IllegalState("bug".into()).is_retryable());
        assert!(
            !HecError::SendTimeout {
                batch_id: BatchId::from_raw(1),
                timeout: Duration::from_secs(1),
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_timeout_classification() {
        let send = HecError::SendTimeout {
            batch_id: BatchId::from_raw(1),
            timeout: Duration::from_secs(1),
        };
        let ack = HecError::AckTimeout {
            batch_id: BatchId::from_raw(2),
            timeout: Duration::from_secs(1),
        };
        assert!(send.is_timeout());
        assert!(ack.is_timeout());
        assert!(!HecError::Transport("connection reset".into()).is_timeout());
    }
}
