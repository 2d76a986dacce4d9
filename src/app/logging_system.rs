use super::config::LogLevel;
use std::sync::Once;
use thiserror::Error;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Invalid directive format '{input}'. Expected: 'target=level'")]
    InvalidDirectiveFormat { input: String },

    #[error("Invalid log level '{input}' in directive")]
    InvalidLogLevel { input: String },

    #[error("Empty target in directive '{input}'")]
    EmptyTarget { input: String },

    #[error("Logging system initialization failed: {details}")]
    InitFailed {
        details: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// `target=level` pair fed into the `EnvFilter`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogDirective {
    pub target: String,
    pub level: LogLevel,
}

impl LogDirective {
    pub fn new(target: impl Into<String>, level: LogLevel) -> Self {
        Self {
            target: target.into(),
            level,
        }
    }

    pub fn parse(directive: &str) -> Result<Self, LoggingError> {
        let Some((target, level)) = directive.split_once('=') else {
            return Err(LoggingError::InvalidDirectiveFormat {
                input: directive.to_string(),
            });
        };
        let target = target.trim();
        if target.is_empty() {
            return Err(LoggingError::EmptyTarget {
                input: directive.to_string(),
            });
        }
        let level = <LogLevel as clap::ValueEnum>::from_str(level.trim(), true).map_err(|_| {
            LoggingError::InvalidLogLevel {
                input: directive.to_string(),
            }
        })?;
        Ok(Self::new(target, level))
    }

    pub fn to_filter_string(&self) -> String {
        format!("{}={}", self.target, self.level.as_str())
    }
}

/// Builder for the process-wide tracing subscriber.
#[derive(Debug, Clone)]
pub struct LoggingSystem {
    level: LogLevel,
    format: LogFormat,
    directives: Vec<LogDirective>,
}

impl LoggingSystem {
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            format: LogFormat::Compact,
            directives: Vec::new(),
        }
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Quiets the HTTP stack below the connection's own logs.
    pub fn with_default_directives(mut self) -> Self {
        for target in ["hyper", "hyper_util", "reqwest", "h2", "rustls"] {
            self.directives.push(LogDirective::new(target, LogLevel::Warn));
        }
        self
    }

    pub fn add_directive(&mut self, directive: &str) -> Result<(), LoggingError> {
        self.directives.push(LogDirective::parse(directive)?);
        Ok(())
    }

    pub fn directive_count(&self) -> usize {
        self.directives.len()
    }

    pub fn build_filter_string(&self) -> String {
        std::iter::once(self.level.as_str().to_string())
            .chain(self.directives.iter().map(LogDirective::to_filter_string))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn init(&self) -> Result<(), LoggingError> {
        let filter_string = self.build_filter_string();
        let env_filter =
            EnvFilter::try_new(&filter_string).map_err(|e| LoggingError::InitFailed {
                details: format!("Failed to create EnvFilter with '{filter_string}'"),
                source: Box::new(e),
            })?;

        let registry = tracing_subscriber::registry().with(env_filter);
        let result = match self.format {
            LogFormat::Compact => registry
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_level(true)
                        .compact(),
                )
                .try_init(),
            LogFormat::Json => registry
                .with(fmt::layer().json().with_current_span(false))
                .try_init(),
        };

        result.map_err(|e| LoggingError::InitFailed {
            details: "Failed to set global tracing subscriber".to_string(),
            source: Box::new(e),
        })
    }
}

/// Installs the global subscriber once; later calls are no-ops that report
/// whether the first installation succeeded.
pub fn setup_logging(level: LogLevel) -> Result<(), LoggingError> {
    static INIT: Once = Once::new();
    static INSTALLED: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

    INIT.call_once(|| {
        let installed = LoggingSystem::new(level)
            .with_default_directives()
            .init()
            .is_ok();
        INSTALLED.store(installed, std::sync::atomic::Ordering::Release);
    });

    if INSTALLED.load(std::sync::atomic::Ordering::Acquire) {
        Ok(())
    } else {
        Err(LoggingError::InitFailed {
            details: "Logging system initialization failed".to_string(),
            source: Box::new(std::io::Error::other("subscriber already installed")),
        })
    }
}
