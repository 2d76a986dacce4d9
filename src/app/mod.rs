pub mod config;
pub mod connection;
pub mod logging_system;

pub use config::{Config, ConfigError, ConnectionSettings, EndpointKind, LogLevel, RetryConfig};
pub use connection::Connection;
pub use logging_system::{LogFormat, LoggingError, LoggingSystem, setup_logging};
