use hec_forwarder::app::{Config, ConfigError, EndpointKind, LogLevel};
use hec_forwarder::reliability::RetryStrategy;
use serial_test::serial;
use std::env;
use std::io::Write;
use std::time::Duration;
use tempfile::{NamedTempFile, TempDir};

fn clean_all_env_vars() {
    let env_vars = [
        "HEC_CONFIG",
        "HEC_URLS",
        "HEC_TOKEN",
        "HEC_ENDPOINT_KIND",
        "HEC_CHANNELS_PER_DESTINATION",
        "HEC_MAX_TOTAL_CHANNELS",
        "HEC_MAX_UNACKED_PER_CHANNEL",
        "HEC_SEND_TIMEOUT_MS",
        "HEC_ACK_TIMEOUT_MS",
        "HEC_ACK_POLL_MS",
        "HEC_UNRESPONSIVE_CHANNEL_DECOM_MS",
        "HEC_CHANNEL_DECOM_MS",
        "HEC_EVENT_BATCH_SIZE",
        "HEC_MAX_RETRIES",
        "HEC_RETRY_BASE_DELAY_MS",
        "HEC_RETRY_STRATEGY",
        "HEC_ENABLE_CHECKPOINTS",
        "HEC_ENABLE_COMPRESSION",
        "HEC_DISABLE_CERT_VALIDATION",
        "HEC_REQUEST_TIMEOUT_SECS",
        "HEC_CONFIG_FILE",
        "LOG_LEVEL",
    ];

    unsafe {
        for var in &env_vars {
            env::remove_var(var);
        }
    }
}

#[test]
#[serial]
fn test_config_from_args() {
    clean_all_env_vars();
    let config = Config::from_args([
        "hec-forwarder",
        "--urls",
        "https://hec-1.local:8088,https://hec-2.local:8088/",
        "--token",
        "abc-123",
        "--endpoint-kind",
        "raw",
        "--channels-per-destination",
        "2",
        "--max-unacked-per-channel",
        "50",
        "--log-level",
        "debug",
        "--enable-checkpoints",
        "--retry-strategy",
        "linear-backoff",
    ])
    .unwrap();

    assert_eq!(
        config.urls,
        vec!["https://hec-1.local:8088", "https://hec-2.local:8088"]
    );
    assert_eq!(config.token, "abc-123");
    assert_eq!(config.endpoint_kind, EndpointKind::Raw);
    assert_eq!(config.channels_per_destination, 2);
    assert_eq!(config.max_unacked_per_channel, 50);
    assert_eq!(config.log_level, LogLevel::Debug);
    assert!(config.enable_checkpoints);
    assert_eq!(config.retry_config.max_attempts, 10);
    assert_eq!(config.retry_config.strategy, RetryStrategy::LinearBackoff);
}

#[test]
#[serial]
fn test_missing_token_is_rejected() {
    clean_all_env_vars();
    let result = Config::from_args(["hec-forwarder", "--urls", "https://hec.local:8088"]);
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
#[serial]
fn test_config_from_env() {
    clean_all_env_vars();
    unsafe {
        env::set_var("HEC_URLS", "https://a.local:8088, https://b.local:8088,https://a.local:8088");
        env::set_var("HEC_TOKEN", "env-token");
        env::set_var("HEC_ENDPOINT_KIND", "RAW");
        env::set_var("HEC_SEND_TIMEOUT_MS", "1500");
        env::set_var("HEC_ENABLE_COMPRESSION", "true");
        env::set_var("HEC_RETRY_STRATEGY", "fixed-delay");
        env::set_var("LOG_LEVEL", "warn");
    }

    let config = Config::from_env().unwrap();
    clean_all_env_vars();

    assert_eq!(config.urls, vec!["https://a.local:8088", "https://b.local:8088"]);
    assert_eq!(config.token, "env-token");
    assert_eq!(config.endpoint_kind, EndpointKind::Raw);
    assert_eq!(config.send_timeout_ms, 1500);
    assert!(config.enable_compression);
    assert_eq!(config.log_level, LogLevel::Warn);
    assert_eq!(config.retry_config.strategy, RetryStrategy::FixedDelay);
}

#[test]
#[serial]
fn test_invalid_env_number_is_an_error() {
    clean_all_env_vars();
    unsafe {
        env::set_var("HEC_TOKEN", "env-token");
        env::set_var("HEC_MAX_TOTAL_CHANNELS", "lots");
    }
    let result = Config::from_env();
    clean_all_env_vars();
    assert!(result.is_err());
}

#[test]
#[serial]
fn test_whole_toml_document_in_env() {
    clean_all_env_vars();
    unsafe {
        env::set_var(
            "HEC_CONFIG",
            "urls = [\"https://toml.local:8088\"]\ntoken = \"from-doc\"\n",
        );
        env::set_var("HEC_TOKEN", "ignored");
    }
    let config = Config::from_env().unwrap();
    clean_all_env_vars();

    assert_eq!(config.token, "from-doc");
    assert_eq!(config.urls, vec!["https://toml.local:8088"]);
}

#[test]
#[serial]
fn test_config_from_file() {
    clean_all_env_vars();
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("hec.toml");
    std::fs::write(
        &path,
        r#"
urls = ["https://file.local:8088"]
token = "file-token"
endpoint_kind = "event"
max_total_channels = 3
ack_timeout_ms = 5000
unresponsive_channel_decom_ms = 2000
channel_decom_ms = 0
max_retries = 4
retry_base_delay_ms = 250
retry_strategy = "fixed-delay"
log_level = "trace"
"#,
    )
    .unwrap();

    let config = Config::from_file(&path).unwrap();
    assert_eq!(config.max_total_channels, 3);
    assert_eq!(config.log_level, LogLevel::Trace);
    // Unset keys keep their defaults
    assert_eq!(config.max_unacked_per_channel, 500);

    let settings = config.to_settings().unwrap();
    assert_eq!(settings.ack_timeout, Duration::from_secs(5));
    assert_eq!(settings.unresponsive_channel_decom, Some(Duration::from_secs(2)));
    assert_eq!(settings.channel_decom, None);
    assert_eq!(settings.retry.max_attempts, 4);
    assert_eq!(settings.retry.base_delay, Duration::from_millis(250));
    assert_eq!(settings.retry.strategy, RetryStrategy::FixedDelay);
    assert_eq!(settings.urls[0].host_str(), Some("file.local"));
}

#[test]
#[serial]
fn test_config_file_flag_overrides_args() {
    clean_all_env_vars();
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "urls = [\"https://flag.local:8088\"]").unwrap();
    writeln!(file, "token = \"flag-token\"").unwrap();

    let path = file.path().to_string_lossy().to_string();
    let config = Config::from_args([
        "hec-forwarder",
        "--token",
        "cli-token",
        "--config-file",
        path.as_str(),
    ])
    .unwrap();
    assert_eq!(config.token, "flag-token");
}

#[test]
#[serial]
fn test_malformed_file_is_a_parse_error() {
    clean_all_env_vars();
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "urls = not-a-list").unwrap();

    let result = Config::from_file(file.path());
    assert!(matches!(result, Err(ConfigError::ParseError(_))));
}

#[test]
fn test_validation_rejects_bad_values() {
    let base = Config {
        token: "t".to_string(),
        ..Config::default()
    };
    assert!(base.validate().is_ok());

    let no_urls = Config {
        urls: Vec::new(),
        ..base.clone()
    };
    assert!(no_urls.validate().is_err());

    let bad_scheme = Config {
        urls: vec!["ftp://hec.local".to_string()],
        ..base.clone()
    };
    assert!(matches!(bad_scheme.validate(), Err(ConfigError::InvalidUrl(_))));

    let zero_cap = Config {
        max_unacked_per_channel: 0,
        ..base.clone()
    };
    assert!(zero_cap.validate().is_err());

    let zero_poll = Config {
        ack_poll_ms: 0,
        ..base
    };
    assert!(zero_poll.validate().is_err());
}
