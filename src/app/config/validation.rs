use super::{Config, ConfigError};

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate endpoint URLs
        if self.urls.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "At least one HEC URL is required".to_string(),
            ));
        }
        for url in self.parsed_urls()? {
            if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
                return Err(ConfigError::InvalidUrl(format!(
                    "HEC URL must be http(s) with a host: {url}"
                )));
            }
        }

        if self.token.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "HEC token must not be empty".to_string(),
            ));
        }

        // Validate pool sizing
        if self.channels_per_destination == 0 {
            return Err(ConfigError::InvalidConfig(
                "Channels per destination must be greater than 0".to_string(),
            ));
        }
        if self.max_total_channels == 0 {
            return Err(ConfigError::InvalidConfig(
                "Max total channels must be greater than 0".to_string(),
            ));
        }
        if self.max_unacked_per_channel == 0 {
            return Err(ConfigError::InvalidConfig(
                "Max unacked per channel must be greater than 0".to_string(),
            ));
        }

        // Validate timeouts
        for (name, value) in [
            ("Send timeout", self.send_timeout_ms),
            ("Ack timeout", self.ack_timeout_ms),
            ("Ack poll interval", self.ack_poll_ms),
            ("Request timeout", self.request_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidConfig(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        Ok(())
    }
}
