use crate::topics::Hierarchy;
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Scheme used to reach the broker.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ws,
    Wss,
    Mqtt,
    Mqtts,
}

impl Protocol {
    pub fn is_websocket(&self) -> bool {
        matches!(self, Protocol::Ws | Protocol::Wss)
    }

    /// 8083 for websocket listeners, 1883 for plain MQTT.
    pub fn default_port(&self) -> u16 {
        if self.is_websocket() {
            8083
        } else {
            1883
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Ws => "ws",
            Protocol::Wss => "wss",
            Protocol::Mqtt => "mqtt",
            Protocol::Mqtts => "mqtts",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ws" => Ok(Protocol::Ws),
            "wss" => Ok(Protocol::Wss),
            "mqtt" => Ok(Protocol::Mqtt),
            "mqtts" => Ok(Protocol::Mqtts),
            other => Err(ConfigError::ParsingError(format!(
                "MQTT_PROTOCOL must be one of ws, wss, mqtt, mqtts (got '{}')",
                other
            ))),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub mqtt_protocol: Protocol,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_path: String,
    pub mqtt_username: String,
    pub mqtt_password: String,
    pub mqtt_client_prefix: String,
    pub mqtt_keep_alive_secs: u64,
    pub mqtt_max_retries: i32,
    pub mqtt_retry_interval_ms: u64,
    pub mqtt_subscribe_settle_ms: u64,

    pub hierarchy: Hierarchy,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

impl Config {
    /// Validate timeout values and other critical configurations.
    fn validate_timeouts(&self) -> Result<(), ConfigError> {
        const MIN_TIMEOUT: u64 = 100;
        const MAX_TIMEOUT: u64 = 1_000_000;
        const MIN_KEEP_ALIVE_SECS: u64 = 5;

        if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&self.mqtt_retry_interval_ms) {
            return Err(ConfigError::ParsingError(format!(
                "MQTT_RETRY_INTERVAL_MS must be between {} and {} ms",
                MIN_TIMEOUT, MAX_TIMEOUT
            )));
        }

        if self.mqtt_keep_alive_secs < MIN_KEEP_ALIVE_SECS {
            return Err(ConfigError::ParsingError(format!(
                "MQTT_KEEP_ALIVE_SECS must be at least {}",
                MIN_KEEP_ALIVE_SECS
            )));
        }

        if self.mqtt_host.trim().is_empty() {
            return Err(ConfigError::MissingOrInvalid("MQTT_HOST".to_string()));
        }

        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var_or = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let mqtt_protocol = match lookup("MQTT_PROTOCOL") {
            Some(raw) => raw.parse::<Protocol>()?,
            None => Protocol::Ws,
        };

        let mqtt_port = match lookup("MQTT_PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| ConfigError::ParsingError("MQTT_PORT must be a valid number".to_string()))?,
            None => mqtt_protocol.default_port(),
        };

        let config = Self {
            mqtt_protocol,
            mqtt_host: var_or("MQTT_HOST", "localhost"),
            mqtt_port,
            mqtt_path: var_or("MQTT_PATH", "/mqtt"),
            mqtt_username: lookup("MQTT_USERNAME").unwrap_or_default(),
            mqtt_password: lookup("MQTT_PASSWORD").unwrap_or_default(),
            mqtt_client_prefix: var_or("MQTT_CLIENT_PREFIX", "uns-frontend"),
            mqtt_keep_alive_secs: var_or("MQTT_KEEP_ALIVE_SECS", "60")
                .parse::<u64>()
                .map_err(|_| ConfigError::ParsingError("MQTT_KEEP_ALIVE_SECS must be a valid number".to_string()))?,
            mqtt_max_retries: var_or("MQTT_MAX_RETRIES", "-1")
                .parse::<i32>()
                .map_err(|_| ConfigError::ParsingError("MQTT_MAX_RETRIES must be an integer".to_string()))?,
            mqtt_retry_interval_ms: var_or("MQTT_RETRY_INTERVAL_MS", "5000")
                .parse::<u64>()
                .map_err(|_| ConfigError::ParsingError("MQTT_RETRY_INTERVAL_MS must be a valid number".to_string()))?,
            mqtt_subscribe_settle_ms: var_or("MQTT_SUBSCRIBE_SETTLE_MS", "100")
                .parse::<u64>()
                .map_err(|_| ConfigError::ParsingError("MQTT_SUBSCRIBE_SETTLE_MS must be a valid number".to_string()))?,

            // UNS hierarchy
            hierarchy: Hierarchy {
                enterprise: var_or("UNS_ENTERPRISE", "Plant_Name"),
                site: var_or("UNS_SITE", "SMT-Area-1"),
                area: var_or("UNS_AREA", "SMT-Line-1"),
                line: var_or("UNS_LINE", "Printer-Cell"),
                device: var_or("UNS_DEVICE", "Printer01"),
            },
        };

        // Validate timeouts after constructing the configuration
        config.validate_timeouts()?;

        Ok(config)
    }

    /// Broker URL. Websocket schemes carry the path, plain MQTT does not.
    pub fn broker_url(&self) -> String {
        if self.mqtt_protocol.is_websocket() {
            format!(
                "{}://{}:{}{}",
                self.mqtt_protocol, self.mqtt_host, self.mqtt_port, self.mqtt_path
            )
        } else {
            format!("{}://{}:{}", self.mqtt_protocol, self.mqtt_host, self.mqtt_port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_to_websocket_broker_on_localhost() {
        let config = config_from(&[]).unwrap();

        assert_eq!(config.mqtt_protocol, Protocol::Ws);
        assert_eq!(config.mqtt_port, 8083);
        assert_eq!(config.mqtt_path, "/mqtt");
        assert_eq!(config.broker_url(), "ws://localhost:8083/mqtt");
        assert_eq!(config.mqtt_retry_interval_ms, 5000);
        assert_eq!(config.mqtt_max_retries, -1);
        assert_eq!(config.mqtt_subscribe_settle_ms, 100);
        assert_eq!(config.hierarchy, Hierarchy::default());
    }

    #[test]
    fn plain_mqtt_uses_1883_and_no_path() {
        let config = config_from(&[("MQTT_PROTOCOL", "mqtt"), ("MQTT_HOST", "emqx")]).unwrap();

        assert_eq!(config.mqtt_port, 1883);
        assert_eq!(config.broker_url(), "mqtt://emqx:1883");
    }

    #[test]
    fn explicit_port_and_hierarchy_override_defaults() {
        let config = config_from(&[
            ("MQTT_PROTOCOL", "WSS"),
            ("MQTT_PORT", "443"),
            ("MQTT_PATH", "/ws"),
            ("UNS_ENTERPRISE", "Acme"),
            ("UNS_DEVICE", "Oven02"),
        ])
        .unwrap();

        assert_eq!(config.broker_url(), "wss://localhost:443/ws");
        assert_eq!(config.hierarchy.enterprise, "Acme");
        assert_eq!(config.hierarchy.device, "Oven02");
        assert_eq!(config.hierarchy.site, "SMT-Area-1");
    }

    #[test]
    fn rejects_unknown_protocol() {
        let err = config_from(&[("MQTT_PROTOCOL", "amqp")]).unwrap_err();
        assert!(matches!(err, ConfigError::ParsingError(_)));
    }

    #[test]
    fn rejects_invalid_port() {
        let err = config_from(&[("MQTT_PORT", "eighty")]).unwrap_err();
        assert!(err.to_string().contains("MQTT_PORT"));
    }

    #[test]
    fn rejects_retry_interval_out_of_range() {
        let err = config_from(&[("MQTT_RETRY_INTERVAL_MS", "10")]).unwrap_err();
        assert!(err.to_string().contains("MQTT_RETRY_INTERVAL_MS"));
    }
}
