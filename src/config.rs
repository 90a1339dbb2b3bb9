//! config.rs - Service configuration
//!
//! Built-in defaults are serialized to JSON, the optional config file is
//! deep-merged over them and the result is deserialized back into `Config`.

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// Config file looked up in the working directory when none is given
pub const CONFIG_FILE: &str = "rateservice.conf";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub logging: LoggingConfig,
    pub debug: bool,
    pub mqtt: MqttConfig,
    pub fetcher: FetcherConfig,
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttConfig {
    pub url: String,
    pub options: MqttOptionsConfig,
    pub rates: RatesTopicConfig,
    pub publish_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttOptionsConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    /// Generated from the process id when absent
    pub client_id: Option<String>,
    pub keep_alive_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RatesTopicConfig {
    pub topic: String,
    pub opts: PublishOpts,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishOpts {
    pub qos: QosLevel,
    pub retain: bool,
}

/// MQTT quality of service, restricted to 0, 1 or 2
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "u8", into = "u8")]
pub enum QosLevel {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for QosLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QosLevel::AtMostOnce),
            1 => Ok(QosLevel::AtLeastOnce),
            2 => Ok(QosLevel::ExactlyOnce),
            other => Err(format!("qos must be 0, 1 or 2, got {}", other)),
        }
    }
}

impl From<QosLevel> for u8 {
    fn from(qos: QosLevel) -> Self {
        match qos {
            QosLevel::AtMostOnce => 0,
            QosLevel::AtLeastOnce => 1,
            QosLevel::ExactlyOnce => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FetchStrategy {
    /// Base asset price in two references, then a scaled conversion list
    CrossRate,
    /// One price endpoint, body published unmodified
    PassThrough,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FetcherConfig {
    pub strategy: FetchStrategy,
    pub price_url: String,
    pub base_asset: String,
    /// `[scaling reference, synthesized reference]`
    pub reference_symbols: [String; 2],
    pub synthesized_name: String,
    pub conversions_url: String,
    /// Multi-symbol price endpoint used by the pass-through strategy
    pub pass_through_url: String,
    pub target_symbol: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logging: LoggingConfig {
                level: "info".to_string(),
            },
            debug: false,
            mqtt: MqttConfig {
                url: "wss://getcanoe.io:1884/mqtt".to_string(),
                options: MqttOptionsConfig {
                    username: Some("test".to_string()),
                    password: Some("gurka".to_string()),
                    client_id: None,
                    keep_alive_secs: 30,
                },
                rates: RatesTopicConfig {
                    topic: "rates".to_string(),
                    opts: PublishOpts {
                        qos: QosLevel::ExactlyOnce,
                        retain: true,
                    },
                },
                publish_timeout_secs: 10,
            },
            fetcher: FetcherConfig {
                strategy: FetchStrategy::CrossRate,
                price_url: "https://min-api.cryptocompare.com/data/price".to_string(),
                base_asset: "XRB".to_string(),
                reference_symbols: ["BTC".to_string(), "ETH".to_string()],
                synthesized_name: "Ethereum".to_string(),
                conversions_url: "https://bitpay.com/api/rates".to_string(),
                pass_through_url: "https://min-api.cryptocompare.com/data/pricemulti".to_string(),
                target_symbol: "USD".to_string(),
                timeout_secs: 10,
            },
            reconnect: ReconnectConfig {
                initial_backoff_ms: 1_000,
                max_backoff_ms: 60_000,
            },
        }
    }
}

impl Config {
    /// Load defaults merged with `path`. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("No config file at {}, using defaults", path.display());
            return Ok(Config::default());
        }

        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let overlay: Value = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if !overlay.is_object() {
            return Err(ConfigError::NotAnObject {
                path: path.to_path_buf(),
            });
        }

        let config = Self::with_overlay(overlay)?;
        debug!("Configured from {}", path.display());
        Ok(config)
    }

    /// Defaults with `overlay` deep-merged on top
    pub fn with_overlay(overlay: Value) -> Result<Self, ConfigError> {
        let mut merged = serde_json::to_value(Config::default())?;
        merge(&mut merged, overlay);
        Ok(serde_json::from_value(merged)?)
    }

    /// Filter string for env_logger
    pub fn log_filter(&self) -> String {
        if self.debug && !matches!(self.logging.level.as_str(), "debug" | "trace") {
            "debug".to_string()
        } else {
            self.logging.level.clone()
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetcher.timeout_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.mqtt.publish_timeout_secs)
    }
}

/// Objects merge key by key; any other overlay value replaces the base.
fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
