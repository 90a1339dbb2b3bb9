//! error.rs - Error types for each stage of the service
//!
//! Only `ConfigError` is fatal. Everything raised inside a refresh cycle is
//! logged and contained to that cycle.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Config file {path} must contain a JSON object")]
    NotAnObject { path: PathBuf },
    #[error("Invalid configuration: {0}")]
    Invalid(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Failed to build HTTP client: {0}")]
    Client(reqwest::Error),
    #[error("Request to {url} failed: {source}")]
    Request { url: String, source: reqwest::Error },
    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },
    #[error("Malformed JSON from {url}: {source}")]
    Decode {
        url: String,
        source: serde_json::Error,
    },
    #[error("Price response has no {0} quote")]
    MissingReference(String),
}

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Invalid bus url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("Unsupported bus url scheme: {0}")]
    UnsupportedScheme(String),
    #[error("Bus client rejected request: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("Bus rejected publish: {0}")]
    Rejected(String),
    #[error("Bus is not connected")]
    NotConnected,
    #[error("Bus connection closed before the broker acknowledged the publish")]
    Unacknowledged,
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Publish to {topic} failed: {source}")]
    Bus { topic: String, source: BusError },
    #[error("Publish to {topic} not acknowledged within {secs}s")]
    Timeout { topic: String, secs: u64 },
}

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Unhandled topic: {0}")]
    UnhandledTopic(String),
    #[error("Malformed control message: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Control message is not a JSON object")]
    NotAnObject,
}

/// Why a refresh cycle did not publish
#[derive(Error, Debug)]
pub enum CycleError {
    #[error("bus not connected, cycle skipped")]
    NotConnected,
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Publish(#[from] PublishError),
}
