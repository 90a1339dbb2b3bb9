//! models.rs - Core data structures for the rate service
//!
//! Defines RateEntry, RateMap, the publish Payload and the trigger/control
//! message types that flow between components.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// One currency's display name and its price in the common reference currency
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateEntry {
    pub name: String,
    pub rate: f64,
}

impl RateEntry {
    pub fn new(name: &str, rate: f64) -> Self {
        RateEntry {
            name: name.to_string(),
            rate,
        }
    }
}

impl fmt::Display for RateEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.name, self.rate)
    }
}

/// Mapping from currency code to its rate entry.
///
/// Serializes as a plain JSON object: `{"EUR": {"name": "Euro", "rate": 17000.0}}`.
/// Codes are unique by construction and empty codes are rejected on insert.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct RateMap(HashMap<String, RateEntry>);

impl RateMap {
    pub fn new() -> Self {
        RateMap(HashMap::new())
    }

    /// Insert or replace the entry for `code`.
    ///
    /// Returns `false` and leaves the map untouched when `code` is empty.
    pub fn insert(&mut self, code: &str, entry: RateEntry) -> bool {
        if code.is_empty() {
            return false;
        }
        self.0.insert(code.to_string(), entry);
        true
    }

    pub fn get(&self, code: &str) -> Option<&RateEntry> {
        self.0.get(code)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RateEntry)> {
        self.0.iter().map(|(code, entry)| (code.as_str(), entry))
    }
}

/// What a fetch strategy hands to the publisher
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Normalized rates, serialized to JSON at publish time
    Rates(RateMap),
    /// Upstream body published byte for byte
    Raw(Vec<u8>),
}

impl Payload {
    /// Bytes that go on the wire
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Payload::Rates(rates) => serde_json::to_vec(rates),
            Payload::Raw(body) => Ok(body.clone()),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Payload::Rates(rates) => format!("{} rates", rates.len()),
            Payload::Raw(body) => format!("{} byte pass-through body", body.len()),
        }
    }
}

/// A single scheduler firing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleTrigger {
    pub fired_at: chrono::DateTime<chrono::Utc>,
}

impl ScheduleTrigger {
    pub fn now() -> Self {
        ScheduleTrigger {
            fired_at: chrono::Utc::now(),
        }
    }
}

impl fmt::Display for ScheduleTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fired_at.format("%Y-%m-%d %H:%M:%S"))
    }
}

/// Parsed message from the control topic. Content is not validated.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlMessage {
    pub topic: String,
    pub body: serde_json::Map<String, serde_json::Value>,
}
