//! control.rs - Listener for the control topic
//!
//! Commands are not defined yet: a parsed message is logged and dropped.
//! Bad input never stops the listener.

use log::{info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::bus::CONTROL_TOPIC;
use crate::error::ControlError;
use crate::models::ControlMessage;

/// Clones share the message count
#[derive(Debug, Clone)]
pub struct ControlListener {
    topic: String,
    accepted: Arc<AtomicU64>,
}

impl ControlListener {
    pub fn new() -> Self {
        ControlListener {
            topic: CONTROL_TOPIC.to_string(),
            accepted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Control messages accepted so far
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Parse a message received on `topic`
    pub fn handle(&self, topic: &str, payload: &[u8]) -> Result<ControlMessage, ControlError> {
        if topic != self.topic {
            return Err(ControlError::UnhandledTopic(topic.to_string()));
        }

        match serde_json::from_slice::<serde_json::Value>(payload)? {
            serde_json::Value::Object(body) => Ok(ControlMessage {
                topic: topic.to_string(),
                body,
            }),
            _ => Err(ControlError::NotAnObject),
        }
    }

    /// Handle a message and log the outcome
    pub fn dispatch(&self, topic: &str, payload: &[u8]) -> Option<ControlMessage> {
        match self.handle(topic, payload) {
            Ok(message) => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                info!(
                    "Control message: {}",
                    serde_json::Value::Object(message.body.clone())
                );
                Some(message)
            }
            Err(e) => {
                warn!("Discarded message on {}: {}", topic, e);
                None
            }
        }
    }
}

impl Default for ControlListener {
    fn default() -> Self {
        Self::new()
    }
}
