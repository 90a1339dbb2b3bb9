//! memory.rs - In-memory bus
//!
//! Records every publish instead of sending it. Used by the tests.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use super::{Bus, ConnectionState};
use crate::config::QosLevel;
use crate::error::BusError;

#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QosLevel,
    pub retain: bool,
}

#[derive(Debug, Default)]
struct Inner {
    state: Option<ConnectionState>,
    published: Vec<PublishedMessage>,
    reject_publish: bool,
    stall_publish: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBus {
    /// A bus that starts out connected
    pub fn connected() -> Self {
        let bus = MemoryBus::default();
        bus.set_state(ConnectionState::Connected);
        bus
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.lock().state = Some(state);
    }

    /// Make every following publish fail
    pub fn reject_publishes(&self) {
        self.lock().reject_publish = true;
    }

    /// Make every following publish hang forever
    pub fn stall_publishes(&self) {
        self.lock().stall_publish = true;
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means a test panicked mid-publish
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
        retain: bool,
    ) -> Result<(), BusError> {
        let stall = {
            let mut inner = self.lock();
            if inner.state != Some(ConnectionState::Connected) {
                return Err(BusError::NotConnected);
            }
            if inner.reject_publish {
                return Err(BusError::Rejected("memory bus set to reject".to_string()));
            }
            if !inner.stall_publish {
                inner.published.push(PublishedMessage {
                    topic: topic.to_string(),
                    payload,
                    qos,
                    retain,
                });
            }
            inner.stall_publish
        };

        if stall {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        self.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.lock().state.unwrap_or(ConnectionState::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_publishes() {
        let bus = MemoryBus::connected();
        bus.publish("rates", b"{}".to_vec(), QosLevel::ExactlyOnce, true)
            .await
            .unwrap();

        assert_eq!(
            bus.published(),
            vec![PublishedMessage {
                topic: "rates".to_string(),
                payload: b"{}".to_vec(),
                qos: QosLevel::ExactlyOnce,
                retain: true,
            }]
        );
    }

    #[tokio::test]
    async fn test_disconnected_bus_rejects() {
        let bus = MemoryBus::connected();
        bus.disconnect().await.unwrap();

        assert!(!bus.is_connected());
        assert!(bus
            .publish("rates", Vec::new(), QosLevel::AtMostOnce, false)
            .await
            .is_err());
        assert!(bus.published().is_empty());
    }
}
