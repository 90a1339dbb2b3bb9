//! bus - Publish/subscribe bus connection
//!
//! `Bus` is the handle shared by the publisher and the service. The MQTT
//! implementation lives in `mqtt`, its connection lifecycle in `monitor`,
//! publish acknowledgment tracking in `ack` and an in-memory bus for tests
//! in `memory`.

pub mod ack;
pub mod memory;
pub mod monitor;
pub mod mqtt;

use async_trait::async_trait;
use std::fmt;

use crate::config::QosLevel;
use crate::error::BusError;

pub use ack::{AckTracker, Delivery};
pub use memory::MemoryBus;
pub use monitor::{Backoff, BusEvent, ConnectionMonitor, Reaction};
pub use mqtt::{MqttBus, MqttDriver};

/// Topic the control listener subscribes to
pub const CONTROL_TOPIC: &str = "rateservicecontrol";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        write!(f, "{}", name)
    }
}

/// Handle to the single long-lived bus connection
#[async_trait]
pub trait Bus: Send + Sync {
    /// Resolves once the broker has acknowledged the message at `qos`.
    /// Refused unless the bus is `Connected`.
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
        retain: bool,
    ) -> Result<(), BusError>;

    /// Close the connection. Further publishes fail.
    async fn disconnect(&self) -> Result<(), BusError>;

    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}
