//! monitor.rs - Connection lifecycle of the bus
//!
//! `ConnectionMonitor` turns transport events into reactions for the driver.
//! It owns the connection state, the control subscription guard and the
//! reconnect backoff, and performs no I/O itself.

use std::time::Duration;

use super::{ConnectionState, CONTROL_TOPIC};
use crate::config::{QosLevel, ReconnectConfig};

/// Transport event, independent of the MQTT client library
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    Connected { session_present: bool },
    Message { topic: String, payload: Vec<u8> },
    /// A publish with this packet id was written to the connection
    Sent { pkid: u16 },
    /// The broker finished the `qos` handshake for this packet id
    Delivered { pkid: u16, qos: QosLevel },
    ConnectionLost(String),
}

/// What the driver should do next
#[derive(Debug, Clone, PartialEq)]
pub enum Reaction {
    Subscribe(&'static str),
    Dispatch { topic: String, payload: Vec<u8> },
    Backoff(Duration),
    Nothing,
}

/// Exponential reconnect delay, doubling up to `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Backoff {
            initial,
            max,
            current: initial,
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        )
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionMonitor {
    state: ConnectionState,
    /// Subscribed during the current connection
    subscribed: bool,
    /// Subscribed at some point, so a resumed session still holds it
    ever_subscribed: bool,
    backoff: Backoff,
}

impl ConnectionMonitor {
    pub fn new(backoff: Backoff) -> Self {
        ConnectionMonitor {
            state: ConnectionState::Disconnected,
            subscribed: false,
            ever_subscribed: false,
            backoff,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    /// The driver started dialing the broker
    pub fn connecting(&mut self) {
        if self.state == ConnectionState::Disconnected {
            self.state = ConnectionState::Connecting;
        }
    }

    pub fn handle(&mut self, event: BusEvent) -> Reaction {
        match event {
            BusEvent::Connected { session_present } => {
                self.state = ConnectionState::Connected;
                self.backoff.reset();

                if self.subscribed {
                    return Reaction::Nothing;
                }
                self.subscribed = true;
                if session_present && self.ever_subscribed {
                    return Reaction::Nothing;
                }
                self.ever_subscribed = true;
                Reaction::Subscribe(CONTROL_TOPIC)
            }
            BusEvent::Message { topic, payload } => Reaction::Dispatch { topic, payload },
            BusEvent::Sent { .. } | BusEvent::Delivered { .. } => Reaction::Nothing,
            BusEvent::ConnectionLost(_) => {
                if self.state == ConnectionState::Disconnected {
                    return Reaction::Nothing;
                }
                self.state = ConnectionState::Reconnecting;
                self.subscribed = false;
                Reaction::Backoff(self.backoff.next_delay())
            }
        }
    }

    /// The subscribe request could not be queued; retry on next ConnAck,
    /// even for a resumed session
    pub fn subscription_failed(&mut self) {
        self.subscribed = false;
        self.ever_subscribed = false;
    }

    pub fn shutdown(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.subscribed = false;
    }
}
