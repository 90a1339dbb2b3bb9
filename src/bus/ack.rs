//! ack.rs - Matches outgoing publishes to broker acknowledgments
//!
//! The handle registers a waiter before queueing a publish. The event loop
//! writes publishes in request order, so each first `Outgoing::Publish`
//! takes the oldest queued waiter. QoS 0 completes once written, QoS 1 on
//! PUBACK and QoS 2 on PUBCOMP.

use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;

use crate::config::QosLevel;

/// Resolves once the broker has taken the publish. A dropped sender means
/// the connection closed first.
pub type Delivery = oneshot::Receiver<()>;

#[derive(Debug)]
struct Waiter {
    qos: QosLevel,
    done: oneshot::Sender<()>,
}

impl Waiter {
    fn complete(self) {
        // The publisher may have given up already
        let _ = self.done.send(());
    }
}

#[derive(Debug, Default)]
pub struct AckTracker {
    /// Requested but not yet written, oldest first
    queued: VecDeque<Waiter>,
    /// Written and waiting for the broker, by packet id
    in_flight: HashMap<u16, Waiter>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, qos: QosLevel) -> Delivery {
        let (done, delivery) = oneshot::channel();
        self.queued.push_back(Waiter { qos, done });
        delivery
    }

    /// The most recent registration never reached the client
    pub fn withdraw(&mut self) {
        self.queued.pop_back();
    }

    /// The event loop wrote a publish with `pkid`
    pub fn sent(&mut self, pkid: u16) {
        // Retransmission after a reconnect keeps its waiter
        if pkid != 0 && self.in_flight.contains_key(&pkid) {
            return;
        }
        let Some(waiter) = self.queued.pop_front() else {
            return;
        };
        match waiter.qos {
            QosLevel::AtMostOnce => waiter.complete(),
            QosLevel::AtLeastOnce | QosLevel::ExactlyOnce => {
                self.in_flight.insert(pkid, waiter);
            }
        }
    }

    /// The broker answered `pkid` with the packet that completes `qos`.
    /// Returns whether a waiter was completed.
    pub fn acknowledged(&mut self, pkid: u16, qos: QosLevel) -> bool {
        match self.in_flight.get(&pkid) {
            Some(waiter) if waiter.qos == qos => {}
            _ => return false,
        }
        match self.in_flight.remove(&pkid) {
            Some(waiter) => {
                waiter.complete();
                true
            }
            None => false,
        }
    }

    pub fn pending(&self) -> usize {
        self.queued.len() + self.in_flight.len()
    }

    /// Fail every outstanding publish
    pub fn abandon(&mut self) {
        self.queued.clear();
        self.in_flight.clear();
    }
}
