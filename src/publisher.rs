//! publisher.rs - Puts a fetched payload on the rates topic

use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;

use crate::bus::Bus;
use crate::config::{Config, PublishOpts};
use crate::error::PublishError;
use crate::models::Payload;

#[derive(Clone)]
pub struct Publisher {
    bus: Arc<dyn Bus>,
    topic: String,
    opts: PublishOpts,
    timeout: Duration,
}

impl Publisher {
    pub fn new(bus: Arc<dyn Bus>, topic: &str, opts: PublishOpts, timeout: Duration) -> Self {
        Publisher {
            bus,
            topic: topic.to_string(),
            opts,
            timeout,
        }
    }

    pub fn from_config(bus: Arc<dyn Bus>, config: &Config) -> Self {
        Self::new(
            bus,
            &config.mqtt.rates.topic,
            config.mqtt.rates.opts,
            config.publish_timeout(),
        )
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Serialize `payload` and publish it once, waiting up to the timeout for
    /// the broker to acknowledge it. Failures are not retried.
    pub async fn publish(&self, payload: &Payload) -> Result<(), PublishError> {
        let bytes = payload.to_bytes()?;
        debug!("Publishing {} to {}", payload.describe(), self.topic);

        let sent = tokio::time::timeout(
            self.timeout,
            self.bus
                .publish(&self.topic, bytes, self.opts.qos, self.opts.retain),
        )
        .await
        .map_err(|_| PublishError::Timeout {
            topic: self.topic.clone(),
            secs: self.timeout.as_secs(),
        })?;

        sent.map_err(|source| PublishError::Bus {
            topic: self.topic.clone(),
            source,
        })?;

        info!("Published rates");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{ConnectionState, MemoryBus};
    use crate::error::BusError;
    use crate::config::QosLevel;
    use crate::models::{RateEntry, RateMap};

    fn publisher(bus: &MemoryBus) -> Publisher {
        Publisher::new(
            Arc::new(bus.clone()),
            "rates",
            PublishOpts {
                qos: QosLevel::ExactlyOnce,
                retain: true,
            },
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn test_publishes_with_configured_options() {
        let bus = MemoryBus::connected();
        let mut rates = RateMap::new();
        rates.insert("EUR", RateEntry::new("Euro", 17000.0));

        publisher(&bus).publish(&Payload::Rates(rates)).await.unwrap();

        let published = bus.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "rates");
        assert_eq!(published[0].qos, QosLevel::ExactlyOnce);
        assert!(published[0].retain);
    }

    #[tokio::test]
    async fn test_raw_payload_published_unmodified() {
        let bus = MemoryBus::connected();
        let body = br#"{"XRB":{"USD":2.34}}"#.to_vec();

        publisher(&bus)
            .publish(&Payload::Raw(body.clone()))
            .await
            .unwrap();

        assert_eq!(bus.published()[0].payload, body);
    }

    #[tokio::test]
    async fn test_rejected_publish_is_reported() {
        let bus = MemoryBus::connected();
        bus.reject_publishes();

        let result = publisher(&bus).publish(&Payload::Raw(b"{}".to_vec())).await;
        assert!(matches!(result, Err(PublishError::Bus { .. })));
    }

    #[tokio::test]
    async fn test_publish_refused_while_reconnecting() {
        let bus = MemoryBus::connected();
        bus.set_state(ConnectionState::Reconnecting);

        let result = publisher(&bus).publish(&Payload::Raw(b"{}".to_vec())).await;
        assert!(matches!(
            result,
            Err(PublishError::Bus {
                source: BusError::NotConnected,
                ..
            })
        ));
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn test_stalled_publish_times_out() {
        let bus = MemoryBus::connected();
        bus.stall_publishes();

        let result = publisher(&bus).publish(&Payload::Raw(b"{}".to_vec())).await;
        assert!(matches!(result, Err(PublishError::Timeout { .. })));
    }
}
