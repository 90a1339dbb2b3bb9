//! mqtt.rs - MQTT implementation of the bus
//!
//! `MqttBus` is the cloneable publish handle. `MqttDriver` owns the rumqttc
//! event loop: it polls the broker connection and feeds events through the
//! `ConnectionMonitor`. It also subscribes to the control topic, hands
//! inbound messages to the control listener and completes publishes as the
//! broker acknowledges them.

use async_trait::async_trait;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, Transport};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use url::Url;

use super::ack::{AckTracker, Delivery};
use super::monitor::{Backoff, BusEvent, ConnectionMonitor, Reaction};
use super::{Bus, ConnectionState};
use crate::config::{Config, MqttConfig, QosLevel};
use crate::control::ControlListener;
use crate::error::BusError;

/// Pending requests between the handle and the event loop
const REQUEST_CAPACITY: usize = 64;

/// How long shutdown waits for the DISCONNECT packet to go out
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

fn lock(acks: &Mutex<AckTracker>) -> MutexGuard<'_, AckTracker> {
    acks.lock().unwrap_or_else(|e| e.into_inner())
}

fn qos(level: QosLevel) -> QoS {
    match level {
        QosLevel::AtMostOnce => QoS::AtMostOnce,
        QosLevel::AtLeastOnce => QoS::AtLeastOnce,
        QosLevel::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// Translate `mqtt.url` and `mqtt.options` into client options.
///
/// Supports `mqtt://`, `tcp://`, `mqtts://`, `ssl://`, `ws://` and `wss://`.
pub fn mqtt_options(config: &MqttConfig) -> Result<MqttOptions, BusError> {
    let url = Url::parse(&config.url).map_err(|e| BusError::InvalidUrl {
        url: config.url.clone(),
        reason: e.to_string(),
    })?;
    let host = url.host_str().ok_or_else(|| BusError::InvalidUrl {
        url: config.url.clone(),
        reason: "missing host".to_string(),
    })?;

    let (transport, default_port) = match url.scheme() {
        "mqtt" | "tcp" => (Transport::Tcp, 1883),
        "mqtts" | "ssl" => (Transport::tls_with_default_config(), 8883),
        "ws" => (Transport::Ws, 80),
        "wss" => (Transport::wss_with_default_config(), 443),
        other => return Err(BusError::UnsupportedScheme(other.to_string())),
    };
    let port = url.port().unwrap_or(default_port);

    // Websocket transports take the whole url as the broker address
    let broker = match &transport {
        Transport::Ws | Transport::Wss(_) => config.url.clone(),
        _ => host.to_string(),
    };

    let client_id = config
        .options
        .client_id
        .clone()
        .unwrap_or_else(|| format!("rateservice_{}", std::process::id()));

    let mut options = MqttOptions::new(client_id, broker, port);
    options.set_transport(transport);
    options.set_keep_alive(Duration::from_secs(config.options.keep_alive_secs.max(5)));
    options.set_clean_session(true);
    if let Some(username) = &config.options.username {
        let password = config.options.password.clone().unwrap_or_default();
        options.set_credentials(username.clone(), password);
    }

    Ok(options)
}

/// Publish handle onto the MQTT connection
#[derive(Clone)]
pub struct MqttBus {
    client: AsyncClient,
    state: watch::Receiver<ConnectionState>,
    acks: Arc<Mutex<AckTracker>>,
}

impl MqttBus {
    /// Create the client and its driver. No I/O happens until the driver runs.
    pub fn connect(
        config: &Config,
        listener: ControlListener,
    ) -> Result<(MqttBus, MqttDriver), BusError> {
        let options = mqtt_options(&config.mqtt)?;
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let acks = Arc::new(Mutex::new(AckTracker::new()));

        let driver = MqttDriver {
            client: client.clone(),
            eventloop,
            state: state_tx,
            monitor: ConnectionMonitor::new(Backoff::from_config(&config.reconnect)),
            listener,
            acks: acks.clone(),
        };
        let bus = MqttBus {
            client,
            state: state_rx,
            acks,
        };
        Ok((bus, driver))
    }

    /// Queue a publish and register for its acknowledgment in one step, so
    /// waiters line up with the order the event loop writes packets in
    fn enqueue(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos_level: QosLevel,
        retain: bool,
    ) -> Result<Delivery, BusError> {
        let mut acks = lock(&self.acks);
        let delivery = acks.register(qos_level);
        if let Err(e) = self
            .client
            .try_publish(topic, qos(qos_level), retain, payload)
        {
            acks.withdraw();
            return Err(e.into());
        }
        Ok(delivery)
    }
}

#[async_trait]
impl Bus for MqttBus {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos_level: QosLevel,
        retain: bool,
    ) -> Result<(), BusError> {
        if self.state() != ConnectionState::Connected {
            return Err(BusError::NotConnected);
        }
        let delivery = self.enqueue(topic, payload, qos_level, retain)?;
        delivery.await.map_err(|_| BusError::Unacknowledged)
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        self.client.disconnect().await?;
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }
}

/// Owns the event loop of the connection
pub struct MqttDriver {
    client: AsyncClient,
    eventloop: EventLoop,
    state: watch::Sender<ConnectionState>,
    monitor: ConnectionMonitor,
    listener: ControlListener,
    acks: Arc<Mutex<AckTracker>>,
}

impl MqttDriver {
    /// Poll the connection until `shutdown` flips to true
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        debug!("Connecting MQTT");
        self.monitor.connecting();
        self.publish_state();

        loop {
            let polled = tokio::select! {
                _ = shutdown.changed() => break,
                polled = self.eventloop.poll() => polled,
            };

            let event = match polled {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => BusEvent::Connected {
                    session_present: ack.session_present,
                },
                Ok(Event::Incoming(Packet::Publish(publish))) => BusEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                },
                Ok(Event::Incoming(Packet::PubAck(ack))) => BusEvent::Delivered {
                    pkid: ack.pkid,
                    qos: QosLevel::AtLeastOnce,
                },
                Ok(Event::Incoming(Packet::PubComp(comp))) => BusEvent::Delivered {
                    pkid: comp.pkid,
                    qos: QosLevel::ExactlyOnce,
                },
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => BusEvent::Sent { pkid },
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!("Disconnected from MQTT server");
                    self.stop();
                    return;
                }
                Ok(_) => continue,
                Err(e) => BusEvent::ConnectionLost(e.to_string()),
            };

            if let Some(delay) = self.react(event) {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        self.drain().await;
    }

    /// Apply one event, returning a delay to wait before polling again
    fn react(&mut self, event: BusEvent) -> Option<Duration> {
        match &event {
            BusEvent::Connected { session_present } => {
                info!("Connected to MQTT server (session present: {})", session_present)
            }
            BusEvent::Sent { pkid } => lock(&self.acks).sent(*pkid),
            BusEvent::Delivered { pkid, qos } => {
                if lock(&self.acks).acknowledged(*pkid, *qos) {
                    debug!("Broker acknowledged packet {}", pkid);
                }
            }
            BusEvent::ConnectionLost(reason) => warn!("MQTT connection lost: {}", reason),
            BusEvent::Message { topic, .. } => debug!("Message received on {}", topic),
        }
        let reaction = self.monitor.handle(event);
        self.publish_state();

        match reaction {
            Reaction::Subscribe(topic) => {
                match self.client.try_subscribe(topic, QoS::AtMostOnce) {
                    Ok(()) => debug!("Subscribed to {}", topic),
                    Err(e) => {
                        error!("Failed to subscribe to {}: {}", topic, e);
                        self.monitor.subscription_failed();
                    }
                }
                None
            }
            Reaction::Dispatch { topic, payload } => {
                self.listener.dispatch(&topic, &payload);
                None
            }
            Reaction::Backoff(delay) => {
                info!("Reconnecting to MQTT server in {:?}", delay);
                Some(delay)
            }
            Reaction::Nothing => None,
        }
    }

    /// Let a queued DISCONNECT reach the broker before dropping the loop
    async fn drain(&mut self) {
        self.stop();

        let flushed = tokio::time::timeout(DRAIN_TIMEOUT, async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        })
        .await;

        if flushed.is_err() {
            warn!("MQTT disconnect not flushed within {:?}", DRAIN_TIMEOUT);
        }
        debug!("MQTT event loop stopped");
    }

    /// Mark the bus disconnected and fail publishes still waiting for an ack
    fn stop(&mut self) {
        self.monitor.shutdown();
        self.publish_state();
        let abandoned = {
            let mut acks = lock(&self.acks);
            let pending = acks.pending();
            acks.abandon();
            pending
        };
        if abandoned > 0 {
            warn!("{} publishes left unacknowledged", abandoned);
        }
    }

    fn publish_state(&self) {
        let _ = self.state.send(self.monitor.state());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::CONTROL_TOPIC;
    use crate::config::MqttOptionsConfig;
    use rumqttc::Request;

    fn mqtt_config(url: &str) -> MqttConfig {
        let mut config = Config::default().mqtt;
        config.url = url.to_string();
        config
    }

    #[test]
    fn test_tcp_url() {
        let options = mqtt_options(&mqtt_config("mqtt://broker.local")).unwrap();
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1883));
    }

    #[test]
    fn test_websocket_url_keeps_path() {
        let options = mqtt_options(&mqtt_config("ws://getcanoe.io:1884/mqtt")).unwrap();
        assert_eq!(
            options.broker_address(),
            ("ws://getcanoe.io:1884/mqtt".to_string(), 1884)
        );
    }

    #[test]
    fn test_explicit_client_id() {
        let mut config = mqtt_config("tcp://localhost:1884");
        config.options = MqttOptionsConfig {
            client_id: Some("rates-1".to_string()),
            ..config.options
        };

        let options = mqtt_options(&config).unwrap();
        assert_eq!(options.client_id(), "rates-1");
        assert_eq!(options.broker_address().1, 1884);
    }

    #[test]
    fn test_unsupported_scheme() {
        assert!(matches!(
            mqtt_options(&mqtt_config("http://localhost")),
            Err(BusError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            mqtt_options(&mqtt_config("not a url")),
            Err(BusError::InvalidUrl { .. })
        ));
    }

    fn local_config() -> Config {
        let mut config = Config::default();
        config.mqtt.url = "mqtt://localhost:1883".to_string();
        config
    }

    /// Bus and driver whose client requests land on the returned channel
    fn bus_with_requests(
        cap: usize,
        listener: ControlListener,
    ) -> (MqttBus, MqttDriver, flume::Receiver<Request>) {
        let (mut bus, mut driver) = MqttBus::connect(&local_config(), listener).unwrap();
        let (tx, requests) = flume::bounded(cap);
        let client = AsyncClient::from_senders(tx);
        bus.client = client.clone();
        driver.client = client;
        (bus, driver, requests)
    }

    fn subscriptions(requests: &flume::Receiver<Request>) -> Vec<String> {
        requests
            .try_iter()
            .filter_map(|request| match request {
                Request::Subscribe(subscribe) => {
                    Some(subscribe.filters.into_iter().map(|f| f.path).collect())
                }
                _ => None,
            })
            .collect::<Vec<Vec<String>>>()
            .concat()
    }

    fn connected(session_present: bool) -> BusEvent {
        BusEvent::Connected { session_present }
    }

    #[test]
    fn test_driver_subscribes_once_per_connection() {
        let (_bus, mut driver, requests) = bus_with_requests(8, ControlListener::new());

        driver.react(connected(false));
        driver.react(connected(false));
        driver.react(BusEvent::Message {
            topic: CONTROL_TOPIC.to_string(),
            payload: b"{}".to_vec(),
        });
        assert_eq!(subscriptions(&requests), vec![CONTROL_TOPIC.to_string()]);

        let delay = driver.react(BusEvent::ConnectionLost("reset".to_string()));
        assert_eq!(delay, Some(Duration::from_millis(1000)));
        driver.react(connected(false));
        driver.react(connected(true));
        assert_eq!(subscriptions(&requests), vec![CONTROL_TOPIC.to_string()]);
    }

    #[test]
    fn test_driver_retries_failed_subscribe() {
        let (_bus, mut driver, requests) = bus_with_requests(1, ControlListener::new());
        driver.client.try_subscribe("filler", QoS::AtMostOnce).unwrap();

        // Request channel is full, so the subscribe cannot be queued
        driver.react(connected(false));
        assert_eq!(subscriptions(&requests), vec!["filler".to_string()]);
        assert!(!driver.monitor.is_subscribed());

        driver.react(connected(false));
        assert_eq!(subscriptions(&requests), vec![CONTROL_TOPIC.to_string()]);
    }

    #[test]
    fn test_driver_dispatches_control_messages() {
        let listener = ControlListener::new();
        let (_bus, mut driver, _requests) = bus_with_requests(8, listener.clone());
        driver.react(connected(false));

        for (topic, payload) in [
            (CONTROL_TOPIC, br#"{"command": "refresh"}"#.to_vec()),
            (CONTROL_TOPIC, b"{ broken".to_vec()),
            ("rates", b"{}".to_vec()),
        ] {
            let delay = driver.react(BusEvent::Message {
                topic: topic.to_string(),
                payload,
            });
            assert_eq!(delay, None);
        }

        assert_eq!(listener.accepted(), 1);
        assert_eq!(driver.monitor.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_publish_completes_on_pubcomp() {
        let (bus, mut driver, requests) = bus_with_requests(8, ControlListener::new());
        driver.react(connected(false));
        requests.try_iter().for_each(drop);

        let publishing = tokio::spawn({
            let bus = bus.clone();
            async move {
                bus.publish("rates", b"{}".to_vec(), QosLevel::ExactlyOnce, true)
                    .await
            }
        });

        let request = requests.recv_async().await.unwrap();
        assert!(matches!(
            request,
            Request::Publish(publish)
                if publish.topic == "rates" && publish.qos == QoS::ExactlyOnce && publish.retain
        ));

        driver.react(BusEvent::Sent { pkid: 1 });
        driver.react(BusEvent::Delivered {
            pkid: 1,
            qos: QosLevel::AtLeastOnce,
        });
        tokio::task::yield_now().await;
        assert!(!publishing.is_finished());

        driver.react(BusEvent::Delivered {
            pkid: 1,
            qos: QosLevel::ExactlyOnce,
        });
        publishing.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_qos0_publish_completes_when_written() {
        let (bus, mut driver, requests) = bus_with_requests(8, ControlListener::new());
        driver.react(connected(false));
        requests.try_iter().for_each(drop);

        let publishing = tokio::spawn({
            let bus = bus.clone();
            async move {
                bus.publish("rates", b"{}".to_vec(), QosLevel::AtMostOnce, false)
                    .await
            }
        });
        requests.recv_async().await.unwrap();

        driver.react(BusEvent::Sent { pkid: 0 });
        publishing.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stop_fails_unacknowledged_publish() {
        let (bus, mut driver, requests) = bus_with_requests(8, ControlListener::new());
        driver.react(connected(false));
        requests.try_iter().for_each(drop);

        let publishing = tokio::spawn({
            let bus = bus.clone();
            async move {
                bus.publish("rates", b"{}".to_vec(), QosLevel::AtLeastOnce, true)
                    .await
            }
        });
        requests.recv_async().await.unwrap();
        driver.react(BusEvent::Sent { pkid: 1 });

        driver.stop();
        assert!(matches!(
            publishing.await.unwrap(),
            Err(BusError::Unacknowledged)
        ));
        assert_eq!(bus.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_publish_refused_while_reconnecting() {
        let (bus, mut driver, requests) = bus_with_requests(8, ControlListener::new());
        driver.react(connected(false));
        driver.react(BusEvent::ConnectionLost("reset".to_string()));
        requests.try_iter().for_each(drop);
        assert_eq!(bus.state(), ConnectionState::Reconnecting);

        assert!(matches!(
            bus.publish("rates", b"{}".to_vec(), QosLevel::ExactlyOnce, true)
                .await,
            Err(BusError::NotConnected)
        ));
        assert!(requests.is_empty());
    }

    #[tokio::test]
    async fn test_new_bus_starts_disconnected() {
        let mut config = Config::default();
        config.mqtt.url = "mqtt://localhost:1883".to_string();
        let (bus, _driver) = MqttBus::connect(&config, ControlListener::new()).unwrap();
        assert_eq!(bus.state(), ConnectionState::Disconnected);
        assert!(matches!(
            bus.publish("rates", b"{}".to_vec(), QosLevel::ExactlyOnce, true).await,
            Err(BusError::NotConnected)
        ));
    }
}
