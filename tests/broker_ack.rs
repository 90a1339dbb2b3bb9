use rate_service::{
    Bus, BusError, Config, ConnectionState, ControlListener, MqttBus, Payload, PublishError,
    Publisher,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[tokio::test]
async fn test_publish_without_broker_is_not_reported_sent() {
    // Nothing listens on port 1
    let config = Config::with_overlay(json!({
        "mqtt": { "url": "mqtt://127.0.0.1:1", "publish_timeout_secs": 1 }
    }))
    .unwrap();
    let (bus, driver) = MqttBus::connect(&config, ControlListener::new()).unwrap();
    let (stop_tx, stop_rx) = watch::channel(false);
    let driving = tokio::spawn(driver.run(stop_rx));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_ne!(bus.state(), ConnectionState::Connected);

    let publisher = Publisher::from_config(Arc::new(bus.clone()), &config);
    let result = publisher.publish(&Payload::Raw(b"{}".to_vec())).await;
    assert!(matches!(
        result,
        Err(PublishError::Bus {
            source: BusError::NotConnected,
            ..
        })
    ));

    let _ = stop_tx.send(true);
    driving.await.unwrap();
    assert_eq!(bus.state(), ConnectionState::Disconnected);
}
