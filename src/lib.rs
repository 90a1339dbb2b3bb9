//! Rate Service
//!
//! Pulls exchange rates from HTTP price APIs once a minute and republishes
//! them over MQTT, so consumers get fresh rates without polling the APIs.
//!
//! # Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Scheduler                         │
//! │  (second 0 of every minute, one cycle in flight)     │
//! └────────────────────────┬────────────────────────────┘
//!                          │
//!                          ▼
//! ┌─────────────────────────────────────────────────────┐
//! │                RateFetcher Trait                     │
//! │  - fetch() -> Payload                                │
//! └────────────────────────┬────────────────────────────┘
//!          ┌───────────────┴───────────────┐
//!          ▼                               ▼
//! ┌──────────────────┐          ┌──────────────────────┐
//! │ CrossRateFetcher │          │  PassThroughFetcher  │
//! │ (price + list)   │          │  (raw body)          │
//! └────────┬─────────┘          └──────────┬───────────┘
//!          └───────────────┬───────────────┘
//!                          ▼
//! ┌─────────────────────────────────────────────────────┐
//! │        Publisher  ──►  Bus (MQTT)  ◄── Control       │
//! │  topic "rates", qos 2, retain      "rateservicecontrol"
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod bus;
pub mod config;
pub mod control;
pub mod error;
pub mod models;
pub mod publisher;
pub mod rate_fetcher;
pub mod scheduler;
pub mod service;

// Re-export commonly used types
pub use bus::{Bus, ConnectionState, MemoryBus, MqttBus, CONTROL_TOPIC};
pub use config::{Config, FetchStrategy, QosLevel, CONFIG_FILE};
pub use control::ControlListener;
pub use error::{BusError, ConfigError, ControlError, CycleError, FetchError, PublishError};
pub use models::{ControlMessage, Payload, RateEntry, RateMap, ScheduleTrigger};
pub use publisher::Publisher;
pub use rate_fetcher::{CrossRateFetcher, PassThroughFetcher, RateFetcher, StaticRateFetcher};
pub use scheduler::Scheduler;
pub use service::{RateService, ServiceContext};

/// Version of the rate service
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the package
pub const NAME: &str = env!("CARGO_PKG_NAME");
