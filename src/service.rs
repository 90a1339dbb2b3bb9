//! service.rs - Wires the components together and runs them
//!
//! `ServiceContext` owns everything one refresh cycle needs: configuration,
//! the shared bus handle, the fetch strategy and the publisher. It is passed
//! explicitly to the scheduler callback.

use log::{debug, error, info, warn};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

use crate::bus::{Bus, MqttBus};
use crate::config::Config;
use crate::control::ControlListener;
use crate::error::CycleError;
use crate::models::ScheduleTrigger;
use crate::publisher::Publisher;
use crate::rate_fetcher::{self, RateFetcher};
use crate::scheduler::Scheduler;

pub struct ServiceContext {
    config: Config,
    bus: Arc<dyn Bus>,
    fetcher: Arc<dyn RateFetcher>,
    publisher: Publisher,
}

impl ServiceContext {
    pub fn new(config: Config, bus: Arc<dyn Bus>, fetcher: Arc<dyn RateFetcher>) -> Self {
        let publisher = Publisher::from_config(bus.clone(), &config);
        ServiceContext {
            config,
            bus,
            fetcher,
            publisher,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &Arc<dyn Bus> {
        &self.bus
    }

    /// One fetch-then-publish cycle. Nothing is published unless every
    /// fetch step succeeded.
    pub async fn run_cycle(&self, trigger: ScheduleTrigger) -> Result<(), CycleError> {
        if !self.bus.is_connected() {
            return Err(CycleError::NotConnected);
        }

        debug!("Starting update {} ({})", trigger, self.fetcher.name());
        let payload = self.fetcher.fetch().await?;
        self.publisher.publish(&payload).await?;
        Ok(())
    }

    /// Run a cycle and log its outcome. Never fails.
    pub async fn refresh(self: Arc<Self>, trigger: ScheduleTrigger) {
        match self.run_cycle(trigger).await {
            Ok(()) => debug!("Update {} complete", trigger),
            Err(e @ CycleError::NotConnected) => warn!("Update {}: {}", trigger, e),
            Err(e) => error!("Update {} failed: {}", trigger, e),
        }
    }
}

/// The running service: MQTT bus, control listener and scheduler
pub struct RateService {
    context: Arc<ServiceContext>,
    scheduler: Scheduler,
}

impl RateService {
    pub fn new(context: ServiceContext) -> Self {
        RateService {
            context: Arc::new(context),
            scheduler: Scheduler::new(),
        }
    }

    pub fn context(&self) -> &Arc<ServiceContext> {
        &self.context
    }

    /// Connect to the configured broker and run until `shutdown` resolves
    pub async fn start(config: Config, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        let fetcher: Arc<dyn RateFetcher> = Arc::from(rate_fetcher::from_config(&config.fetcher)?);
        let (bus, driver) = MqttBus::connect(&config, ControlListener::new())?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let driver_task = tokio::spawn(driver.run(stop_rx));

        let service = RateService::new(ServiceContext::new(config, Arc::new(bus), fetcher));
        service.run(shutdown).await;

        let _ = stop_tx.send(true);
        if let Err(e) = driver_task.await {
            error!("MQTT driver task failed: {}", e);
        }
        Ok(())
    }

    /// Tick until `shutdown` resolves, then close the bus connection
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let context = self.context.clone();
        let ticking = self
            .scheduler
            .run(move |trigger| context.clone().refresh(trigger), stop_rx);

        tokio::select! {
            _ = ticking => {}
            _ = shutdown => info!("Cleaning up..."),
        }
        drop(stop_tx);

        if let Err(e) = self.context.bus.disconnect().await {
            warn!("Failed to disconnect from bus: {}", e);
        }
    }
}
