//! main.rs - Entry point for the Rate Service
//!
//! Usage: `rateservice [config-file]` (defaults to `rateservice.conf`)

use log::{error, info};
use rate_service::{Config, RateService, CONFIG_FILE, NAME, VERSION};

fn init_logging(filter: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter))
        .format_timestamp_millis()
        .init();
}

/// Resolves on Ctrl-C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args().nth(1).unwrap_or_else(|| CONFIG_FILE.to_string());

    let config = match Config::load(&path) {
        Ok(config) => config,
        Err(e) => {
            init_logging("info");
            error!("{}", e);
            std::process::exit(1);
        }
    };

    init_logging(&config.log_filter());
    info!("Started RateService ({} v{})", NAME, VERSION);
    info!(
        "Publishing {:?} rates to {} on topic '{}'",
        config.fetcher.strategy, config.mqtt.url, config.mqtt.rates.topic
    );

    if let Err(e) = RateService::start(config, shutdown_signal()).await {
        error!("Fatal: {:#}", e);
        return Err(e);
    }

    info!("Stopped RateService");
    Ok(())
}
