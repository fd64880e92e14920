pub mod bridge;
pub mod config;
pub mod mqtt;
pub mod payload;
pub mod sensor;

#[cfg(test)]
mod testing;

use crate::bridge::{PublishLoop, RetryPolicy};
use crate::config::Config;
use crate::mqtt::mqtt_handler::{keep_alive_for, MqttHandler};
use crate::mqtt::supervisor::ConnectionSupervisor;
use crate::payload::DiscoveryAnnouncer;
use crate::sensor::bme680::Bme680;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use std::str::FromStr;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    info!(
        "Starting {} v{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let config = Config::load().await.wrap_err("Failed to load configuration")?;
    info!(
        "Sensor on i2c-{} at 0x{:02x}, publishing to '{}' on {} every {}s",
        config.sensor.i2c_bus,
        config.sensor.i2c_address,
        config.bridge.data_topic,
        config.mqtt.endpoint(),
        config.bridge.poll_interval_secs
    );

    let sensor = Bme680::open(config.sensor.i2c_bus, config.sensor.i2c_address)
        .await
        .wrap_err("Failed to initialise BME680")?;

    let keep_alive = keep_alive_for(
        config.poll_interval(),
        Duration::from_secs(config.bridge.backoff_max_secs.unwrap_or(config.bridge.backoff_secs)),
    );
    let transport = MqttHandler::new(&config.mqtt, &config.client_id(), keep_alive);
    let supervisor = ConnectionSupervisor::new(
        Box::new(transport),
        config.mqtt.endpoint(),
        config.mqtt.connect_timeout(),
    );
    let announcer =
        DiscoveryAnnouncer::from_config(&config).wrap_err("Failed to build discovery payload")?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    let publish_loop = PublishLoop::create(
        bridge::LoopSettings::from_config(&config),
        Box::new(sensor),
        supervisor,
        announcer,
        RetryPolicy::from_config(&config.bridge),
        shutdown,
    );

    match publish_loop.run().await {
        Ok(stats) => {
            info!("Shut down cleanly: {}", stats);
            Ok(())
        }
        Err(e) => {
            error!("Publish loop failed: {}", e);
            Err(color_eyre::Report::new(e).wrap_err("Sensor bridge stopped"))
        }
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|value| Level::from_str(&value).ok())
        .unwrap_or(Level::INFO);

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .init();
}

/// Cancels `shutdown` on SIGINT or SIGTERM.
fn spawn_signal_handler(shutdown: CancellationToken) -> Result<()> {
    let mut terminate =
        signal(SignalKind::terminate()).wrap_err("Failed to install SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("Failed to listen for SIGINT: {}", e);
                    return;
                }
                info!("SIGINT received, shutting down");
            }
            _ = terminate.recv() => info!("SIGTERM received, shutting down"),
        }
        shutdown.cancel();
    });
    Ok(())
}
