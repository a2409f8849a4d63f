use argh::FromArgs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

use birdnet_timescale::config::BridgeConfig;
use birdnet_timescale::mqtt::{qos_from_u8, MqttClient, Processor};
use birdnet_timescale::timescale::TimescaleClient;

/// BirdNET bridge: stores MQTT bird detections in TimescaleDB.
#[derive(FromArgs)]
struct Args {
    /// path to a YAML configuration file (defaults + environment if omitted)
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,
}

/// Filter used when `RUST_LOG` is unset: `LOG_LEVEL` if given, else `info`.
fn default_log_filter(lookup: impl Fn(&str) -> Option<String>) -> String {
    lookup("LOG_LEVEL")
        .map(|level| level.trim().to_ascii_lowercase())
        .filter(|level| !level.is_empty())
        .unwrap_or_else(|| "info".to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_log_filter(|key| {
            std::env::var(key).ok()
        })),
    )
    .init();

    let args: Args = argh::from_env();

    if let Some(path) = &args.config {
        log::info!("Loading config from: {}", path.display());
    }
    let config = BridgeConfig::resolve(args.config.as_deref())?;
    log::info!(
        "Broker: {}, Topic: {}, QoS: {}, Timezone: {}",
        config.mqtt.address,
        config.mqtt.topic,
        config.mqtt.qos,
        config.timezone
    );

    // Graceful shutdown
    let (shutdown_tx, mut shutdown_rx) = watch::channel(());
    ctrlc::set_handler(move || {
        log::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    })?;

    let timescale = Arc::new(TimescaleClient::connect(&config.timescale).await?);
    if config.timescale.create_schema {
        timescale.ensure_schema().await?;
    }

    let mqtt = Arc::new(MqttClient::new(&config.mqtt)?);
    mqtt.connect().await?;

    let processor = Processor::new(mqtt.clone(), timescale.clone(), config.timezone.clone());
    processor
        .start(&config.mqtt.topic, qos_from_u8(config.mqtt.qos)?)
        .await?;

    log::info!("birdnet-timescale started on topic '{}'", config.mqtt.topic);

    let _ = shutdown_rx.changed().await;

    log::info!("Shutting down, disconnecting from broker...");
    mqtt.disconnect().await;
    timescale.close().await;

    let stats = processor.stats();
    log::info!(
        "Processed {} messages: {} stored, {} dropped (decode {}, transform {}, persist {})",
        stats.received,
        stats.stored,
        stats.dropped(),
        stats.decode_failures,
        stats.transform_failures,
        stats.persist_failures
    );

    Ok(())
}
