use samler::{cache::Spooler, config::Config, filter::MeasurementFilter, metering_sml::SmlListener, mqtt::MqttManager, serial::SerialError};
use std::time::Duration;
use log::{error, info};

/// Pause between two listen sessions on the line
const RELISTEN_DELAY: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() {
    // Initialize logging
    let default_filter = std::env::var("SAMLER_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    info!("SaMLer v{} starting", env!("CARGO_PKG_VERSION"));

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let spool = match Spooler::open(&config.cache) {
        Ok(spool) => spool,
        Err(e) => {
            error!("Unable to open cache {}: {}", config.cache.path, e);
            std::process::exit(1);
        }
    };

    // the serial session hands its measurements to the publisher through this channel
    let (mut mqtt, tx) = MqttManager::new(&config.mqtt, spool);
    let filter = MeasurementFilter::new(&config.filter);
    let publisher = tokio::spawn(async move {
        mqtt.start_thread(filter).await;
    });

    let device = config.device.device.clone();
    let listener = SmlListener::new(config.device, config.transport);
    let session = tokio::task::spawn_blocking(move || -> Result<(), SerialError> {
        let mut sink = tx;
        loop {
            info!("Listen to {}", device);
            listener.listen(&mut sink)?;
            std::thread::sleep(RELISTEN_DELAY);
        }
    });

    match session.await {
        Ok(Err(e)) => error!("Serial line failed: {}", e),
        Ok(Ok(())) => info!("Listener finished"),
        Err(e) => error!("Listener thread failed: {}", e),
    }

    // the session dropped its sender, the publisher drains the queue and ends
    if let Err(e) = publisher.await {
        error!("Publisher failed: {}", e);
    }
    std::process::exit(1);
}
