use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::time::MissedTickBehavior;

use crate::cache::{CacheEntry, Spooler};
use crate::config::MqttConfig;
use crate::filter::MeasurementFilter;
use crate::models::Measurement;

/// Measurements waiting for the publisher. A full queue blocks the serial session.
const QUEUE_SIZE: usize = 100;
/// Publish requests the client buffers for the event loop
const REQUEST_CAP: usize = 100;
const REPLAY_INTERVAL: Duration = Duration::from_secs(1);
/// Cached measurements sent per replay tick
const REPLAY_BATCH: usize = 50;

#[derive(Debug, Serialize)]
pub struct MeasurementPayload {
    pub prefix: String,
    pub ident: String,
    pub suffix: String,
    /// A number where the value parses as one, the plain text otherwise
    pub value: serde_json::Value,
    pub unit: String,
    pub time: DateTime<Utc>,
}

impl MeasurementPayload {
    pub fn new(measurement: &Measurement, time: DateTime<Utc>) -> Self {
        let value = measurement
            .value
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(serde_json::Value::Number)
            .unwrap_or_else(|| serde_json::Value::String(measurement.value.clone()));

        MeasurementPayload {
            prefix: measurement.prefix.clone(),
            ident: measurement.ident.clone(),
            suffix: measurement.suffix.clone(),
            value,
            unit: measurement.unit.clone(),
            time,
        }
    }
}

pub fn topic_for(base_topic: &str, measurement: &Measurement) -> String {
    format!("{}/{}/{}/{}", base_topic, measurement.prefix, measurement.ident, measurement.suffix)
}

/// Hands `entry` to the client without waiting. Fails while the broker is not connected
/// or the client's request queue is full.
fn publish(client: &AsyncClient, connected: &AtomicBool, base_topic: &str, entry: &CacheEntry) -> bool {
    if !connected.load(Ordering::Relaxed) {
        return false;
    }

    let topic = topic_for(base_topic, &entry.measurement);
    let payload = match serde_json::to_string(&MeasurementPayload::new(&entry.measurement, entry.time)) {
        Ok(payload) => payload,
        Err(e) => {
            // dropped, it would not serialize from the cache either
            error!("Unable to serialize {}: {}", entry.measurement.key(), e);
            return true;
        }
    };

    match client.try_publish(topic.clone(), QoS::AtLeastOnce, false, payload) {
        Err(e) => {
            warn!("Error publishing to {}: {}", topic, e);
            false
        }
        Ok(_) => {
            debug!("Published {} = {} {}", topic, entry.measurement.value, entry.measurement.unit);
            true
        }
    }
}

pub struct MqttManager {
    rx: Receiver<Measurement>,
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    base_topic: String,
    spool: Spooler,
}

impl MqttManager {
    /// Connects to the broker and returns the manager with the sender measurements are
    /// queued on. Measurements the broker does not take go to `spool`. Must be called from
    /// within the tokio runtime.
    pub fn new(config: &MqttConfig, spool: Spooler) -> (Self, Sender<Measurement>) {
        let (mtx, mrx) = tokio::sync::mpsc::channel(QUEUE_SIZE);

        info!("MQTT connection to {}:{} starting up", config.host, config.port);
        let mut mqttoptions = MqttOptions::new(config.client_name.clone(), config.host.clone(), config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(5));
        if !config.user.is_empty() {
            mqttoptions.set_credentials(config.user.clone(), config.pass.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, REQUEST_CAP);
        let connected = Arc::new(AtomicBool::new(false));

        let state = connected.clone();
        tokio::spawn(async move {
            info!("MQTT Eventloop started");
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected to MQTT broker");
                        state.store(true, Ordering::Relaxed);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        state.store(false, Ordering::Relaxed);
                        error!("Error in MQTT {:?}, reconnecting", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        (
            MqttManager {
                rx: mrx,
                client,
                connected,
                base_topic: config.base_topic.clone(),
                spool,
            },
            mtx,
        )
    }

    /// Publishes every measurement passing `filter` until all senders are gone. Cached
    /// measurements are replayed in between while the circuit is closed.
    pub async fn start_thread(&mut self, mut filter: MeasurementFilter) {
        let mut replay = tokio::time::interval(REPLAY_INTERVAL);
        replay.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                received = self.rx.recv() => {
                    let Some(measurement) = received else {
                        break;
                    };
                    let now = Utc::now();
                    if !filter.should_publish(&measurement, now) {
                        continue;
                    }

                    let (client, connected, base_topic) = (&self.client, &self.connected, &self.base_topic);
                    self.spool.submit(CacheEntry { measurement, time: now }, now, |entry| {
                        publish(client, connected, base_topic, entry)
                    });
                }
                _ = replay.tick() => {
                    let (client, connected, base_topic) = (&self.client, &self.connected, &self.base_topic);
                    self.spool.replay(Utc::now(), REPLAY_BATCH, |entry| publish(client, connected, base_topic, entry));
                }
            }
        }

        info!("Measurement channel closed, MQTT publishing stopped");
    }
}
