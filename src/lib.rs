//! SaMLer reads SML telegrams of a smart meter from a serial line
//!
//! The serial line is configured for raw 8-N-1 reception, the transport frames are decoded
//! into one `Measurement` per register entry and handed to a `MeasurementSink`. The binary
//! filters those and publishes them to MQTT, caching them on disk while the broker is away.

pub mod cache;
pub mod config;
pub mod filter;
pub mod metering_sml;
pub mod models;
pub mod mqtt;
pub mod serial;

// Re-export common types for easier access
pub use config::Config;
pub use metering_sml::{decode_frame, SmlError, SmlListener};
pub use models::{Measurement, MeasurementSink};
pub use serial::{open_line, LineConfig, SerialError};
