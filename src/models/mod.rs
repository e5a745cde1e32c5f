use log::warn;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::Sender;


/// One decoded register reading of the meter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measurement {
    /// OBIS medium and channel, "A-B"
    pub prefix: String,
    /// OBIS indicator, mode and tariff, "C.D.E"
    pub ident: String,
    /// OBIS historical value indicator, "F"
    pub suffix: String,
    /// Scaled decimal, hex encoded octet string or "true"/"false"
    pub value: String,
    /// Display name of the unit, empty if the meter sent none
    pub unit: String,
}

impl Measurement {
    /// The key used to tell register readings of the same quantity apart
    pub fn key(&self) -> String {
        format!("{}#{}#{}", self.prefix, self.ident, self.suffix)
    }
}

/// Receiver of decoded measurements.
///
/// `emit` is called synchronously on the thread reading the serial line, once per
/// measurement and in register order. A sink that blocks holds up the read loop.
pub trait MeasurementSink {
    fn emit(&mut self, measurement: Measurement);
}

impl<F> MeasurementSink for F
where
    F: FnMut(Measurement),
{
    fn emit(&mut self, measurement: Measurement) {
        self(measurement)
    }
}

/// Hands measurements to an async consumer. Must not be used from within the runtime,
/// the session runs on a blocking thread for that reason.
impl MeasurementSink for Sender<Measurement> {
    fn emit(&mut self, measurement: Measurement) {
        if let Err(e) = self.blocking_send(measurement) {
            warn!("Measurement {} dropped, receiver is gone", e.0.key());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn measurement(value: &str) -> Measurement {
        Measurement {
            prefix: "1-0".to_string(),
            ident: "1.8.0".to_string(),
            suffix: "255".to_string(),
            value: value.to_string(),
            unit: "Wh".to_string(),
        }
    }

    #[test]
    fn test_measurement_key() {
        assert_eq!(measurement("1").key(), "1-0#1.8.0#255");
    }

    #[test]
    fn test_closure_sink() {
        let mut seen = Vec::new();
        {
            let mut sink = |m: Measurement| seen.push(m);
            sink.emit(measurement("1"));
            sink.emit(measurement("2"));
        }
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].value, "2");
    }

    #[test]
    fn test_channel_sink() {
        let (mut tx, mut rx) = tokio::sync::mpsc::channel(4);
        tx.emit(measurement("42.5"));
        let received = rx.blocking_recv().unwrap();
        assert_eq!(received, measurement("42.5"));
    }

    #[test]
    fn test_channel_sink_closed_receiver() {
        let (mut tx, rx) = tokio::sync::mpsc::channel(1);
        drop(rx);
        // must not panic
        tx.emit(measurement("1"));
    }
}
