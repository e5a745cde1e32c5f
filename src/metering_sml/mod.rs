use crate::models::{Measurement, MeasurementSink};
use crate::serial::{open_line, LineConfig, SerialError};
use log::{debug, error, info, warn};
use std::io::{self, Read};
use thiserror::Error;

pub mod structs;
pub mod parser;
pub mod transport;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_utils;

use structs::*;
use parser::*;
use transport::TransportOptions;
use utils::*;

/// Start and end sequence of the transport envelope
const ENVELOPE_LEN: usize = 8;

#[derive(Error, Debug)]
pub enum SmlError {
    #[error("Frame too short ({0} bytes)")]
    FrameTooShort(usize),
    #[error("No SML message found")]
    InvalidMessage,
    #[error("SML parse error: {0}")]
    ParseError(String),
}

/// Reasons a list entry does not yield a measurement
#[derive(Error, Debug, PartialEq, Eq)]
pub enum MalformedEntry {
    #[error("entry has no value")]
    MissingValue,
    #[error("object name has {0} bytes instead of 6")]
    InvalidObjName(usize),
    #[error("value type is not supported")]
    UnsupportedType,
}

/// Decodes one transport frame and emits a measurement for every usable list entry.
///
/// `raw` is a complete frame including the 8 byte start and end sequences. Entries without
/// a value, with an object name that is no OBIS code or with a list value are skipped.
/// Returns the number of emitted measurements.
pub fn decode_frame<S: MeasurementSink + ?Sized>(raw: &[u8], sink: &mut S) -> Result<usize, SmlError> {
    if raw.len() < 2 * ENVELOPE_LEN {
        return Err(SmlError::FrameTooShort(raw.len()));
    }

    let file = parse_sml_file(&raw[ENVELOPE_LEN..raw.len() - ENVELOPE_LEN])?;
    let mut emitted = 0;

    for message in &file.messages {
        let response = match &message.message_body {
            SmlMessageBody::GetListResponse(response) => response,
            _ => continue,
        };

        debug!(
            "GetList response from {} with {} entries",
            hex::encode(&response.server_id),
            response.val_list.len()
        );

        for entry in &response.val_list {
            match decode_entry(entry) {
                Ok(measurement) => {
                    sink.emit(measurement);
                    emitted += 1;
                }
                Err(e) => warn!("Skipping entry {}: {}", hex::encode(&entry.obj_name), e),
            }
        }
    }

    Ok(emitted)
}

pub fn decode_entry(entry: &SmlListEntry) -> Result<Measurement, MalformedEntry> {
    let value = entry.value.as_ref().ok_or(MalformedEntry::MissingValue)?;
    let obis = SmlObisCode::from_bytes(&entry.obj_name)
        .ok_or(MalformedEntry::InvalidObjName(entry.obj_name.len()))?;
    let (value, unit) = format_value(value, entry.scaler, entry.unit).ok_or(MalformedEntry::UnsupportedType)?;

    Ok(Measurement {
        prefix: obis.prefix(),
        ident: obis.ident(),
        suffix: obis.suffix(),
        value,
        unit,
    })
}

/// Reads frames from `reader` until it ends and decodes each of them into `sink`.
/// Frames that do not decode are logged and dropped.
pub fn decode_stream<R, S>(reader: &mut R, options: &TransportOptions, sink: &mut S) -> io::Result<()>
where
    R: Read + ?Sized,
    S: MeasurementSink + ?Sized,
{
    transport::listen(reader, options, |frame| match decode_frame(frame, &mut *sink) {
        Ok(count) => debug!("Decoded {} measurements", count),
        Err(e) => warn!("Dropping SML frame: {}", e),
    })
}

/// One listen session on the serial line
pub struct SmlListener {
    line: LineConfig,
    options: TransportOptions,
}

impl SmlListener {
    pub fn new(line: LineConfig, options: TransportOptions) -> Self {
        Self { line, options }
    }

    /// Opens the line and decodes telegrams into `sink` until the line fails.
    ///
    /// Errors opening or configuring the line are returned. A failing read ends the session
    /// with `Ok(())`, the port is closed on return.
    pub fn listen<S: MeasurementSink + ?Sized>(&self, sink: &mut S) -> Result<(), SerialError> {
        let mut port = open_line(self.line.clone())?;
        info!("Listening for SML telegrams on {}", self.line.device);

        match decode_stream(&mut port, &self.options, sink) {
            Ok(()) => info!("Line {} closed", self.line.device),
            Err(e) => error!("Reading from {} failed: {}", self.line.device, e),
        }

        Ok(())
    }
}
