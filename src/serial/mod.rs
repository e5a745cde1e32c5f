use std::str::FromStr;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use thiserror::Error;

/// Reads block this long before the transport listener polls again
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Device configuration of the line the meter is attached to
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LineConfig {
    pub device: String,
    pub baud_rate: u32,
    pub mode: String,
}

impl Default for LineConfig {
    fn default() -> Self {
        LineConfig {
            device: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            mode: "8-N-1".to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum SerialError {
    #[error("open({device}): {source}")]
    Open {
        device: String,
        #[source]
        source: serialport::Error,
    },
    #[error("unsupported mode: {0}")]
    UnsupportedMode(String),
    #[error("unsupported baud rate: {0}")]
    UnsupportedBaudRate(u32),
    #[error("unable to configure line: {0}")]
    Configure(#[from] serialport::Error),
}

/// Character framing of the line, written as data bits, parity and stop bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineMode {
    EightNoneOne,
}

impl FromStr for LineMode {
    type Err = SerialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "8-N-1" => Ok(LineMode::EightNoneOne),
            _ => Err(SerialError::UnsupportedMode(s.to_string())),
        }
    }
}

impl LineMode {
    pub fn data_bits(&self) -> DataBits {
        match self {
            LineMode::EightNoneOne => DataBits::Eight,
        }
    }

    pub fn parity(&self) -> Parity {
        match self {
            LineMode::EightNoneOne => Parity::None,
        }
    }

    pub fn stop_bits(&self) -> StopBits {
        match self {
            LineMode::EightNoneOne => StopBits::One,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaudRate {
    B9600,
}

impl BaudRate {
    pub fn from_u32(rate: u32) -> Result<Self, SerialError> {
        match rate {
            9600 => Ok(BaudRate::B9600),
            _ => Err(SerialError::UnsupportedBaudRate(rate)),
        }
    }

    pub fn as_u32(&self) -> u32 {
        match self {
            BaudRate::B9600 => 9600,
        }
    }
}

/// Opens the device and puts it into raw 8-N-1 mode.
///
/// The port is opened before the mode and baud rate are checked, so an unusable device
/// is reported first. On a validation error the port is dropped, and with it closed,
/// before the error is returned.
pub fn open_line(config: LineConfig) -> Result<Box<dyn SerialPort>, SerialError> {
    debug!("Opening {} with {} baud, {}", config.device, config.baud_rate, config.mode);

    let mut port = serialport::new(config.device.as_str(), BaudRate::B9600.as_u32())
        .flow_control(FlowControl::None)
        .timeout(READ_TIMEOUT)
        .open()
        .map_err(|source| SerialError::Open {
            device: config.device.clone(),
            source,
        })?;

    // Some optical heads draw their power from RTS
    if let Err(e) = port.write_request_to_send(true) {
        warn!("Unable to set RTS on {}: {}", config.device, e);
    }

    let mode: LineMode = config.mode.parse()?;
    let baud_rate = BaudRate::from_u32(config.baud_rate)?;

    port.set_data_bits(mode.data_bits())?;
    port.set_parity(mode.parity())?;
    port.set_stop_bits(mode.stop_bits())?;
    port.set_flow_control(FlowControl::None)?;
    port.set_baud_rate(baud_rate.as_u32())?;

    info!("Opened {} at {} baud ({})", config.device, baud_rate.as_u32(), config.mode);
    Ok(port)
}
