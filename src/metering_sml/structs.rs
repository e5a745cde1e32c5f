// SML Protocol Data Structures

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub struct SmlFile {
    pub messages: Vec<SmlMessage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SmlMessage {
    pub transaction_id: Vec<u8>,
    pub group_no: u8,
    pub abort_on_error: u8,
    pub message_body: SmlMessageBody,
    pub crc: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SmlMessageBody {
    OpenResponse(SmlOpenResponse),
    CloseResponse(SmlCloseResponse),
    GetListResponse(SmlGetListResponse),
    /// Any body we do not decode, kept with its tag
    Other(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SmlOpenResponse {
    pub codepage: Option<Vec<u8>>,
    pub client_id: Option<Vec<u8>>,
    pub req_file_id: Vec<u8>,
    pub server_id: Vec<u8>,
    pub ref_time: Option<SmlTime>,
    pub sml_version: Option<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SmlCloseResponse {
    pub global_signature: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SmlGetListResponse {
    pub client_id: Option<Vec<u8>>,
    pub server_id: Vec<u8>,
    pub list_name: Option<Vec<u8>>,
    pub act_sensor_time: Option<SmlTime>,
    pub val_list: Vec<SmlListEntry>,
    pub list_signature: Option<Vec<u8>>,
    pub act_gateway_time: Option<SmlTime>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SmlListEntry {
    pub obj_name: Vec<u8>,
    pub status: Option<u64>,
    pub val_time: Option<SmlTime>,
    pub unit: Option<u8>,
    pub scaler: Option<i8>,
    pub value: Option<SmlValue>,
    pub value_signature: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SmlValue {
    OctetString(Vec<u8>),
    Boolean(bool),
    Integer(i64),
    Unsigned(u64),
    List(Vec<SmlValue>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SmlTime {
    SecIndex(u32),
    Timestamp(u32),
    LocalTimestamp {
        timestamp: u32,
        local_offset: i16,
        season_time_offset: i16,
    },
}

// SML-specific OBIS code format (6 bytes)
#[derive(Debug, Clone, PartialEq)]
pub struct SmlObisCode {
    pub medium: u8,      // 0: abstract, 1: electricity, etc.
    pub channel: u8,     // 0-255
    pub indicator: u8,   // Physical value indicator
    pub mode: u8,        // Processing method
    pub tariff: u8,      // Tariff/time
    pub previous: u8,    // Historical value indicator
}

impl SmlObisCode {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() == 6 {
            Some(SmlObisCode {
                medium: bytes[0],
                channel: bytes[1],
                indicator: bytes[2],
                mode: bytes[3],
                tariff: bytes[4],
                previous: bytes[5],
            })
        } else {
            None
        }
    }

    /// "A-B"
    pub fn prefix(&self) -> String {
        format!("{}-{}", self.medium, self.channel)
    }

    /// "C.D.E"
    pub fn ident(&self) -> String {
        format!("{}.{}.{}", self.indicator, self.mode, self.tariff)
    }

    /// "F"
    pub fn suffix(&self) -> String {
        self.previous.to_string()
    }
}

/// "A-B:C.D.E*F"
impl fmt::Display for SmlObisCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}:{}.{}.{}*{}", self.medium, self.channel, self.indicator, self.mode, self.tariff, self.previous)
    }
}
