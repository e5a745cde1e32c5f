use super::structs::*;
use super::SmlError;
use log::{debug, warn};

// Type-length field
const SML_ANOTHER_TL: u8 = 0x80;
const SML_TYPE_FIELD: u8 = 0x70;
const SML_LENGTH_FIELD: u8 = 0x0F;

const SML_TYPE_OCTET_STRING: u8 = 0x00;
const SML_TYPE_BOOLEAN: u8 = 0x40;
const SML_TYPE_INTEGER: u8 = 0x50;
const SML_TYPE_UNSIGNED: u8 = 0x60;
const SML_TYPE_LIST: u8 = 0x70;

const SML_OPTIONAL_SKIPPED: u8 = 0x01;
const SML_END_OF_MESSAGE: u8 = 0x00;

// SML Message Type constants
pub const SML_OPEN_RESPONSE: u32 = 0x0101;
pub const SML_CLOSE_RESPONSE: u32 = 0x0201;
pub const SML_GET_LIST_RESPONSE: u32 = 0x0701;

// SML_Time choices
const SML_TIME_SEC_INDEX: u8 = 0x01;
const SML_TIME_TIMESTAMP: u8 = 0x02;
const SML_TIME_LOCAL_TIMESTAMP: u8 = 0x03;

const MAX_TL_BYTES: usize = 4;
const MAX_NESTING: usize = 16;

/// Parses the content of one SML file, the transport envelope already removed.
///
/// Parsing stops at the end of the data or at the first padding byte. A message that
/// can not be parsed ends the file, the messages before it are kept.
pub fn parse_sml_file(data: &[u8]) -> Result<SmlFile, SmlError> {
    debug!("Parsing SML file of {} bytes", data.len());

    let mut parser = SmlParser::new(data);
    parser.parse_sml_file()
}

struct SmlParser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SmlParser<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn parse_sml_file(&mut self) -> Result<SmlFile, SmlError> {
        let mut messages = Vec::new();

        while self.pos < self.data.len() && self.data[self.pos] != SML_END_OF_MESSAGE {
            match self.parse_sml_message() {
                Ok(message) => messages.push(message),
                Err(e) => {
                    warn!("Failed to parse SML message at position {}: {}", self.pos, e);
                    break;
                }
            }
        }

        if messages.is_empty() {
            return Err(SmlError::InvalidMessage);
        }

        Ok(SmlFile { messages })
    }

    fn parse_sml_message(&mut self) -> Result<SmlMessage, SmlError> {
        self.expect_list(6, "SML_Message")?;
        let transaction_id = self.parse_octet_string()?;
        let group_no = self.parse_unsigned8()?;
        let abort_on_error = self.parse_unsigned8()?;
        let message_body = self.parse_message_body()?;
        let crc = self.parse_unsigned16()?;
        self.parse_end_of_message()?;

        Ok(SmlMessage {
            transaction_id,
            group_no,
            abort_on_error,
            message_body,
            crc,
        })
    }

    fn parse_message_body(&mut self) -> Result<SmlMessageBody, SmlError> {
        self.expect_list(2, "SML_MessageBody")?;
        let tag = self.parse_unsigned32()?;

        let body = match tag {
            SML_OPEN_RESPONSE => SmlMessageBody::OpenResponse(self.parse_open_response()?),
            SML_CLOSE_RESPONSE => SmlMessageBody::CloseResponse(self.parse_close_response()?),
            SML_GET_LIST_RESPONSE => SmlMessageBody::GetListResponse(self.parse_get_list_response()?),
            _ => {
                debug!("Skipping SML message body 0x{:04x}", tag);
                self.skip_element(0)?;
                SmlMessageBody::Other(tag)
            }
        };

        Ok(body)
    }

    fn parse_open_response(&mut self) -> Result<SmlOpenResponse, SmlError> {
        self.expect_list(6, "SML_PublicOpen.Res")?;
        let codepage = self.parse_optional_octet_string()?;
        let client_id = self.parse_optional_octet_string()?;
        let req_file_id = self.parse_octet_string()?;
        let server_id = self.parse_octet_string()?;
        let ref_time = self.parse_optional_time()?;
        let sml_version = self.parse_optional_unsigned8()?;

        Ok(SmlOpenResponse {
            codepage,
            client_id,
            req_file_id,
            server_id,
            ref_time,
            sml_version,
        })
    }

    fn parse_close_response(&mut self) -> Result<SmlCloseResponse, SmlError> {
        self.expect_list(1, "SML_PublicClose.Res")?;
        let global_signature = self.parse_optional_octet_string()?;

        Ok(SmlCloseResponse { global_signature })
    }

    fn parse_get_list_response(&mut self) -> Result<SmlGetListResponse, SmlError> {
        self.expect_list(7, "SML_GetList.Res")?;
        let client_id = self.parse_optional_octet_string()?;
        let server_id = self.parse_octet_string()?;
        let list_name = self.parse_optional_octet_string()?;
        let act_sensor_time = self.parse_optional_time()?;
        let val_list = self.parse_val_list()?;
        let list_signature = self.parse_optional_octet_string()?;
        let act_gateway_time = self.parse_optional_time()?;

        Ok(SmlGetListResponse {
            client_id,
            server_id,
            list_name,
            act_sensor_time,
            val_list,
            list_signature,
            act_gateway_time,
        })
    }

    fn parse_val_list(&mut self) -> Result<Vec<SmlListEntry>, SmlError> {
        let list_length = self.parse_list_length("SML_List")?;
        let mut entries = Vec::with_capacity(list_length.min(64));

        for _ in 0..list_length {
            entries.push(self.parse_list_entry()?);
        }

        Ok(entries)
    }

    fn parse_list_entry(&mut self) -> Result<SmlListEntry, SmlError> {
        self.expect_list(7, "SML_ListEntry")?;
        let obj_name = self.parse_octet_string()?;
        let status = self.parse_optional_unsigned()?;
        let val_time = self.parse_optional_time()?;
        let unit = self.parse_optional_unsigned8()?;
        let scaler = self.parse_optional_integer8()?;
        let value = self.parse_optional_value()?;
        let value_signature = self.parse_optional_octet_string()?;

        Ok(SmlListEntry {
            obj_name,
            status,
            val_time,
            unit,
            scaler,
            value,
            value_signature,
        })
    }

    fn parse_optional_time(&mut self) -> Result<Option<SmlTime>, SmlError> {
        if self.optional_skipped() {
            return Ok(None);
        }

        // Older meters send the seconds index without the choice around it
        if self.peek_type()? == SML_TYPE_UNSIGNED {
            return Ok(Some(SmlTime::SecIndex(self.parse_unsigned32()?)));
        }

        self.expect_list(2, "SML_Time")?;
        let time = match self.parse_unsigned8()? {
            SML_TIME_SEC_INDEX => SmlTime::SecIndex(self.parse_unsigned32()?),
            SML_TIME_TIMESTAMP => SmlTime::Timestamp(self.parse_unsigned32()?),
            SML_TIME_LOCAL_TIMESTAMP => {
                self.expect_list(3, "SML_TimestampLocal")?;
                let timestamp = self.parse_unsigned32()?;
                let local_offset = self.parse_integer16()?;
                let season_time_offset = self.parse_integer16()?;
                SmlTime::LocalTimestamp {
                    timestamp,
                    local_offset,
                    season_time_offset,
                }
            }
            choice => {
                return Err(SmlError::ParseError(format!("Unknown SML_Time choice {}", choice)));
            }
        };

        Ok(Some(time))
    }

    fn parse_optional_value(&mut self) -> Result<Option<SmlValue>, SmlError> {
        if self.optional_skipped() {
            return Ok(None);
        }
        Ok(Some(self.parse_value(0)?))
    }

    fn parse_value(&mut self, depth: usize) -> Result<SmlValue, SmlError> {
        if depth > MAX_NESTING {
            return Err(SmlError::ParseError("Values nested too deep".to_string()));
        }

        match self.peek_type()? {
            SML_TYPE_OCTET_STRING => Ok(SmlValue::OctetString(self.parse_octet_string()?)),
            SML_TYPE_BOOLEAN => Ok(SmlValue::Boolean(self.parse_bool()?)),
            SML_TYPE_INTEGER => Ok(SmlValue::Integer(self.parse_integer()?)),
            SML_TYPE_UNSIGNED => Ok(SmlValue::Unsigned(self.parse_unsigned()?)),
            SML_TYPE_LIST => {
                let count = self.parse_list_length("SML_Value")?;
                let mut values = Vec::with_capacity(count.min(16));
                for _ in 0..count {
                    values.push(self.parse_value(depth + 1)?);
                }
                Ok(SmlValue::List(values))
            }
            other => Err(SmlError::ParseError(format!("Unknown value type 0x{:02x}", other))),
        }
    }

    // Basic type parsers
    fn next_byte(&mut self) -> Result<u8, SmlError> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or_else(|| SmlError::ParseError("Unexpected end of data".to_string()))?;
        self.pos += 1;
        Ok(byte)
    }

    fn peek_type(&self) -> Result<u8, SmlError> {
        self.data
            .get(self.pos)
            .map(|tl| tl & SML_TYPE_FIELD)
            .ok_or_else(|| SmlError::ParseError("Unexpected end of data".to_string()))
    }

    fn optional_skipped(&mut self) -> bool {
        if self.data.get(self.pos) == Some(&SML_OPTIONAL_SKIPPED) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn read_bytes(&mut self, length: usize) -> Result<&'a [u8], SmlError> {
        if length > self.data.len() - self.pos {
            return Err(SmlError::ParseError(format!(
                "{} bytes requested at position {}, only {} left",
                length,
                self.pos,
                self.data.len() - self.pos
            )));
        }

        let bytes = &self.data[self.pos..self.pos + length];
        self.pos += length;
        Ok(bytes)
    }

    /// Returns the type and the length of the following element. For lists the length is
    /// the number of elements, for everything else the number of data bytes.
    fn parse_type_length(&mut self) -> Result<(u8, usize), SmlError> {
        let first_byte = self.next_byte()?;
        let type_field = first_byte & SML_TYPE_FIELD;
        let mut length = (first_byte & SML_LENGTH_FIELD) as usize;
        let mut tl_bytes = 1;

        let mut current = first_byte;
        while current & SML_ANOTHER_TL != 0 {
            if tl_bytes == MAX_TL_BYTES {
                return Err(SmlError::ParseError("Type-length field too long".to_string()));
            }
            current = self.next_byte()?;
            length = (length << 4) | (current & SML_LENGTH_FIELD) as usize;
            tl_bytes += 1;
        }

        if type_field == SML_TYPE_LIST {
            return Ok((type_field, length));
        }

        // The length of all other types includes the type-length field itself
        let length = length.checked_sub(tl_bytes).ok_or_else(|| {
            SmlError::ParseError(format!("Invalid length at position {}", self.pos))
        })?;

        Ok((type_field, length))
    }

    fn expect_type(&mut self, expected: u8, what: &str) -> Result<usize, SmlError> {
        let (type_field, length) = self.parse_type_length()?;
        if type_field != expected {
            return Err(SmlError::ParseError(format!(
                "{}: expected type 0x{:02x}, found 0x{:02x}",
                what, expected, type_field
            )));
        }
        Ok(length)
    }

    fn parse_list_length(&mut self, what: &str) -> Result<usize, SmlError> {
        self.expect_type(SML_TYPE_LIST, what)
    }

    fn expect_list(&mut self, elements: usize, what: &str) -> Result<(), SmlError> {
        let length = self.parse_list_length(what)?;
        if length != elements {
            return Err(SmlError::ParseError(format!(
                "{}: expected {} elements, found {}",
                what, elements, length
            )));
        }
        Ok(())
    }

    fn parse_end_of_message(&mut self) -> Result<(), SmlError> {
        match self.next_byte()? {
            SML_END_OF_MESSAGE => Ok(()),
            other => Err(SmlError::ParseError(format!("Expected end of message, found 0x{:02x}", other))),
        }
    }

    fn parse_octet_string(&mut self) -> Result<Vec<u8>, SmlError> {
        let length = self.expect_type(SML_TYPE_OCTET_STRING, "octet string")?;
        Ok(self.read_bytes(length)?.to_vec())
    }

    fn parse_optional_octet_string(&mut self) -> Result<Option<Vec<u8>>, SmlError> {
        if self.optional_skipped() {
            return Ok(None);
        }
        Ok(Some(self.parse_octet_string()?))
    }

    fn parse_bool(&mut self) -> Result<bool, SmlError> {
        let length = self.expect_type(SML_TYPE_BOOLEAN, "boolean")?;
        if length != 1 {
            return Err(SmlError::ParseError("Invalid boolean length".to_string()));
        }
        Ok(self.next_byte()? != 0)
    }

    /// Big endian number of 1 to 8 bytes
    fn read_number(&mut self, length: usize) -> Result<u64, SmlError> {
        if length == 0 || length > 8 {
            return Err(SmlError::ParseError(format!("Invalid number length {}", length)));
        }

        let bytes = self.read_bytes(length)?;
        Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64))
    }

    fn parse_unsigned(&mut self) -> Result<u64, SmlError> {
        let length = self.expect_type(SML_TYPE_UNSIGNED, "unsigned")?;
        self.read_number(length)
    }

    fn parse_integer(&mut self) -> Result<i64, SmlError> {
        let length = self.expect_type(SML_TYPE_INTEGER, "integer")?;
        let raw = self.read_number(length)?;

        // sign extend from the transmitted width
        let shift = 64 - 8 * length as u32;
        Ok(((raw << shift) as i64) >> shift)
    }

    fn parse_unsigned8(&mut self) -> Result<u8, SmlError> {
        let value = self.parse_unsigned()?;
        u8::try_from(value).map_err(|_| SmlError::ParseError(format!("{} exceeds unsigned8", value)))
    }

    fn parse_unsigned16(&mut self) -> Result<u16, SmlError> {
        let value = self.parse_unsigned()?;
        u16::try_from(value).map_err(|_| SmlError::ParseError(format!("{} exceeds unsigned16", value)))
    }

    fn parse_unsigned32(&mut self) -> Result<u32, SmlError> {
        let value = self.parse_unsigned()?;
        u32::try_from(value).map_err(|_| SmlError::ParseError(format!("{} exceeds unsigned32", value)))
    }

    fn parse_integer8(&mut self) -> Result<i8, SmlError> {
        let value = self.parse_integer()?;
        i8::try_from(value).map_err(|_| SmlError::ParseError(format!("{} exceeds integer8", value)))
    }

    fn parse_integer16(&mut self) -> Result<i16, SmlError> {
        let value = self.parse_integer()?;
        i16::try_from(value).map_err(|_| SmlError::ParseError(format!("{} exceeds integer16", value)))
    }

    fn parse_optional_unsigned(&mut self) -> Result<Option<u64>, SmlError> {
        if self.optional_skipped() {
            return Ok(None);
        }
        Ok(Some(self.parse_unsigned()?))
    }

    fn parse_optional_unsigned8(&mut self) -> Result<Option<u8>, SmlError> {
        if self.optional_skipped() {
            return Ok(None);
        }
        Ok(Some(self.parse_unsigned8()?))
    }

    fn parse_optional_integer8(&mut self) -> Result<Option<i8>, SmlError> {
        if self.optional_skipped() {
            return Ok(None);
        }
        Ok(Some(self.parse_integer8()?))
    }

    fn skip_element(&mut self, depth: usize) -> Result<(), SmlError> {
        if depth > MAX_NESTING {
            return Err(SmlError::ParseError("Elements nested too deep".to_string()));
        }

        let (type_field, length) = self.parse_type_length()?;
        if type_field == SML_TYPE_LIST {
            for _ in 0..length {
                self.skip_element(depth + 1)?;
            }
        } else {
            self.read_bytes(length)?;
        }
        Ok(())
    }
}
