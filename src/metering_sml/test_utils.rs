// Encoder for building SML files and transport frames in tests

use crc16::{State, X_25};

pub const SERVER_ID: [u8; 10] = [0x0A, 0x01, 0x45, 0x4D, 0x48, 0x00, 0x00, 0x7A, 0xC7, 0x42];

fn type_length(type_field: u8, length: usize) -> Vec<u8> {
    if type_field == 0x70 {
        if length < 0x10 {
            return vec![0x70 | length as u8];
        }
        return vec![0xF0 | (length >> 4) as u8, (length & 0x0F) as u8];
    }

    let total = length + 1;
    if total < 0x10 {
        return vec![type_field | total as u8];
    }
    let total = length + 2;
    vec![0x80 | type_field | (total >> 4) as u8, (total & 0x0F) as u8]
}

pub fn octet(bytes: &[u8]) -> Vec<u8> {
    let mut out = type_length(0x00, bytes.len());
    out.extend_from_slice(bytes);
    out
}

pub fn boolean(value: bool) -> Vec<u8> {
    vec![0x42, value as u8]
}

pub fn unsigned(value: u64, size: usize) -> Vec<u8> {
    let mut out = type_length(0x60, size);
    out.extend_from_slice(&value.to_be_bytes()[8 - size..]);
    out
}

pub fn integer(value: i64, size: usize) -> Vec<u8> {
    let mut out = type_length(0x50, size);
    out.extend_from_slice(&value.to_be_bytes()[8 - size..]);
    out
}

pub fn skipped() -> Vec<u8> {
    vec![0x01]
}

pub fn list(items: &[Vec<u8>]) -> Vec<u8> {
    let mut out = type_length(0x70, items.len());
    for item in items {
        out.extend_from_slice(item);
    }
    out
}

pub fn list_entry(obj_name: &[u8], unit: Option<u8>, scaler: Option<i8>, value: Option<Vec<u8>>) -> Vec<u8> {
    list(&[
        octet(obj_name),
        skipped(),
        skipped(),
        unit.map(|u| unsigned(u as u64, 1)).unwrap_or_else(skipped),
        scaler.map(|s| integer(s as i64, 1)).unwrap_or_else(skipped),
        value.unwrap_or_else(skipped),
        skipped(),
    ])
}

pub fn open_response(server_id: &[u8]) -> Vec<u8> {
    list(&[skipped(), skipped(), octet(b"file"), octet(server_id), skipped(), skipped()])
}

pub fn close_response() -> Vec<u8> {
    list(&[skipped()])
}

pub fn get_list_response(server_id: &[u8], entries: Vec<Vec<u8>>) -> Vec<u8> {
    list(&[
        skipped(),
        octet(server_id),
        skipped(),
        list(&[unsigned(1, 1), unsigned(4711, 4)]),
        list(&entries),
        skipped(),
        skipped(),
    ])
}

pub fn message(transaction_id: &[u8], tag: u32, body: Vec<u8>) -> Vec<u8> {
    let mut out = list(&[
        octet(transaction_id),
        unsigned(0, 1),
        unsigned(0, 1),
        list(&[unsigned(tag as u64, 2), body]),
        unsigned(0xBEEF, 2),
    ]);
    out.push(0x00);
    out
}

pub fn sml_file(messages: &[Vec<u8>]) -> Vec<u8> {
    messages.concat()
}

/// Wraps an SML file into the transport envelope: start sequence, escaped and padded
/// body, end sequence with the padding count and the X.25 checksum.
pub fn frame(file: &[u8]) -> Vec<u8> {
    let padding = (4 - file.len() % 4) % 4;
    let mut body = file.to_vec();
    body.resize(file.len() + padding, 0x00);

    let mut out = vec![0x1B, 0x1B, 0x1B, 0x1B, 0x01, 0x01, 0x01, 0x01];
    for block in body.chunks(4) {
        if block == [0x1B; 4] {
            out.extend_from_slice(&[0x1B; 4]);
        }
        out.extend_from_slice(block);
    }
    out.extend_from_slice(&[0x1B, 0x1B, 0x1B, 0x1B, 0x1A, padding as u8]);

    let crc = State::<X_25>::calculate(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

/// A three message telegram laid out like the ones EMH eHZ meters send: OBIS names, status
/// words and int64 registers as they appear on the wire. Message and transport checksums
/// are the X.25 values of the bytes, not produced by this encoder.
pub const EHZ_TELEGRAM: [&str; 10] = [
    "1b1b1b1b010101017605032b180f6200620072630101760101050b2d6a090b0a",
    "01454d480000b4e3a5010163716b007605032b1810620062007263070177010b",
    "0a01454d480000b4e3a5070100620affff72620165001c83d57777078181c782",
    "03ff0101010104454d480177070100000009ff010101010b0a01454d480000b4",
    "e3a50177070100010800ff650000018201621e52ff590000000002bbd12a0177",
    "070100020800ff650000018201621e52ff590000000000000000017707010001",
    "0801ff0101621e52ff590000000002bbd12a0177070100010802ff0101621e52",
    "ff5900000000000000000177070100100700ff0101621b520055000001380101",
    "01638b27007605032b18116200620072630201710163fa36000000001b1b1b1b",
    "1a03daaf",
];

pub fn ehz_telegram() -> Vec<u8> {
    hex::decode(EHZ_TELEGRAM.concat()).unwrap()
}
