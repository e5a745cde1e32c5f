use std::io::{self, ErrorKind, Read};

use crc16::{State, X_25};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

const ESCAPE: [u8; 4] = [0x1B, 0x1B, 0x1B, 0x1B];
const START: [u8; 8] = [0x1B, 0x1B, 0x1B, 0x1B, 0x01, 0x01, 0x01, 0x01];
const VERSION_1: [u8; 4] = [0x01, 0x01, 0x01, 0x01];
const END_MARKER: u8 = 0x1A;

const READ_BUFFER_SIZE: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TransportOptions {
    /// Drop frames whose X.25 checksum does not match
    #[serde(default = "verify_checksum_default")]
    pub verify_checksum: bool,
    /// Frames growing beyond this many bytes are dropped
    #[serde(default = "max_frame_len_default")]
    pub max_frame_len: usize,
}

fn verify_checksum_default() -> bool {
    return true;
}

fn max_frame_len_default() -> usize {
    return 16 * 1024;
}

impl Default for TransportOptions {
    fn default() -> Self {
        TransportOptions {
            verify_checksum: verify_checksum_default(),
            max_frame_len: max_frame_len_default(),
        }
    }
}

enum FramerState {
    /// Waiting for the start sequence
    Hunting,
    /// Collecting 4 byte blocks of a frame
    InFrame,
}

/// Splits the byte stream of the line into complete SML transport frames.
///
/// Delivered frames carry the start sequence, the un-escaped SML file with its padding and
/// the end sequence including padding count and checksum, so the file sits between the
/// first and the last 8 bytes.
pub struct SmlFramer {
    options: TransportOptions,
    state: FramerState,
    window: [u8; 8],
    window_len: usize,
    frame: Vec<u8>,
    block: [u8; 4],
    block_len: usize,
    escaped: bool,
    crc: State<X_25>,
}

impl SmlFramer {
    pub fn new(options: TransportOptions) -> Self {
        SmlFramer {
            options,
            state: FramerState::Hunting,
            window: [0; 8],
            window_len: 0,
            frame: Vec::new(),
            block: [0; 4],
            block_len: 0,
            escaped: false,
            crc: State::<X_25>::new(),
        }
    }

    pub fn feed(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();

        for &byte in data {
            match self.state {
                FramerState::Hunting => self.hunt(byte),
                FramerState::InFrame => {
                    self.block[self.block_len] = byte;
                    self.block_len += 1;
                    if self.block_len == 4 {
                        self.block_len = 0;
                        if let Some(frame) = self.handle_block() {
                            frames.push(frame);
                        }
                    }
                }
            }
        }

        frames
    }

    fn hunt(&mut self, byte: u8) {
        self.window.rotate_left(1);
        self.window[7] = byte;
        self.window_len = (self.window_len + 1).min(8);

        if self.window_len == 8 && self.window == START {
            self.start_frame();
        }
    }

    fn start_frame(&mut self) {
        self.state = FramerState::InFrame;
        self.frame.clear();
        self.frame.extend_from_slice(&START);
        self.block_len = 0;
        self.escaped = false;
        self.crc = State::<X_25>::new();
        self.crc.update(&START);
    }

    fn reset(&mut self) {
        self.state = FramerState::Hunting;
        self.window_len = 0;
        self.frame.clear();
        self.block_len = 0;
        self.escaped = false;
    }

    fn handle_block(&mut self) -> Option<Vec<u8>> {
        let block = self.block;

        if !self.escaped {
            self.crc.update(&block);
            if block == ESCAPE {
                self.escaped = true;
            } else {
                self.frame.extend_from_slice(&block);
            }
            return self.check_size();
        }

        self.escaped = false;
        if block == ESCAPE {
            self.crc.update(&block);
            self.frame.extend_from_slice(&ESCAPE);
            return self.check_size();
        }
        if block == VERSION_1 {
            debug!("Start sequence inside a frame, restarting");
            self.start_frame();
            return None;
        }
        if block[0] == END_MARKER {
            return self.finish_frame(block);
        }

        warn!("Invalid escape sequence {}, dropping frame", hex::encode(block));
        self.reset();
        None
    }

    fn check_size(&mut self) -> Option<Vec<u8>> {
        if self.frame.len() > self.options.max_frame_len {
            warn!("Frame exceeds {} bytes, dropping it", self.options.max_frame_len);
            self.reset();
        }
        None
    }

    fn finish_frame(&mut self, block: [u8; 4]) -> Option<Vec<u8>> {
        let padding = block[1];
        self.crc.update(&block[..2]);
        let calculated = self.crc.get();
        let received = u16::from_le_bytes([block[2], block[3]]);

        let mut frame = std::mem::take(&mut self.frame);
        self.reset();

        if padding > 3 {
            warn!("Invalid padding count {}, dropping frame", padding);
            return None;
        }
        if self.options.verify_checksum && calculated != received {
            warn!(
                "Checksum mismatch, received 0x{:04x} calculated 0x{:04x}, dropping frame",
                received, calculated
            );
            return None;
        }

        frame.extend_from_slice(&ESCAPE);
        frame.extend_from_slice(&block);
        debug!("Received SML frame with {} bytes", frame.len());
        Some(frame)
    }
}

/// Reads the line until it ends and hands every complete frame to `on_frame`.
///
/// Read time-outs only mean the meter is silent, reading continues. End of stream returns
/// `Ok(())`, any other read error is returned.
pub fn listen<R, F>(reader: &mut R, options: &TransportOptions, mut on_frame: F) -> io::Result<()>
where
    R: Read + ?Sized,
    F: FnMut(&[u8]),
{
    let mut framer = SmlFramer::new(options.clone());
    let mut buffer = [0u8; READ_BUFFER_SIZE];

    loop {
        match reader.read(&mut buffer) {
            Ok(0) => {
                debug!("End of stream reached");
                return Ok(());
            }
            Ok(n) => {
                for frame in framer.feed(&buffer[..n]) {
                    on_frame(&frame);
                }
            }
            Err(ref e) if e.kind() == ErrorKind::TimedOut => {
                debug!("No data within the read timeout, still waiting");
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}
