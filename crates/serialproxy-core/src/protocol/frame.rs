//! Binary frame encoding/decoding
//!
//! Frame format used by ZIF test sockets and similar binary devices:
//! - 1 byte: start marker `0xA5`
//! - 1 byte: payload length
//! - N bytes: payload (opcode/address bytes followed by data)
//! - 1 byte: checksum over length and payload
//! - 1 byte: end marker `0x5A`

use byteorder::{BigEndian, ByteOrder};

use super::raw::ByteAccumulator;
use super::FramingError;

/// First byte of every frame
pub const FRAME_START: u8 = 0xA5;

/// Last byte of every frame
pub const FRAME_END: u8 = 0x5A;

/// Largest payload the length byte can describe
pub const MAX_FRAME_PAYLOAD: usize = u8::MAX as usize;

/// Checksum over the length byte and payload
pub trait FrameChecksum: Send {
    /// Checksum byte for `data`
    fn checksum(&self, data: &[u8]) -> u8;
}

/// XOR of all bytes
#[derive(Debug, Clone, Copy, Default)]
pub struct XorChecksum;

impl FrameChecksum for XorChecksum {
    fn checksum(&self, data: &[u8]) -> u8 {
        data.iter().fold(0, |acc, b| acc ^ b)
    }
}

/// Wrapping sum of all bytes
#[derive(Debug, Clone, Copy, Default)]
pub struct SumChecksum;

impl FrameChecksum for SumChecksum {
    fn checksum(&self, data: &[u8]) -> u8 {
        data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
    }
}

fn frame_checksum(checksum: &impl FrameChecksum, payload: &[u8]) -> u8 {
    let mut data = Vec::with_capacity(payload.len() + 1);
    data.push(payload.len() as u8);
    data.extend_from_slice(payload);
    checksum.checksum(&data)
}

/// A binary frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Opcode/address bytes and data
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame around `payload`
    pub fn new(payload: Vec<u8>) -> Result<Self, FramingError> {
        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(FramingError::PayloadTooLarge(payload.len()));
        }
        Ok(Self { payload })
    }

    /// Encode with the default XOR checksum
    pub fn encode(&self) -> Vec<u8> {
        self.encode_with(&XorChecksum)
    }

    /// Encode with a caller-chosen checksum
    pub fn encode_with(&self, checksum: &impl FrameChecksum) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.encoded_size());
        bytes.push(FRAME_START);
        bytes.push(self.payload.len() as u8);
        bytes.extend_from_slice(&self.payload);
        bytes.push(frame_checksum(checksum, &self.payload));
        bytes.push(FRAME_END);
        bytes
    }

    /// Decode one complete frame using the default XOR checksum
    pub fn decode(data: &[u8]) -> Result<Self, FramingError> {
        Self::decode_with(data, XorChecksum)
    }

    /// Decode one complete frame; trailing bytes are an error
    pub fn decode_with<C: FrameChecksum>(data: &[u8], checksum: C) -> Result<Self, FramingError> {
        let mut decoder = FrameDecoder::with_checksum(checksum);
        for (i, byte) in data.iter().enumerate() {
            if let Some(payload) = decoder.push(*byte)? {
                if i + 1 != data.len() {
                    return Err(FramingError::LengthMismatch {
                        declared: payload.len(),
                        actual: data.len() - 4,
                    });
                }
                return Ok(Self { payload });
            }
        }
        Err(FramingError::PrematureEnd {
            received: data.len(),
        })
    }

    /// Get the total encoded size
    pub fn encoded_size(&self) -> usize {
        self.payload.len() + 4
    }
}

/// Builder for constructing frames
#[derive(Debug, Default)]
pub struct FrameBuilder {
    payload: Vec<u8>,
}

impl FrameBuilder {
    /// Start with an empty payload
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an opcode or address byte
    pub fn opcode(mut self, op: u8) -> Self {
        self.payload.push(op);
        self
    }

    /// Add a single byte
    pub fn byte(mut self, b: u8) -> Self {
        self.payload.push(b);
        self
    }

    /// Add a 16-bit value (big-endian)
    pub fn u16_be(mut self, value: u16) -> Self {
        let mut bytes = [0u8; 2];
        BigEndian::write_u16(&mut bytes, value);
        self.payload.extend_from_slice(&bytes);
        self
    }

    /// Add raw bytes
    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.payload.extend_from_slice(data);
        self
    }

    /// Finish the frame; fails if the payload is too long
    pub fn build(self) -> Result<Frame, FramingError> {
        Frame::new(self.payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Start,
    Length,
    Payload,
    Checksum,
    End,
}

/// Validates an inbound frame one byte at a time
#[derive(Debug)]
pub struct FrameDecoder<C = XorChecksum> {
    checksum: C,
    state: DecodeState,
    length: usize,
    payload: Vec<u8>,
    received: usize,
}

impl FrameDecoder<XorChecksum> {
    /// Decoder using the XOR checksum
    pub fn new() -> Self {
        Self::with_checksum(XorChecksum)
    }
}

impl Default for FrameDecoder<XorChecksum> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: FrameChecksum> FrameDecoder<C> {
    /// Decoder validating with `checksum`
    pub fn with_checksum(checksum: C) -> Self {
        Self {
            checksum,
            state: DecodeState::Start,
            length: 0,
            payload: Vec::new(),
            received: 0,
        }
    }

    /// Bytes consumed by the frame in progress
    pub fn received(&self) -> usize {
        self.received
    }

    fn reset(&mut self) {
        self.state = DecodeState::Start;
        self.length = 0;
        self.payload.clear();
        self.received = 0;
    }
}

impl<C: FrameChecksum> ByteAccumulator for FrameDecoder<C> {
    fn push(&mut self, byte: u8) -> Result<Option<Vec<u8>>, FramingError> {
        self.received += 1;
        match self.state {
            DecodeState::Start => {
                if byte != FRAME_START {
                    self.reset();
                    return Err(FramingError::UnexpectedStart(byte));
                }
                self.state = DecodeState::Length;
            }
            DecodeState::Length => {
                self.length = byte as usize;
                self.state = if self.length == 0 {
                    DecodeState::Checksum
                } else {
                    DecodeState::Payload
                };
            }
            DecodeState::Payload => {
                self.payload.push(byte);
                if self.payload.len() == self.length {
                    self.state = DecodeState::Checksum;
                }
            }
            DecodeState::Checksum => {
                let expected = frame_checksum(&self.checksum, &self.payload);
                if byte != expected {
                    self.reset();
                    return Err(FramingError::ChecksumMismatch {
                        expected,
                        actual: byte,
                    });
                }
                self.state = DecodeState::End;
            }
            DecodeState::End => {
                if byte != FRAME_END {
                    self.reset();
                    return Err(FramingError::UnexpectedEnd(byte));
                }
                let payload = std::mem::take(&mut self.payload);
                self.reset();
                return Ok(Some(payload));
            }
        }
        Ok(None)
    }
}
