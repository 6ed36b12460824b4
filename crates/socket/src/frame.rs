// Inspector Socket - debug protocol transport
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! WebSocket frame codec (hybi-17 layout, server subset)
//!
//! Only what the inspector protocol needs is supported: single, final TEXT
//! frames and CLOSE frames. Fragmentation, binary payloads, ping/pong and
//! per-message compression are all rejected as protocol violations.

const FINAL_BIT: u8 = 0x80;
const RESERVED1_BIT: u8 = 0x40;
const RESERVED2_BIT: u8 = 0x20;
const RESERVED3_BIT: u8 = 0x10;
const OP_CODE_MASK: u8 = 0x0F;
const MASK_BIT: u8 = 0x80;
const PAYLOAD_LENGTH_MASK: u8 = 0x7F;

const MAX_SINGLE_BYTE_PAYLOAD_LENGTH: usize = 125;
const TWO_BYTE_PAYLOAD_LENGTH_FIELD: u8 = 126;
const EIGHT_BYTE_PAYLOAD_LENGTH_FIELD: u8 = 127;
const MASKING_KEY_WIDTH_IN_BYTES: usize = 4;

/// The close frame this implementation sends: FIN + CLOSE, empty payload.
pub const CLOSE_FRAME: [u8; 2] = [FINAL_BIT | OpCode::Close as u8, 0x00];

/// WebSocket opcodes as they appear in the low nibble of the first byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation of a fragmented message
    Continuation = 0x0,
    /// UTF-8 text payload
    Text = 0x1,
    /// Binary payload
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Ping control frame
    Ping = 0x9,
    /// Pong control frame
    Pong = 0xA,
}

impl OpCode {
    /// Map a raw opcode nibble, `None` for reserved values
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }
}

/// Result of trying to decode one frame from the front of a buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameDecode {
    /// A complete TEXT frame
    Ok {
        /// Unmasked payload
        payload: Vec<u8>,
        /// Number of bytes the frame occupied in the buffer
        consumed: usize,
    },
    /// A complete CLOSE frame
    Close {
        /// Number of bytes the frame occupied in the buffer
        consumed: usize,
    },
    /// More bytes are needed; nothing may be consumed yet
    Incomplete,
    /// The frame violates the supported subset of the protocol
    Error,
}

/// Decoded frame outcome together with the out-of-band compression flag
///
/// `compressed` mirrors RSV1. Compression is never negotiated, so a set flag
/// always comes with [`FrameDecode::Error`] and callers treat it as fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    /// What the buffer contained
    pub result: FrameDecode,
    /// Whether RSV1 (per-message compression) was set on the frame
    pub compressed: bool,
}

impl Decoded {
    fn new(result: FrameDecode) -> Self {
        Self { result, compressed: false }
    }
}

/// Encode `payload` as a single final, unmasked TEXT frame.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let len = payload.len();
    let mut frame = Vec::with_capacity(encoded_len(len));
    frame.push(FINAL_BIT | OpCode::Text as u8);

    if len <= MAX_SINGLE_BYTE_PAYLOAD_LENGTH {
        frame.push(len as u8);
    } else if len <= u16::MAX as usize {
        frame.push(TWO_BYTE_PAYLOAD_LENGTH_FIELD);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        frame.push(EIGHT_BYTE_PAYLOAD_LENGTH_FIELD);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }

    frame.extend_from_slice(payload);
    frame
}

/// Total size of the frame [`encode_frame`] produces for a payload of `len` bytes.
pub fn encoded_len(len: usize) -> usize {
    let header = if len <= MAX_SINGLE_BYTE_PAYLOAD_LENGTH {
        2
    } else if len <= u16::MAX as usize {
        4
    } else {
        10
    };
    header + len
}

/// Decode one frame from the front of `buffer`.
///
/// `client_frame` requires the MASK bit, as every client-to-server frame must
/// be masked. The masking key is only read when MASK is set, so unmasked
/// frames produced by [`encode_frame`] decode back to their payload.
pub fn decode_frame(buffer: &[u8], client_frame: bool) -> Decoded {
    if buffer.len() < 2 {
        return Decoded::new(FrameDecode::Incomplete);
    }

    let first_byte = buffer[0];
    let second_byte = buffer[1];

    let fin = first_byte & FINAL_BIT != 0;
    let reserved1 = first_byte & RESERVED1_BIT != 0;
    let reserved2 = first_byte & RESERVED2_BIT != 0;
    let reserved3 = first_byte & RESERVED3_BIT != 0;
    let op_code = first_byte & OP_CODE_MASK;
    let masked = second_byte & MASK_BIT != 0;

    if reserved1 {
        return Decoded { result: FrameDecode::Error, compressed: true };
    }
    if reserved2 || reserved3 || !fin {
        return Decoded::new(FrameDecode::Error);
    }

    let closed = match OpCode::from_u8(op_code) {
        Some(OpCode::Text) => false,
        Some(OpCode::Close) => true,
        _ => return Decoded::new(FrameDecode::Error),
    };

    if client_frame && !masked {
        return Decoded::new(FrameDecode::Error);
    }

    let mut pos = 2;
    let mut payload_len = u64::from(second_byte & PAYLOAD_LENGTH_MASK);
    if payload_len > MAX_SINGLE_BYTE_PAYLOAD_LENGTH as u64 {
        let extended_len_size =
            if payload_len == u64::from(TWO_BYTE_PAYLOAD_LENGTH_FIELD) { 2 } else { 8 };
        let Some(extended) = buffer.get(pos..pos + extended_len_size) else {
            return Decoded::new(FrameDecode::Incomplete);
        };
        payload_len = extended.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
        pos += extended_len_size;
    }

    if payload_len > i64::MAX as u64
        || payload_len > (usize::MAX - MASKING_KEY_WIDTH_IN_BYTES) as u64
    {
        return Decoded::new(FrameDecode::Error);
    }
    let payload_len = payload_len as usize;

    let key_len = if masked { MASKING_KEY_WIDTH_IN_BYTES } else { 0 };
    let remaining = buffer.len() - pos;
    if remaining < key_len || remaining - key_len < payload_len {
        return Decoded::new(FrameDecode::Incomplete);
    }

    let payload_start = pos + key_len;
    let raw = &buffer[payload_start..payload_start + payload_len];
    let payload = if masked {
        let key = &buffer[pos..payload_start];
        raw.iter().enumerate().map(|(i, b)| b ^ key[i % MASKING_KEY_WIDTH_IN_BYTES]).collect()
    } else {
        raw.to_vec()
    };

    let consumed = payload_start + payload_len;
    let result = if closed {
        FrameDecode::Close { consumed }
    } else {
        FrameDecode::Ok { payload, consumed }
    };
    Decoded::new(result)
}
