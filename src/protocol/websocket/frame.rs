//! RFC 6455 frame header codec.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               | Masking-key, if MASK set to 1 |
//! +-------------------------------+-------------------------------+
//! ```
//!
//! Bits are packed with explicit shifts and masks on plain bytes, so the wire
//! order never depends on the host.

use crate::error::ProtocolError;
use bytes::{BufMut, BytesMut};

pub const FIN_BIT: u8 = 0x80;
pub const RSV_BITS: u8 = 0x70;
pub const OPCODE_BITS: u8 = 0x0F;
pub const MASK_BIT: u8 = 0x80;
pub const LEN_BITS: u8 = 0x7F;

/// 7-bit length value announcing a 16-bit extended length
pub const LEN_16_MARKER: u8 = 126;
/// 7-bit length value announcing a 64-bit extended length
pub const LEN_64_MARKER: u8 = 127;

pub const MAX_INLINE_LEN: u64 = 125;
pub const MAX_CONTROL_PAYLOAD: u64 = 125;
/// The most significant bit of the 64-bit length must be zero
pub const MAX_PAYLOAD_LEN: u64 = i64::MAX as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(ProtocolError::InvalidOpcode(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        self.as_u8() & 0x8 != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    /// RSV1..RSV3 in the low three bits
    pub rsv: u8,
    pub opcode: OpCode,
    pub mask: Option<[u8; 4]>,
    pub payload_len: u64,
}

impl FrameHeader {
    pub fn new(fin: bool, opcode: OpCode, mask: Option<[u8; 4]>, payload_len: u64) -> Self {
        Self {
            fin,
            rsv: 0,
            opcode,
            mask,
            payload_len,
        }
    }

    /// Number of bytes `encode` will write
    pub fn encoded_len(&self) -> usize {
        let len_field = if self.payload_len > u64::from(u16::MAX) {
            8
        } else if self.payload_len > MAX_INLINE_LEN {
            2
        } else {
            0
        };
        2 + len_field + if self.mask.is_some() { 4 } else { 0 }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());

        let mut first = self.opcode.as_u8() & OPCODE_BITS;
        if self.fin {
            first |= FIN_BIT;
        }
        first |= (self.rsv << 4) & RSV_BITS;
        dst.put_u8(first);

        let mask_bit = if self.mask.is_some() { MASK_BIT } else { 0 };
        if self.payload_len > u64::from(u16::MAX) {
            dst.put_u8(mask_bit | LEN_64_MARKER);
            dst.put_u64(self.payload_len);
        } else if self.payload_len > MAX_INLINE_LEN {
            dst.put_u8(mask_bit | LEN_16_MARKER);
            dst.put_u16(self.payload_len as u16);
        } else {
            dst.put_u8(mask_bit | self.payload_len as u8);
        }

        if let Some(mask) = self.mask {
            dst.put_slice(&mask);
        }
    }

    /// Parse a header from the front of `src`.
    ///
    /// Returns the header and its encoded size, or `None` when more bytes are
    /// needed. Role-dependent checks (masking) are left to the caller.
    pub fn parse(src: &[u8], strict_length: bool) -> Result<Option<(FrameHeader, usize)>, ProtocolError> {
        if src.len() < 2 {
            return Ok(None);
        }
        let first = src[0];
        let second = src[1];

        if first & RSV_BITS != 0 {
            return Err(ProtocolError::ReservedBitsNonzero);
        }
        let opcode = OpCode::from_u8(first & OPCODE_BITS)?;
        let fin = first & FIN_BIT != 0;
        if opcode.is_control() && !fin {
            return Err(ProtocolError::ControlFrameFragmented);
        }

        let masked = second & MASK_BIT != 0;
        let len7 = second & LEN_BITS;
        let mut offset = 2;

        let payload_len = match len7 {
            LEN_16_MARKER => {
                if src.len() < offset + 2 {
                    return Ok(None);
                }
                let len = u64::from(u16::from_be_bytes([src[2], src[3]]));
                offset += 2;
                if strict_length && len <= MAX_INLINE_LEN {
                    return Err(ProtocolError::NonCanonicalLength);
                }
                len
            }
            LEN_64_MARKER => {
                if src.len() < offset + 8 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&src[2..10]);
                let len = u64::from_be_bytes(raw);
                offset += 8;
                if len > MAX_PAYLOAD_LEN {
                    return Err(ProtocolError::InvalidPayloadLength);
                }
                if strict_length && len <= u64::from(u16::MAX) {
                    return Err(ProtocolError::NonCanonicalLength);
                }
                len
            }
            inline => u64::from(inline),
        };

        if opcode.is_control() && payload_len > MAX_CONTROL_PAYLOAD {
            return Err(ProtocolError::ControlFrameTooLarge);
        }

        let mask = if masked {
            if src.len() < offset + 4 {
                return Ok(None);
            }
            let key = [src[offset], src[offset + 1], src[offset + 2], src[offset + 3]];
            offset += 4;
            Some(key)
        } else {
            None
        };

        Ok(Some((
            FrameHeader {
                fin,
                rsv: 0,
                opcode,
                mask,
                payload_len,
            },
            offset,
        )))
    }
}

/// XOR `buf` with `mask`, cycling the key from index 0. Applying it twice
/// restores the input.
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    apply_mask_offset(buf, mask, 0);
}

/// Same as [`apply_mask`] for a slice that starts `offset` bytes into the payload
pub fn apply_mask_offset(buf: &mut [u8], mask: [u8; 4], offset: usize) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[(offset + i) & 3];
    }
}

/// Append a complete frame (header and optionally masked payload) to `dst`
pub fn encode_frame(dst: &mut BytesMut, fin: bool, opcode: OpCode, payload: &[u8], mask: Option<[u8; 4]>) {
    let header = FrameHeader::new(fin, opcode, mask, payload.len() as u64);
    header.encode(dst);

    let start = dst.len();
    dst.extend_from_slice(payload);
    if let Some(mask) = mask {
        apply_mask(&mut dst[start..], mask);
    }
}
