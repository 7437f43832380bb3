use super::frame::{encode_frame, OpCode};
use crate::error::ProtocolError;
use bytes::{Bytes, BytesMut};

/// Close status codes this crate sends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    Normal,
    GoingAway,
    Protocol,
    Unsupported,
    InvalidPayload,
    PolicyViolation,
    MessageTooBig,
    InternalError,
}

impl CloseCode {
    pub fn as_u16(self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::InvalidPayload => 1007,
            CloseCode::PolicyViolation => 1008,
            CloseCode::MessageTooBig => 1009,
            CloseCode::InternalError => 1011,
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        code.as_u16()
    }
}

/// Codes a peer may put on the wire. 1004-1006 and 1015 are reserved for
/// local use, everything under 1000 is unassigned.
pub fn is_valid_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl MessageType {
    pub fn opcode(self) -> OpCode {
        match self {
            MessageType::Text => OpCode::Text,
            MessageType::Binary => OpCode::Binary,
            MessageType::Close => OpCode::Close,
            MessageType::Ping => OpCode::Ping,
            MessageType::Pong => OpCode::Pong,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, MessageType::Close | MessageType::Ping | MessageType::Pong)
    }
}

/// A complete WebSocket message with an owned payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: MessageType,
    payload: Bytes,
}

impl Message {
    pub fn new(kind: MessageType, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(MessageType::Text, Bytes::from(text.into()))
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(MessageType::Binary, data)
    }

    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::new(MessageType::Ping, data)
    }

    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::new(MessageType::Pong, data)
    }

    /// Close message carrying an optional status code and reason.
    ///
    /// The reason is cut on a char boundary so the payload stays within the
    /// 125 byte control frame limit.
    pub fn close(code: Option<u16>, reason: &str) -> Self {
        let Some(code) = code else {
            return Self::new(MessageType::Close, Bytes::new());
        };
        let mut end = reason.len().min(123);
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        let mut payload = BytesMut::with_capacity(2 + end);
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(&reason.as_bytes()[..end]);
        Self::new(MessageType::Close, payload.freeze())
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Payload as text for text messages; text payloads are validated on decode
    pub fn as_text(&self) -> Option<&str> {
        match self.kind {
            MessageType::Text => std::str::from_utf8(&self.payload).ok(),
            _ => None,
        }
    }

    pub fn close_code(&self) -> Option<u16> {
        if self.kind != MessageType::Close || self.payload.len() < 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }

    pub fn close_reason(&self) -> Option<&str> {
        if self.kind != MessageType::Close || self.payload.len() < 2 {
            return None;
        }
        std::str::from_utf8(&self.payload[2..]).ok()
    }

    /// Append this message as a single final frame
    pub fn encode(&self, dst: &mut BytesMut, mask: Option<[u8; 4]>) {
        encode_frame(dst, true, self.kind.opcode(), &self.payload, mask);
    }
}

/// Check a received close body: empty, or a valid code followed by UTF-8
pub(crate) fn validate_close_payload(payload: &[u8]) -> Result<(), ProtocolError> {
    match payload.len() {
        0 => Ok(()),
        1 => Err(ProtocolError::InvalidClosePayload),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !is_valid_close_code(code) {
                return Err(ProtocolError::InvalidClosePayload);
            }
            std::str::from_utf8(&payload[2..]).map_err(|_| ProtocolError::InvalidUtf8)?;
            Ok(())
        }
    }
}
