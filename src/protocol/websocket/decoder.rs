//! Incremental frame decoder and message reassembler.
//!
//! Bytes are consumed from the front of the caller's buffer as soon as a
//! header or a full payload is available; anything incomplete stays in the
//! buffer for the next call.

use super::frame::{apply_mask, FrameHeader, OpCode};
use super::message::{validate_close_payload, Message, MessageType};
use crate::error::ProtocolError;
use bytes::{Buf, Bytes, BytesMut};

/// Which side of the connection the decoder runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Expects masked frames from clients
    Server,
    /// Expects unmasked frames from a server
    Client,
}

#[derive(Debug, Clone, Copy)]
pub struct DecoderConfig {
    pub role: Role,
    pub max_message_size: usize,
    pub strict_length_encoding: bool,
}

impl DecoderConfig {
    pub fn server(max_message_size: usize) -> Self {
        Self {
            role: Role::Server,
            max_message_size,
            strict_length_encoding: false,
        }
    }

    pub fn client(max_message_size: usize) -> Self {
        Self {
            role: Role::Client,
            max_message_size,
            strict_length_encoding: false,
        }
    }
}

/// A single decoded frame with its payload already unmasked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    AwaitingHeader,
    AwaitingPayload,
    FrameComplete,
}

struct Partial {
    kind: MessageType,
    payload: BytesMut,
}

pub struct FrameDecoder {
    config: DecoderConfig,
    state: DecoderState,
    header: Option<FrameHeader>,
    partial: Option<Partial>,
}

impl FrameDecoder {
    pub fn new(config: DecoderConfig) -> Self {
        Self {
            config,
            state: DecoderState::AwaitingHeader,
            header: None,
            partial: None,
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.config.role
    }

    /// True while a fragmented data message is being reassembled
    pub fn in_message(&self) -> bool {
        self.partial.is_some()
    }

    /// Decode the next frame from `src`, or `None` when more bytes are needed
    pub fn next_frame(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if self.state == DecoderState::FrameComplete {
            self.state = DecoderState::AwaitingHeader;
        }

        if self.state == DecoderState::AwaitingHeader {
            let Some((header, used)) = FrameHeader::parse(&src[..], self.config.strict_length_encoding)? else {
                return Ok(None);
            };
            self.check_header(&header)?;
            src.advance(used);
            self.header = Some(header);
            self.state = DecoderState::AwaitingPayload;
        }

        let Some(header) = self.header else {
            self.state = DecoderState::AwaitingHeader;
            return Ok(None);
        };
        // check_header bounded the length by max_message_size
        let len = header.payload_len as usize;
        if src.len() < len {
            return Ok(None);
        }

        let mut payload = src.split_to(len);
        if let Some(mask) = header.mask {
            apply_mask(&mut payload, mask);
        }
        self.header = None;
        self.state = DecoderState::FrameComplete;
        Ok(Some(Frame {
            header,
            payload: payload.freeze(),
        }))
    }

    /// Decode frames until a complete message is available.
    ///
    /// Control frames are returned as soon as they arrive, even in the middle
    /// of a fragmented data message, which keeps reassembling afterwards.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        while let Some(frame) = self.next_frame(src)? {
            if let Some(message) = self.assemble(frame)? {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    fn check_header(&self, header: &FrameHeader) -> Result<(), ProtocolError> {
        match (self.config.role, header.mask.is_some()) {
            (Role::Server, false) => return Err(ProtocolError::UnmaskedClientFrame),
            (Role::Client, true) => return Err(ProtocolError::MaskedServerFrame),
            _ => {}
        }

        match header.opcode {
            OpCode::Continuation if self.partial.is_none() => {
                return Err(ProtocolError::BadContinuationFrame)
            }
            OpCode::Text | OpCode::Binary if self.partial.is_some() => {
                return Err(ProtocolError::MessageNotContinued)
            }
            _ => {}
        }

        if !header.opcode.is_control() {
            let buffered = self.partial.as_ref().map_or(0, |p| p.payload.len()) as u64;
            let limit = self.config.max_message_size;
            if buffered.saturating_add(header.payload_len) > limit as u64 {
                return Err(ProtocolError::MessageTooLarge(limit));
            }
        }
        Ok(())
    }

    fn assemble(&mut self, frame: Frame) -> Result<Option<Message>, ProtocolError> {
        let Frame { header, payload } = frame;
        match header.opcode {
            OpCode::Close => {
                validate_close_payload(&payload)?;
                Ok(Some(Message::new(MessageType::Close, payload)))
            }
            OpCode::Ping => Ok(Some(Message::new(MessageType::Ping, payload))),
            OpCode::Pong => Ok(Some(Message::new(MessageType::Pong, payload))),
            OpCode::Text | OpCode::Binary => {
                let kind = if header.opcode == OpCode::Text {
                    MessageType::Text
                } else {
                    MessageType::Binary
                };
                if header.fin {
                    return finish(kind, payload).map(Some);
                }
                self.partial = Some(Partial {
                    kind,
                    payload: BytesMut::from(&payload[..]),
                });
                Ok(None)
            }
            OpCode::Continuation => {
                let Some(partial) = self.partial.as_mut() else {
                    return Err(ProtocolError::BadContinuationFrame);
                };
                partial.payload.extend_from_slice(&payload);
                if !header.fin {
                    return Ok(None);
                }
                let Some(partial) = self.partial.take() else {
                    return Err(ProtocolError::BadContinuationFrame);
                };
                finish(partial.kind, partial.payload.freeze()).map(Some)
            }
        }
    }
}

fn finish(kind: MessageType, payload: Bytes) -> Result<Message, ProtocolError> {
    if kind == MessageType::Text && std::str::from_utf8(&payload).is_err() {
        return Err(ProtocolError::InvalidUtf8);
    }
    Ok(Message::new(kind, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::websocket::frame::encode_frame;

    const MASK: [u8; 4] = [0x11, 0x22, 0x33, 0x44];

    fn server() -> FrameDecoder {
        FrameDecoder::new(DecoderConfig::server(1024 * 1024))
    }

    fn client_frame(buf: &mut BytesMut, fin: bool, opcode: OpCode, payload: &[u8]) {
        encode_frame(buf, fin, opcode, payload, Some(MASK));
    }

    #[test]
    fn test_round_trip_lengths() {
        for len in [0usize, 1, 125, 126, 65535, 65536] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            for fin in [true, false] {
                let mut buf = BytesMut::new();
                client_frame(&mut buf, fin, OpCode::Binary, &payload);

                let mut decoder = server();
                let frame = decoder.next_frame(&mut buf).unwrap().unwrap();
                assert_eq!(frame.header.opcode, OpCode::Binary);
                assert_eq!(frame.header.fin, fin);
                assert_eq!(&frame.payload[..], &payload[..], "length {len}");
                assert!(buf.is_empty());
            }
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut wire = BytesMut::new();
        client_frame(&mut wire, true, OpCode::Text, b"Hello");

        let mut decoder = server();
        let mut buf = BytesMut::new();
        let mut result = None;
        for byte in wire.iter() {
            buf.extend_from_slice(&[*byte]);
            if let Some(msg) = decoder.decode(&mut buf).unwrap() {
                result = Some(msg);
            }
        }
        assert_eq!(result.unwrap(), Message::text("Hello"));
        assert_eq!(decoder.state(), DecoderState::FrameComplete);
    }

    #[test]
    fn test_fragmented_reassembly() {
        let mut buf = BytesMut::new();
        client_frame(&mut buf, false, OpCode::Text, b"Hel");
        client_frame(&mut buf, false, OpCode::Continuation, b"l");
        client_frame(&mut buf, true, OpCode::Continuation, b"o");

        let mut decoder = server();
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(Message::text("Hello")));
        assert!(!decoder.in_message());
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_control_frame_between_fragments() {
        let mut buf = BytesMut::new();
        client_frame(&mut buf, false, OpCode::Binary, b"ab");
        client_frame(&mut buf, true, OpCode::Ping, b"p");
        client_frame(&mut buf, true, OpCode::Continuation, b"cd");

        let mut decoder = server();
        let ping = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(ping.kind(), MessageType::Ping);
        assert_eq!(&ping.payload()[..], b"p");
        assert!(decoder.in_message());

        let data = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(data, Message::binary(&b"abcd"[..]));
    }

    #[test]
    fn test_role_masking_rules() {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, true, OpCode::Text, b"x", None);
        assert_eq!(
            server().decode(&mut buf),
            Err(ProtocolError::UnmaskedClientFrame)
        );

        let mut buf = BytesMut::new();
        client_frame(&mut buf, true, OpCode::Text, b"x");
        let mut client = FrameDecoder::new(DecoderConfig::client(1024));
        assert_eq!(client.decode(&mut buf), Err(ProtocolError::MaskedServerFrame));

        let mut buf = BytesMut::new();
        encode_frame(&mut buf, true, OpCode::Text, b"x", None);
        let mut client = FrameDecoder::new(DecoderConfig::client(1024));
        assert_eq!(client.decode(&mut buf).unwrap(), Some(Message::text("x")));
    }

    #[test]
    fn test_continuation_ordering_errors() {
        let mut buf = BytesMut::new();
        client_frame(&mut buf, true, OpCode::Continuation, b"x");
        assert_eq!(
            server().decode(&mut buf),
            Err(ProtocolError::BadContinuationFrame)
        );

        let mut buf = BytesMut::new();
        client_frame(&mut buf, false, OpCode::Text, b"a");
        client_frame(&mut buf, true, OpCode::Text, b"b");
        assert_eq!(
            server().decode(&mut buf),
            Err(ProtocolError::MessageNotContinued)
        );
    }

    #[test]
    fn test_message_size_limit() {
        let mut decoder = FrameDecoder::new(DecoderConfig::server(4));
        let mut buf = BytesMut::new();
        client_frame(&mut buf, false, OpCode::Binary, b"abc");
        client_frame(&mut buf, true, OpCode::Continuation, b"de");
        assert_eq!(decoder.decode(&mut buf), Err(ProtocolError::MessageTooLarge(4)));

        // Rejected from the header alone, before the payload arrives
        let mut decoder = FrameDecoder::new(DecoderConfig::server(4));
        let mut buf = BytesMut::from(&[0x82u8, 0x80 | 126, 0x10, 0x00][..]);
        buf.extend_from_slice(&MASK);
        assert_eq!(decoder.decode(&mut buf), Err(ProtocolError::MessageTooLarge(4)));
    }

    #[test]
    fn test_text_must_be_utf8() {
        let mut buf = BytesMut::new();
        client_frame(&mut buf, true, OpCode::Text, &[0xC3, 0x28]);
        assert_eq!(server().decode(&mut buf), Err(ProtocolError::InvalidUtf8));

        // A code point split across fragments is fine
        let mut buf = BytesMut::new();
        client_frame(&mut buf, false, OpCode::Text, &[0xC3]);
        client_frame(&mut buf, true, OpCode::Continuation, &[0xA9]);
        assert_eq!(server().decode(&mut buf).unwrap(), Some(Message::text("é")));
    }

    #[test]
    fn test_close_frame_validation() {
        let mut buf = BytesMut::new();
        client_frame(&mut buf, true, OpCode::Close, &[0x03]);
        assert_eq!(
            server().decode(&mut buf),
            Err(ProtocolError::InvalidClosePayload)
        );

        let mut buf = BytesMut::new();
        client_frame(&mut buf, true, OpCode::Close, &[0x03, 0xE8, b'o', b'k']);
        let close = server().decode(&mut buf).unwrap().unwrap();
        assert_eq!(close.close_code(), Some(1000));
        assert_eq!(close.close_reason(), Some("ok"));
    }

    #[test]
    fn test_strict_length_policy() {
        let mut wire = BytesMut::from(&[0x82u8, 0x80 | 126, 0x00, 0x03][..]);
        wire.extend_from_slice(&MASK);
        wire.extend_from_slice(b"abc");

        let mut lenient = server();
        assert!(lenient.decode(&mut wire.clone()).unwrap().is_some());

        let mut strict = FrameDecoder::new(DecoderConfig {
            strict_length_encoding: true,
            ..DecoderConfig::server(1024)
        });
        assert_eq!(strict.decode(&mut wire), Err(ProtocolError::NonCanonicalLength));
    }
}
