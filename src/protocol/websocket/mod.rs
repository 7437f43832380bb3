//! RFC 6455 WebSocket: framing, reassembly, handshake and the per-connection
//! session handed to a [`WebSocketHandler`].

pub mod decoder;
pub mod frame;
pub mod handshake;
pub mod message;

pub use decoder::{DecoderConfig, Frame, FrameDecoder, Role};
pub use frame::{apply_mask, apply_mask_offset, encode_frame, FrameHeader, OpCode};
pub use message::{CloseCode, Message, MessageType};

use crate::error::{Error, Result};
use crate::network::connection::ConnectionId;
use crate::runtime::WorkerData;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Callbacks for upgraded connections.
///
/// Every callback for one connection runs on whichever worker received the
/// event, never on two workers at once.
pub trait WebSocketHandler: Send + Sync {
    /// Pick one of the subprotocols the client offered, in its order of
    /// preference. The default accepts none and omits the response header.
    fn select_protocol(&self, _offered: &[String]) -> Option<String> {
        None
    }

    fn on_connect(&self, _ctx: &mut WsContext<'_>) {}

    /// Data messages, pings (already answered) and pongs
    fn on_message(&self, ctx: &mut WsContext<'_>, message: Message);

    /// The connection is gone; `code` is the peer's close status if it sent one
    fn on_close(&self, _id: ConnectionId, _code: Option<u16>) {}
}

/// Protocol state of an upgraded connection
pub(crate) struct Session {
    pub(crate) decoder: FrameDecoder,
    pub(crate) protocol: Option<String>,
    pub(crate) close_sent: bool,
    pub(crate) close_received: bool,
    pub(crate) peer_close_code: Option<u16>,
    /// When our close frame was queued, if the peer has not answered yet
    pub(crate) close_sent_at: Option<Instant>,
}

impl Session {
    pub(crate) fn new(config: DecoderConfig, protocol: Option<String>) -> Self {
        Self {
            decoder: FrameDecoder::new(config),
            protocol,
            close_sent: false,
            close_received: false,
            peer_close_code: None,
            close_sent_at: None,
        }
    }

    /// Start the close clock the first time a close frame is queued
    pub(crate) fn note_close_sent(&mut self) {
        if self.close_sent && self.close_sent_at.is_none() {
            self.close_sent_at = Some(Instant::now());
        }
    }

    /// Deadline for the peer to answer our close, if we are waiting on one
    pub(crate) fn close_deadline(&self, timeout: Duration) -> Option<Instant> {
        if self.close_received {
            return None;
        }
        self.close_sent_at.map(|at| at + timeout)
    }
}

/// View of a connection given to handler callbacks
pub struct WsContext<'a> {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    protocol: Option<&'a str>,
    close_sent: &'a mut bool,
    outbound: &'a mut BytesMut,
    worker: &'a mut WorkerData,
}

impl<'a> WsContext<'a> {
    pub(crate) fn new(
        id: ConnectionId,
        peer_addr: Option<SocketAddr>,
        protocol: Option<&'a str>,
        close_sent: &'a mut bool,
        outbound: &'a mut BytesMut,
        worker: &'a mut WorkerData,
    ) -> Self {
        Self {
            id,
            peer_addr,
            protocol,
            close_sent,
            outbound,
            worker,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Subprotocol offered by the client, if any
    pub fn protocol(&self) -> Option<&str> {
        self.protocol
    }

    pub fn worker(&mut self) -> &mut WorkerData {
        &mut *self.worker
    }

    /// True once a close frame has been queued
    pub fn is_closing(&self) -> bool {
        *self.close_sent
    }

    /// Queue a message; it is written when the dispatch finishes
    pub fn send(&mut self, message: Message) -> Result<()> {
        if *self.close_sent {
            return Err(Error::state("close frame already sent"));
        }
        if message.kind() == MessageType::Close {
            *self.close_sent = true;
        }
        message.encode(self.outbound, None);
        Ok(())
    }

    pub fn send_text(&mut self, text: impl Into<String>) -> Result<()> {
        self.send(Message::text(text))
    }

    pub fn send_binary(&mut self, data: impl Into<bytes::Bytes>) -> Result<()> {
        self.send(Message::binary(data))
    }

    /// Start the closing handshake; the connection is released once the peer
    /// answers, hangs up, or the close timeout passes
    pub fn close(&mut self, code: CloseCode, reason: &str) -> Result<()> {
        self.send(Message::close(Some(code.as_u16()), reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_rejects_send_after_close() {
        let mut close_sent = false;
        let mut outbound = BytesMut::new();
        let mut worker = WorkerData::new(0);
        let mut ctx = WsContext::new(7, None, None, &mut close_sent, &mut outbound, &mut worker);

        ctx.send_text("hi").unwrap();
        assert!(!ctx.is_closing());
        ctx.close(CloseCode::Normal, "done").unwrap();
        assert!(ctx.is_closing());
        assert!(matches!(ctx.send_text("late"), Err(Error::State(_))));
        assert_eq!(ctx.id(), 7);

        let mut decoder = FrameDecoder::new(DecoderConfig::client(1024));
        assert_eq!(decoder.decode(&mut outbound).unwrap(), Some(Message::text("hi")));
        let close = decoder.decode(&mut outbound).unwrap().unwrap();
        assert_eq!(close.close_code(), Some(1000));
    }

    #[test]
    fn test_close_deadline_until_peer_answers() {
        let mut session = Session::new(DecoderConfig::server(1024), None);
        let timeout = Duration::from_secs(5);
        session.note_close_sent();
        assert_eq!(session.close_deadline(timeout), None);

        session.close_sent = true;
        session.note_close_sent();
        let deadline = session.close_deadline(timeout).unwrap();
        session.note_close_sent();
        assert_eq!(session.close_deadline(timeout), Some(deadline));

        session.close_received = true;
        assert_eq!(session.close_deadline(timeout), None);
    }
}
