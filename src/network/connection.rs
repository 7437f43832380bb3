use crate::error::{Error, Result};
use crate::network::event::{Interest, Ready};
use crate::network::socket::{Socket, SocketId};
use crate::protocol::http::{self, HttpHandler, Request, Response};
use crate::protocol::websocket::handshake;
use crate::protocol::websocket::{
    CloseCode, DecoderConfig, Message, MessageType, Session, WebSocketHandler, WsContext,
};
use crate::runtime::WorkerData;
use bytes::{Buf, BytesMut};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace, warn};

pub type ConnectionId = SocketId;

/// Most bytes pulled off the socket in one probe; readiness is re-reported on
/// rearm if more is pending
const READ_BUDGET: usize = 256 * 1024;

/// Default write high-water mark, in multiples of the buffer size
const DEFAULT_PENDING_BUFFERS: usize = 64;

/// Outcome of reading and parsing whatever the socket has buffered
#[derive(Debug)]
pub enum ProbeResult {
    /// Transport failure
    Error(Error),
    /// Orderly end of stream with nothing left to process
    PeerClosed,
    /// The peer violated the protocol
    InvalidData(Error),
    /// A partial request is buffered
    NeedMoreData,
    /// At least one request or message is ready for `on_request_complete`
    Complete,
}

/// What the owner of a connection should do after a dispatch
#[derive(Debug)]
pub enum Outcome {
    Rearm(Interest),
    Close(CloseReason),
}

#[derive(Debug)]
pub enum CloseReason {
    /// Either side finished the protocol's closing sequence
    Normal,
    PeerClosed,
    /// The peer never answered our close frame
    CloseTimeout,
    Protocol(Error),
    Io(Error),
}

/// Collaborators a connection needs while it is being dispatched
pub struct DispatchContext<'a> {
    pub http: &'a dyn HttpHandler,
    pub websocket: Option<&'a dyn WebSocketHandler>,
    pub worker: &'a mut WorkerData,
    pub decoder: DecoderConfig,
}

enum Protocol {
    Http(VecDeque<Request>),
    WebSocket(WsState),
}

struct WsState {
    session: Session,
    ready: VecDeque<Message>,
}

/// One accepted stream and the protocol spoken on it.
///
/// Starts as HTTP; a valid upgrade request swaps it to WebSocket within the
/// same dispatch.
pub struct Connection {
    socket: Arc<Socket>,

    protocol: Protocol,

    // Buffers
    inbound: BytesMut,
    outbound: BytesMut,
    buffer_size: usize,
    max_pending_writes: usize,

    // Connection state
    peer_closed: bool,
    close_after_flush: bool,
    reading_paused: bool,
    released: bool,

    // Client metadata
    pub client_addr: Option<SocketAddr>,
    pub connected_at: u64, // Unix timestamp in seconds
    pub requests_processed: u64,
}

impl Connection {
    pub fn new(socket: Arc<Socket>, client_addr: Option<SocketAddr>, buffer_size: usize) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        Self {
            socket,
            protocol: Protocol::Http(VecDeque::new()),
            inbound: BytesMut::with_capacity(buffer_size),
            outbound: BytesMut::with_capacity(buffer_size),
            buffer_size,
            max_pending_writes: buffer_size.saturating_mul(DEFAULT_PENDING_BUFFERS),
            peer_closed: false,
            close_after_flush: false,
            reading_paused: false,
            released: false,
            client_addr,
            connected_at: now,
            requests_processed: 0,
        }
    }

    /// Stop reading while more than `limit` bytes are waiting to be sent;
    /// reading resumes once half of that has drained
    pub fn with_write_limit(mut self, limit: usize) -> Self {
        self.max_pending_writes = limit.max(1);
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.socket.id()
    }

    pub fn socket(&self) -> &Arc<Socket> {
        &self.socket
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self.protocol, Protocol::WebSocket(_))
    }

    /// Close status the peer sent, if it sent one
    pub fn peer_close_code(&self) -> Option<u16> {
        match &self.protocol {
            Protocol::WebSocket(ws) => ws.session.peer_close_code,
            Protocol::Http(_) => None,
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.outbound.is_empty()
    }

    pub fn pending_writes(&self) -> usize {
        self.outbound.len()
    }

    /// True while input is left unread because the peer is not draining output
    pub fn is_reading_paused(&self) -> bool {
        self.reading_paused
    }

    /// When an unanswered close frame of ours expires
    pub fn close_deadline(&self, timeout: Duration) -> Option<Instant> {
        match &self.protocol {
            Protocol::WebSocket(ws) => ws.session.close_deadline(timeout),
            Protocol::Http(_) => None,
        }
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Mark the connection as torn down; later events for it are ignored
    pub fn mark_released(&mut self) {
        self.released = true;
    }

    /// Queue a WebSocket message outside of a handler callback
    pub fn send_message(&mut self, message: Message) -> Result<()> {
        let Protocol::WebSocket(ws) = &mut self.protocol else {
            return Err(Error::state("websocket handshake has not completed"));
        };
        if ws.session.close_sent {
            return Err(Error::state("close frame already sent"));
        }
        if message.kind() == MessageType::Close {
            ws.session.close_sent = true;
            ws.session.note_close_sent();
        }
        message.encode(&mut self.outbound, None);
        Ok(())
    }

    /// Pull everything the socket has buffered and try to parse it
    pub fn probe_read(&mut self) -> ProbeResult {
        let mut received = 0;
        loop {
            let start = self.inbound.len();
            self.inbound.resize(start + self.buffer_size, 0);
            match self.socket.read(&mut self.inbound[start..]) {
                Ok(0) => {
                    self.inbound.truncate(start);
                    self.peer_closed = true;
                    break;
                }
                Ok(n) => {
                    self.inbound.truncate(start + n);
                    received += n;
                    if received >= READ_BUDGET {
                        break;
                    }
                }
                Err(e) => {
                    self.inbound.truncate(start);
                    if e.is_would_block() {
                        break;
                    }
                    if matches!(&e, Error::Io(inner) if inner.kind() == io::ErrorKind::Interrupted) {
                        continue;
                    }
                    return ProbeResult::Error(e);
                }
            }
        }
        trace!(id = self.id(), received, buffered = self.inbound.len(), "probe read");

        match self.parse() {
            Ok(true) => ProbeResult::Complete,
            Ok(false) if self.peer_closed => ProbeResult::PeerClosed,
            Ok(false) => ProbeResult::NeedMoreData,
            Err(e) => ProbeResult::InvalidData(e),
        }
    }

    /// Write as much pending output as the socket accepts
    pub fn probe_write(&mut self) -> ProbeResult {
        while !self.outbound.is_empty() {
            match self.socket.write(&self.outbound) {
                Ok(0) => return ProbeResult::PeerClosed,
                Ok(n) => self.outbound.advance(n),
                Err(e) if e.is_would_block() => return ProbeResult::NeedMoreData,
                Err(e) if e.is_disconnect() => return ProbeResult::PeerClosed,
                Err(e) => return ProbeResult::Error(e),
            }
        }
        ProbeResult::Complete
    }

    /// Parse buffered input into complete requests or messages; true when
    /// there is something to hand to `on_request_complete`
    fn parse(&mut self) -> Result<bool> {
        match &mut self.protocol {
            Protocol::Http(requests) => {
                while let Some((request, used)) = http::parse_request(&self.inbound)? {
                    self.inbound.advance(used);
                    let upgrade = handshake::is_upgrade_request(&request);
                    requests.push_back(request);
                    // Bytes after an upgrade request belong to the next protocol
                    if upgrade {
                        break;
                    }
                }
                Ok(!requests.is_empty())
            }
            Protocol::WebSocket(ws) => {
                while let Some(message) = ws.session.decoder.decode(&mut self.inbound)? {
                    ws.ready.push_back(message);
                }
                Ok(!ws.ready.is_empty())
            }
        }
    }

    /// Handle every complete request or message parsed so far.
    ///
    /// Returns `true` to keep the connection open.
    pub fn on_request_complete(&mut self, ctx: &mut DispatchContext<'_>) -> Result<bool> {
        loop {
            match &mut self.protocol {
                Protocol::Http(requests) => {
                    let Some(request) = requests.pop_front() else {
                        return Ok(!self.close_after_flush);
                    };
                    self.requests_processed += 1;
                    if handshake::is_upgrade_request(&request) {
                        if !self.upgrade(&request, ctx) {
                            return Ok(false);
                        }
                        // Frames pipelined behind the handshake
                        if !self.parse()? {
                            return Ok(true);
                        }
                        continue;
                    }

                    let response = ctx.http.handle(&request, &mut *ctx.worker);
                    let keep_alive = request.keep_alive() && !response.closes_connection();
                    let response = if keep_alive {
                        response
                    } else {
                        response.with_header("Connection", "close")
                    };
                    response.write_to(&mut self.outbound);
                    if !keep_alive {
                        self.close_after_flush = true;
                        return Ok(false);
                    }
                }
                Protocol::WebSocket(ws) => {
                    let Some(message) = ws.ready.pop_front() else {
                        return Ok(!(ws.session.close_received || self.close_after_flush));
                    };
                    self.requests_processed += 1;
                    self.on_message(message, ctx);
                }
            }
        }
    }

    /// Answer an upgrade request; false when the connection must close
    fn upgrade(&mut self, request: &Request, ctx: &mut DispatchContext<'_>) -> bool {
        let Some(handler) = ctx.websocket else {
            Response::not_found()
                .with_header("Connection", "close")
                .write_to(&mut self.outbound);
            self.close_after_flush = true;
            return false;
        };

        let upgrade = match handshake::validate_upgrade(request) {
            Ok(upgrade) => upgrade,
            Err(e) => {
                debug!(id = self.id(), error = %e, "rejected upgrade");
                Response::bad_request(&e.to_string()).write_to(&mut self.outbound);
                self.close_after_flush = true;
                return false;
            }
        };

        let protocol = handler
            .select_protocol(&upgrade.protocols)
            .filter(|chosen| upgrade.protocols.contains(chosen));
        handshake::switching_protocols(&upgrade.accept, protocol.as_deref()).write_to(&mut self.outbound);
        self.protocol = Protocol::WebSocket(WsState {
            session: Session::new(ctx.decoder, protocol),
            ready: VecDeque::new(),
        });
        debug!(id = self.id(), path = %request.path, "upgraded to websocket");

        let id = self.id();
        let client_addr = self.client_addr;
        if let Protocol::WebSocket(ws) = &mut self.protocol {
            let mut ws_ctx = WsContext::new(
                id,
                client_addr,
                ws.session.protocol.as_deref(),
                &mut ws.session.close_sent,
                &mut self.outbound,
                &mut *ctx.worker,
            );
            handler.on_connect(&mut ws_ctx);
        }
        true
    }

    fn on_message(&mut self, message: Message, ctx: &mut DispatchContext<'_>) {
        let id = self.id();
        let client_addr = self.client_addr;
        let Protocol::WebSocket(ws) = &mut self.protocol else {
            return;
        };
        let session = &mut ws.session;

        match message.kind() {
            MessageType::Close => {
                session.close_received = true;
                session.peer_close_code = message.close_code();
                if !session.close_sent {
                    session.close_sent = true;
                    Message::close(message.close_code(), "").encode(&mut self.outbound, None);
                }
                trace!(id, code = ?message.close_code(), "close received");
                return;
            }
            MessageType::Ping if !session.close_sent => {
                Message::pong(message.payload().clone()).encode(&mut self.outbound, None);
            }
            _ => {}
        }

        // Data that arrives after our close frame is discarded
        if session.close_sent && !message.kind().is_control() {
            return;
        }
        if let Some(handler) = ctx.websocket {
            let mut ws_ctx = WsContext::new(
                id,
                client_addr,
                session.protocol.as_deref(),
                &mut session.close_sent,
                &mut self.outbound,
                &mut *ctx.worker,
            );
            handler.on_message(&mut ws_ctx, message);
        }
    }

    /// Queue the close frame that answers a protocol violation
    fn fail(&mut self, error: &Error) {
        if let Protocol::WebSocket(ws) = &mut self.protocol {
            if !ws.session.close_sent {
                ws.session.close_sent = true;
                let code = match error {
                    Error::Protocol(e) => e.close_code(),
                    _ => CloseCode::Protocol.as_u16(),
                };
                Message::close(Some(code), "").encode(&mut self.outbound, None);
            }
        } else if matches!(error, Error::MalformedRequest(_)) {
            Response::bad_request(&error.to_string()).write_to(&mut self.outbound);
        }
    }

    /// Run one readiness notification through the connection.
    ///
    /// | probe-read   | action                                 |
    /// |--------------|----------------------------------------|
    /// | Complete     | `on_request_complete`, then rearm or close |
    /// | NeedMoreData | rearm                                  |
    /// | InvalidData  | close, after a best-effort error reply |
    /// | PeerClosed   | close                                  |
    /// | Error        | close                                  |
    ///
    /// Once the connection has decided to close, input is ignored and the
    /// remaining output is flushed before the close is reported. While the
    /// peer leaves too much output unread, only hangups are read.
    pub fn dispatch(&mut self, ready: Ready, ctx: &mut DispatchContext<'_>) -> Outcome {
        let wants_read = (ready.is_readable() && !self.reading_paused)
            || ready.is_closed()
            || ready.is_error();
        if wants_read && !self.close_after_flush {
            match self.probe_read() {
                ProbeResult::Complete => match self.on_request_complete(ctx) {
                    Ok(true) => {}
                    Ok(false) => self.close_after_flush = true,
                    Err(e) => {
                        self.fail(&e);
                        self.flush_best_effort();
                        return Outcome::Close(CloseReason::Protocol(e));
                    }
                },
                ProbeResult::NeedMoreData => {}
                ProbeResult::InvalidData(e) => {
                    self.fail(&e);
                    self.flush_best_effort();
                    return Outcome::Close(CloseReason::Protocol(e));
                }
                ProbeResult::PeerClosed => return Outcome::Close(CloseReason::PeerClosed),
                ProbeResult::Error(e) => return Outcome::Close(CloseReason::Io(e)),
            }
        }

        if self.has_pending_writes() {
            match self.probe_write() {
                ProbeResult::Complete | ProbeResult::NeedMoreData => {}
                ProbeResult::PeerClosed => return Outcome::Close(CloseReason::PeerClosed),
                ProbeResult::Error(e) => return Outcome::Close(CloseReason::Io(e)),
                ProbeResult::InvalidData(e) => return Outcome::Close(CloseReason::Protocol(e)),
            }
        }
        if let Protocol::WebSocket(ws) = &mut self.protocol {
            ws.session.note_close_sent();
        }

        let pending = self.outbound.len();
        if self.reading_paused && pending <= self.max_pending_writes / 2 {
            self.reading_paused = false;
            trace!(id = self.id(), pending, "resuming reads");
        } else if !self.reading_paused && pending > self.max_pending_writes {
            self.reading_paused = true;
            debug!(id = self.id(), pending, "peer is not reading, pausing reads");
        }

        if self.close_after_flush && !self.has_pending_writes() {
            return Outcome::Close(CloseReason::Normal);
        }
        if self.peer_closed {
            return Outcome::Close(CloseReason::PeerClosed);
        }

        if self.reading_paused {
            Outcome::Rearm(Interest::WRITABLE)
        } else if self.has_pending_writes() {
            Outcome::Rearm(Interest::READABLE | Interest::WRITABLE)
        } else {
            Outcome::Rearm(Interest::READABLE)
        }
    }

    fn flush_best_effort(&mut self) {
        if let ProbeResult::Error(e) = self.probe_write() {
            warn!(id = self.id(), error = %e, "dropping unsent bytes on close");
        }
    }
}
