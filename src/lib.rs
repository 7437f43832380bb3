//! Strand: event-driven network server engine
//!
//! A pool of worker threads shares one readiness listener. Every socket is
//! registered one-shot, so a notification is handed to exactly one worker,
//! which owns that socket until it rearms it.
//!
//! # Architecture
//!
//! - One-shot listener over epoll (Linux) or mio (everywhere)
//! - Reference-counted sockets with release notification
//! - HTTP/1.1 request handling with in-place WebSocket upgrade
//! - RFC 6455 framing with incremental, fragment-aware decoding
//! - UDP datagram serving on the same worker runtime

/// Configuration management for the server
pub mod config;

/// Datagram (UDP) server
pub mod datagram;

/// Error types and result aliases
pub mod error;

/// Sockets, the one-shot event listener and per-connection state
pub mod network;

/// HTTP and WebSocket protocol implementations
pub mod protocol;

/// Worker threads and server lifecycle
pub mod runtime;

/// Stream server
pub mod server;

pub use config::{BackendKind, Config};
pub use datagram::{DatagramContext, DatagramHandler, DatagramServer};
pub use error::{Error, ProtocolError, Result};
pub use network::{EventListener, Interest, Socket, SocketEvent};
pub use protocol::http::{HttpHandler, Request, Response};
pub use protocol::websocket::{CloseCode, Message, MessageType, WebSocketHandler, WsContext};
pub use runtime::{Runtime, ServerState, Service, WorkerData};
pub use server::{BoundInfo, Server};
