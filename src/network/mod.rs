pub mod connection;
pub mod event;
pub mod listener;
pub mod socket;

pub use connection::{Connection, ConnectionId, ProbeResult};
pub use event::{Events, Interest, Ready, SocketEvent};
pub use listener::EventListener;
pub use socket::{
    Family, Socket, SocketFlags, SocketId, SocketKind, SocketObserver, SocketOption,
    SocketOptionKind,
};
