//! Socket abstraction shared by the listener, the runtime and connections.
//!
//! A [`Socket`] is always handled through an `Arc`: the listener keeps one
//! reference while the socket is registered, the connection table keeps
//! another, and a worker holds a third while it dispatches an event. The OS
//! handle is released when the last reference drops, so a socket can never be
//! closed underneath a thread that is still using it.
//!
//! [`Socket::close`] is the logical close: it shuts the stream down, marks
//! the socket closed and makes further I/O fail with a state error. It is
//! idempotent and serialized with option changes by the transition mutex.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockRef, Type};
use std::any::Any;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::trace;

pub type SocketId = u64;

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    /// Listening stream socket
    Acceptor,
    /// Connected stream socket
    Stream,
    /// Datagram socket
    Datagram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => Family::V4,
            SocketAddr::V6(_) => Family::V6,
        }
    }
}

/// State bits of a socket
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SocketFlags(u32);

impl SocketFlags {
    pub const LISTENING: SocketFlags = SocketFlags(1 << 0);
    pub const CONNECTED: SocketFlags = SocketFlags(1 << 1);
    pub const READ_SHUT: SocketFlags = SocketFlags(1 << 2);
    pub const WRITE_SHUT: SocketFlags = SocketFlags(1 << 3);
    pub const CLOSED: SocketFlags = SocketFlags(1 << 4);
    pub const REGISTERED: SocketFlags = SocketFlags(1 << 5);
    pub const WANT_WRITE: SocketFlags = SocketFlags(1 << 6);

    pub fn contains(self, other: SocketFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for SocketFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SocketFlags({:#09b})", self.0)
    }
}

/// Socket options reachable through [`Socket::set_opt`] and [`Socket::get_opt`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    NoDelay(bool),
    ReuseAddr(bool),
    KeepAlive(bool),
    RecvBufferSize(usize),
    SendBufferSize(usize),
    Ttl(u32),
    Broadcast(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOptionKind {
    NoDelay,
    ReuseAddr,
    KeepAlive,
    RecvBufferSize,
    SendBufferSize,
    Ttl,
    Broadcast,
}

/// Notified by a socket it has a back-reference to
pub trait SocketObserver: Send + Sync {
    /// Called exactly once, after the OS handle has been released
    fn on_released(&self, id: SocketId, kind: SocketKind);
}

enum Handle {
    Acceptor(TcpListener),
    Stream(TcpStream),
    Datagram(UdpSocket),
}

impl Handle {
    fn sock_ref(&self) -> SockRef<'_> {
        match self {
            Handle::Acceptor(l) => SockRef::from(l),
            Handle::Stream(s) => SockRef::from(s),
            Handle::Datagram(u) => SockRef::from(u),
        }
    }

    fn raw_fd(&self) -> RawFd {
        match self {
            Handle::Acceptor(l) => l.as_raw_fd(),
            Handle::Stream(s) => s.as_raw_fd(),
            Handle::Datagram(u) => u.as_raw_fd(),
        }
    }
}

type UserData = Arc<dyn Any + Send + Sync>;

pub struct Socket {
    id: SocketId,
    kind: SocketKind,
    family: Family,
    handle: Handle,
    flags: AtomicU32,
    transition: Mutex<()>,
    observer: Mutex<Option<Weak<dyn SocketObserver>>>,
    user_data: Mutex<Option<UserData>>,
}

impl Socket {
    fn from_handle(handle: Handle, family: Family, flags: SocketFlags) -> Self {
        let kind = match handle {
            Handle::Acceptor(_) => SocketKind::Acceptor,
            Handle::Stream(_) => SocketKind::Stream,
            Handle::Datagram(_) => SocketKind::Datagram,
        };
        Self {
            id: NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            family,
            handle,
            flags: AtomicU32::new(flags.0),
            transition: Mutex::new(()),
            observer: Mutex::new(None),
            user_data: Mutex::new(None),
        }
    }

    /// Bind a non-blocking stream acceptor with the given backlog
    pub fn listen(addr: SocketAddr, backlog: u32) -> Result<Arc<Self>> {
        let socket = socket2::Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;
        socket.set_nonblocking(true)?;

        let listener: TcpListener = socket.into();
        Ok(Arc::new(Self::from_handle(
            Handle::Acceptor(listener),
            Family::of(&addr),
            SocketFlags::LISTENING,
        )))
    }

    /// Bind a non-blocking datagram socket
    pub fn bind_datagram(addr: SocketAddr) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Arc::new(Self::from_handle(
            Handle::Datagram(socket),
            Family::of(&addr),
            SocketFlags(0),
        )))
    }

    /// Open a client stream; the connect itself blocks, the socket is
    /// non-blocking afterwards
    pub fn connect(addr: SocketAddr, timeout: Option<Duration>) -> Result<Arc<Self>> {
        let stream = match timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout)?,
            None => TcpStream::connect(addr)?,
        };
        stream.set_nonblocking(true)?;
        Ok(Arc::new(Self::from_handle(
            Handle::Stream(stream),
            Family::of(&addr),
            SocketFlags::CONNECTED,
        )))
    }

    /// Wrap an already connected stream
    pub fn from_stream(stream: TcpStream) -> Result<Arc<Self>> {
        stream.set_nonblocking(true)?;
        let family = Family::of(&stream.peer_addr()?);
        Ok(Arc::new(Self::from_handle(
            Handle::Stream(stream),
            family,
            SocketFlags::CONNECTED,
        )))
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn flags(&self) -> SocketFlags {
        SocketFlags(self.flags.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.flags().contains(SocketFlags::CLOSED)
    }

    pub(crate) fn set_flag(&self, flag: SocketFlags, on: bool) {
        if on {
            self.flags.fetch_or(flag.0, Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!flag.0, Ordering::AcqRel);
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        let addr = match &self.handle {
            Handle::Acceptor(l) => l.local_addr()?,
            Handle::Stream(s) => s.local_addr()?,
            Handle::Datagram(u) => u.local_addr()?,
        };
        Ok(addr)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        match &self.handle {
            Handle::Stream(s) => Ok(s.peer_addr()?),
            _ => Err(Error::state("socket has no peer")),
        }
    }

    /// Accept one pending connection; `None` when the backlog is empty
    pub fn accept(&self) -> Result<Option<(Arc<Socket>, SocketAddr)>> {
        let Handle::Acceptor(listener) = &self.handle else {
            return Err(Error::state("accept on a non-acceptor socket"));
        };
        self.check_open()?;

        match listener.accept() {
            Ok((stream, addr)) => {
                stream.set_nonblocking(true)?;
                let child = Self::from_handle(Handle::Stream(stream), Family::of(&addr), SocketFlags::CONNECTED);
                trace!(parent = self.id, child = child.id, %addr, "accepted");
                Ok(Some((Arc::new(child), addr)))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.check_open()?;
        match &self.handle {
            Handle::Stream(s) => Ok((&*s).read(buf)?),
            Handle::Datagram(u) => Ok(u.recv(buf)?),
            Handle::Acceptor(_) => Err(Error::state("read on an acceptor socket")),
        }
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        self.check_open()?;
        match &self.handle {
            Handle::Stream(s) => Ok((&*s).write(buf)?),
            Handle::Datagram(u) => Ok(u.send(buf)?),
            Handle::Acceptor(_) => Err(Error::state("write on an acceptor socket")),
        }
    }

    pub fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize> {
        self.check_open()?;
        match &self.handle {
            Handle::Datagram(u) => Ok(u.send_to(buf, target)?),
            _ => Err(Error::state("send_to on a stream socket")),
        }
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        self.check_open()?;
        match &self.handle {
            Handle::Datagram(u) => Ok(u.recv_from(buf)?),
            _ => Err(Error::state("recv_from on a stream socket")),
        }
    }

    pub fn set_opt(&self, option: SocketOption) -> Result<()> {
        let _guard = self.transition.lock();
        self.check_open()?;
        let sock = self.handle.sock_ref();
        match option {
            SocketOption::NoDelay(on) => sock.set_nodelay(on)?,
            SocketOption::ReuseAddr(on) => sock.set_reuse_address(on)?,
            SocketOption::KeepAlive(on) => sock.set_keepalive(on)?,
            SocketOption::RecvBufferSize(size) => sock.set_recv_buffer_size(size)?,
            SocketOption::SendBufferSize(size) => sock.set_send_buffer_size(size)?,
            SocketOption::Ttl(ttl) => sock.set_ttl(ttl)?,
            SocketOption::Broadcast(on) => sock.set_broadcast(on)?,
        }
        Ok(())
    }

    pub fn get_opt(&self, kind: SocketOptionKind) -> Result<SocketOption> {
        let _guard = self.transition.lock();
        self.check_open()?;
        let sock = self.handle.sock_ref();
        let option = match kind {
            SocketOptionKind::NoDelay => SocketOption::NoDelay(sock.nodelay()?),
            SocketOptionKind::ReuseAddr => SocketOption::ReuseAddr(sock.reuse_address()?),
            SocketOptionKind::KeepAlive => SocketOption::KeepAlive(sock.keepalive()?),
            SocketOptionKind::RecvBufferSize => SocketOption::RecvBufferSize(sock.recv_buffer_size()?),
            SocketOptionKind::SendBufferSize => SocketOption::SendBufferSize(sock.send_buffer_size()?),
            SocketOptionKind::Ttl => SocketOption::Ttl(sock.ttl()?),
            SocketOptionKind::Broadcast => SocketOption::Broadcast(sock.broadcast()?),
        };
        Ok(option)
    }

    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        let _guard = self.transition.lock();
        self.check_open()?;
        let Handle::Stream(stream) = &self.handle else {
            return Err(Error::state("shutdown on a non-stream socket"));
        };
        match stream.shutdown(how) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
            Err(e) => return Err(e.into()),
        }
        match how {
            Shutdown::Read => self.set_flag(SocketFlags::READ_SHUT, true),
            Shutdown::Write => self.set_flag(SocketFlags::WRITE_SHUT, true),
            Shutdown::Both => {
                self.set_flag(SocketFlags::READ_SHUT, true);
                self.set_flag(SocketFlags::WRITE_SHUT, true);
            }
        }
        Ok(())
    }

    /// Logical close; returns `false` if the socket was already closed
    pub fn close(&self) -> bool {
        let _guard = self.transition.lock();
        if self.is_closed() {
            return false;
        }
        if let Handle::Stream(stream) = &self.handle {
            // The peer may already be gone; the handle is released on drop either way.
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.set_flag(SocketFlags::CLOSED, true);
        trace!(id = self.id, kind = ?self.kind, "closed");
        true
    }

    pub fn set_observer(&self, observer: Weak<dyn SocketObserver>) {
        *self.observer.lock() = Some(observer);
    }

    pub fn set_user_data<T: Any + Send + Sync>(&self, data: T) {
        *self.user_data.lock() = Some(Arc::new(data));
    }

    pub fn user_data<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.user_data
            .lock()
            .clone()
            .and_then(|data| data.downcast::<T>().ok())
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::state(format!("socket {} is closed", self.id)))
        } else {
            Ok(())
        }
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.handle.raw_fd()
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        // The handle itself is dropped after this body, the observer only needs
        // to know that no owner remains.
        if let Some(observer) = self.observer.get_mut().take().and_then(|w| w.upgrade()) {
            observer.on_released(self.id, self.kind);
        }
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("family", &self.family)
            .field("fd", &self.handle.raw_fd())
            .field("flags", &self.flags())
            .finish()
    }
}
