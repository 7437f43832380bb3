//! Readiness listener shared by every worker thread.
//!
//! Registrations are one-shot: once a socket has been reported by [`wait`],
//! it stays silent until [`rearm`] is called for it. Any number of workers may
//! call [`wait`] on the same listener concurrently and a given readiness
//! notification is handed to exactly one of them, which then owns the socket
//! until it rearms or removes it.
//!
//! The kernel-side one-shot (epoll's `EPOLLONESHOT`) is backed by an explicit
//! per-registration state, so the portable backend, whose multiplexer has no
//! one-shot mode, gives the same guarantee.
//!
//! [`wait`]: EventListener::wait
//! [`rearm`]: EventListener::rearm

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
mod portable;

use crate::config::BackendKind;
use crate::error::{Error, Result};
use crate::network::event::{Events, Interest, Ready};
use crate::network::socket::{Socket, SocketFlags, SocketId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Token reserved for the interrupt handle
pub(crate) const WAKE_TOKEN: u64 = u64::MAX;

const ARMED: u8 = 0;
const FIRED: u8 = 1;

struct Registration {
    socket: Arc<Socket>,
    state: AtomicU8,
}

impl Registration {
    /// Armed -> Fired; false when the notification was already handed out
    fn fire(&self) -> bool {
        self.state
            .compare_exchange(ARMED, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn arm(&self) {
        self.state.store(ARMED, Ordering::Release);
    }
}

enum Backend {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Epoll(epoll::EpollSelector),
    Portable(portable::PortableSelector),
}

impl Backend {
    fn register(&self, fd: RawFd, token: SocketId, interest: Interest) -> Result<()> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Epoll(s) => s.register(fd, token, interest),
            Backend::Portable(s) => s.register(fd, token, interest),
        }
    }

    fn reregister(&self, fd: RawFd, token: SocketId, interest: Interest) -> Result<()> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Epoll(s) => s.reregister(fd, token, interest),
            Backend::Portable(s) => s.reregister(fd, token, interest),
        }
    }

    fn deregister(&self, fd: RawFd) -> Result<()> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Epoll(s) => s.deregister(fd),
            Backend::Portable(s) => s.deregister(fd),
        }
    }

    fn select(&self, events: &mut Events, timeout: Option<Duration>, interrupted: &AtomicBool) -> Result<()> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Epoll(s) => s.select(events, timeout),
            Backend::Portable(s) => s.select(events, timeout, interrupted),
        }
    }

    fn wake(&self) {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Epoll(s) => s.wake(),
            Backend::Portable(s) => s.wake(),
        }
    }

    fn reset_wake(&self) {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Epoll(s) => s.reset_wake(),
            Backend::Portable(_) => {}
        }
    }

    fn name(&self) -> &'static str {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Epoll(_) => "epoll",
            Backend::Portable(_) => "portable",
        }
    }
}

/// Thread-safe, one-shot readiness listener
pub struct EventListener {
    backend: Backend,
    registrations: DashMap<SocketId, Arc<Registration>>,
    count: AtomicUsize,
    capacity: usize,
    interrupted: AtomicBool,
}

impl EventListener {
    /// Create a listener tracking at most `capacity` sockets
    pub fn new(kind: BackendKind, capacity: usize) -> Result<Self> {
        let backend = match kind {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            BackendKind::Auto | BackendKind::Epoll => Backend::Epoll(epoll::EpollSelector::new()?),
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            BackendKind::Auto => Backend::Portable(portable::PortableSelector::new()?),
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            BackendKind::Epoll => {
                return Err(Error::Config("epoll backend is only available on Linux".into()))
            }
            BackendKind::Portable => Backend::Portable(portable::PortableSelector::new()?),
        };
        debug!(backend = backend.name(), capacity, "event listener created");

        Ok(Self {
            backend,
            registrations: DashMap::new(),
            count: AtomicUsize::new(0),
            capacity,
            interrupted: AtomicBool::new(false),
        })
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of registered sockets
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_registered(&self, socket: &Socket) -> bool {
        self.registrations.contains_key(&socket.id())
    }

    /// Register `socket` for one-shot, edge-triggered notifications
    pub fn add(&self, socket: &Arc<Socket>, interest: Interest) -> Result<()> {
        let id = socket.id();
        if self.count.fetch_add(1, Ordering::AcqRel) >= self.capacity {
            self.count.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::Capacity(self.capacity));
        }

        match self.registrations.entry(id) {
            Entry::Occupied(_) => {
                self.count.fetch_sub(1, Ordering::AcqRel);
                return Err(Error::AlreadyRegistered(id));
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Registration {
                    socket: Arc::clone(socket),
                    state: AtomicU8::new(ARMED),
                }));
            }
        }

        // The registration must be visible before the kernel can report the socket.
        if let Err(e) = self.backend.register(socket.as_raw_fd(), id, interest) {
            self.registrations.remove(&id);
            self.count.fetch_sub(1, Ordering::AcqRel);
            return Err(e);
        }

        socket.set_flag(SocketFlags::REGISTERED, true);
        trace!(id, ?interest, "registered");
        Ok(())
    }

    /// Unregister `socket`, dropping the listener's reference to it
    pub fn remove(&self, socket: &Socket) -> Result<()> {
        let id = socket.id();
        let Some((_, registration)) = self.registrations.remove(&id) else {
            return Err(Error::NotRegistered(id));
        };
        self.count.fetch_sub(1, Ordering::AcqRel);
        socket.set_flag(SocketFlags::REGISTERED, false);

        let result = self.backend.deregister(registration.socket.as_raw_fd());
        trace!(id, "deregistered");
        result
    }

    /// Re-enable delivery for a socket whose last notification has been handled
    pub fn rearm(&self, socket: &Socket, interest: Interest) -> Result<()> {
        let id = socket.id();
        let registration = self
            .registrations
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(Error::NotRegistered(id))?;

        registration.arm();
        self.backend.reregister(socket.as_raw_fd(), id, interest)
    }

    /// Block until at least one socket is ready, the timeout elapses, or the
    /// listener is interrupted; returns the number of events collected
    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> Result<usize> {
        events.clear();
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if self.is_interrupted() {
                return Ok(0);
            }

            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            events.raw.clear();
            self.backend.select(events, remaining, &self.interrupted)?;

            let raw = std::mem::take(&mut events.raw);
            for &(id, ready) in &raw {
                let Some(registration) = self.registrations.get(&id).map(|e| Arc::clone(e.value()))
                else {
                    // Removed between the kernel reporting it and now
                    continue;
                };
                if registration.fire() {
                    events.push(Arc::clone(&registration.socket), ready);
                } else {
                    events.merge(id, ready);
                }
            }
            events.raw = raw;

            if !events.is_empty() {
                return Ok(events.len());
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(0);
            }
        }
    }

    /// Force every in-progress and future `wait` to return promptly.
    ///
    /// Only touches an atomic flag and writes to the wake handle, so it is
    /// safe from a signal handler.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.backend.wake();
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Undo a previous [`interrupt`](Self::interrupt)
    pub fn clear_interrupt(&self) {
        self.interrupted.store(false, Ordering::Release);
        self.backend.reset_wake();
    }
}

pub(crate) fn timeout_millis(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(t) => {
            let ms = t.as_millis();
            // Round sub-millisecond waits up so they do not turn into busy polls
            let ms = if ms == 0 && !t.is_zero() { 1 } else { ms };
            i32::try_from(ms).unwrap_or(i32::MAX)
        }
    }
}

/// Readiness bits that are not a plain read or write edge
pub(crate) fn hangup(read_closed: bool, write_closed: bool, error: bool) -> Ready {
    let mut ready = Ready::EMPTY;
    if read_closed || write_closed {
        ready |= Ready::CLOSED;
    }
    if error {
        ready |= Ready::ERROR;
    }
    ready
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backends() -> Vec<BackendKind> {
        let mut kinds = vec![BackendKind::Portable];
        if cfg!(any(target_os = "linux", target_os = "android")) {
            kinds.push(BackendKind::Epoll);
        }
        kinds
    }

    fn udp_pair() -> (Arc<Socket>, Arc<Socket>) {
        let a = Socket::bind_datagram("127.0.0.1:0".parse().unwrap()).unwrap();
        let b = Socket::bind_datagram("127.0.0.1:0".parse().unwrap()).unwrap();
        (a, b)
    }

    #[test]
    fn test_capacity_exceeded() {
        for kind in backends() {
            let listener = EventListener::new(kind, 1).unwrap();
            let (a, b) = udp_pair();
            listener.add(&a, Interest::READABLE).unwrap();
            assert!(matches!(
                listener.add(&b, Interest::READABLE),
                Err(Error::Capacity(1))
            ));
            assert_eq!(listener.len(), 1);
        }
    }

    #[test]
    fn test_duplicate_and_unknown_registrations() {
        for kind in backends() {
            let listener = EventListener::new(kind, 8).unwrap();
            let (a, b) = udp_pair();
            listener.add(&a, Interest::READABLE).unwrap();
            assert!(matches!(
                listener.add(&a, Interest::READABLE),
                Err(Error::AlreadyRegistered(_))
            ));
            assert!(matches!(listener.remove(&b), Err(Error::NotRegistered(_))));
            assert!(matches!(
                listener.rearm(&b, Interest::READABLE),
                Err(Error::NotRegistered(_))
            ));

            assert!(a.flags().contains(SocketFlags::REGISTERED));
            listener.remove(&a).unwrap();
            assert!(!a.flags().contains(SocketFlags::REGISTERED));
            assert!(listener.is_empty());
        }
    }

    #[test]
    fn test_listener_holds_a_reference() {
        let listener = EventListener::new(BackendKind::Portable, 8).unwrap();
        let (a, _) = udp_pair();
        listener.add(&a, Interest::READABLE).unwrap();
        assert_eq!(Arc::strong_count(&a), 2);
        listener.remove(&a).unwrap();
        assert_eq!(Arc::strong_count(&a), 1);
    }

    #[test]
    fn test_one_shot_until_rearmed() {
        for kind in backends() {
            let listener = EventListener::new(kind, 8).unwrap();
            let (a, b) = udp_pair();
            listener.add(&a, Interest::READABLE).unwrap();

            b.send_to(b"one", a.local_addr().unwrap()).unwrap();
            let mut events = Events::with_capacity(8);
            let n = listener.wait(&mut events, Some(Duration::from_secs(2))).unwrap();
            assert_eq!(n, 1, "backend {kind:?}");
            assert_eq!(events.iter().next().unwrap().socket.id(), a.id());

            // More data arrives but the registration has not been rearmed.
            b.send_to(b"two", a.local_addr().unwrap()).unwrap();
            let n = listener.wait(&mut events, Some(Duration::from_millis(100))).unwrap();
            assert_eq!(n, 0, "backend {kind:?}");

            listener.rearm(&a, Interest::READABLE).unwrap();
            let n = listener.wait(&mut events, Some(Duration::from_secs(2))).unwrap();
            assert_eq!(n, 1, "backend {kind:?}");
            assert!(events.iter().next().unwrap().ready.is_readable());
        }
    }

    #[test]
    fn test_interrupt_is_sticky_until_cleared() {
        for kind in backends() {
            let listener = EventListener::new(kind, 8).unwrap();
            let mut events = Events::with_capacity(4);

            listener.interrupt();
            assert_eq!(listener.wait(&mut events, None).unwrap(), 0);
            assert_eq!(listener.wait(&mut events, None).unwrap(), 0);

            listener.clear_interrupt();
            let n = listener.wait(&mut events, Some(Duration::from_millis(50))).unwrap();
            assert_eq!(n, 0);
            assert!(!listener.is_interrupted());
        }
    }

    #[test]
    fn test_interrupt_wakes_blocked_waiter() {
        for kind in backends() {
            let listener = Arc::new(EventListener::new(kind, 8).unwrap());
            let waiter = {
                let listener = Arc::clone(&listener);
                std::thread::spawn(move || {
                    let mut events = Events::with_capacity(4);
                    listener.wait(&mut events, None).unwrap()
                })
            };
            std::thread::sleep(Duration::from_millis(50));
            listener.interrupt();
            assert_eq!(waiter.join().unwrap(), 0);
        }
    }

    #[test]
    fn test_timeout_millis_rounding() {
        assert_eq!(timeout_millis(None), -1);
        assert_eq!(timeout_millis(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_millis(Some(Duration::from_micros(10))), 1);
        assert_eq!(timeout_millis(Some(Duration::from_millis(250))), 250);
    }
}
