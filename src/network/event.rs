use crate::network::socket::{Socket, SocketId};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

/// Readiness a socket is registered for
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interest(u8);

impl Interest {
    pub const READABLE: Interest = Interest(0b01);
    pub const WRITABLE: Interest = Interest(0b10);

    pub fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => f.write_str("READABLE | WRITABLE"),
            (true, false) => f.write_str("READABLE"),
            (false, true) => f.write_str("WRITABLE"),
            (false, false) => f.write_str("(empty)"),
        }
    }
}

/// Readiness reported by a wait call
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Ready(u8);

impl Ready {
    pub const EMPTY: Ready = Ready(0);
    pub const READABLE: Ready = Ready(0b0001);
    pub const WRITABLE: Ready = Ready(0b0010);
    pub const CLOSED: Ready = Ready(0b0100);
    pub const ERROR: Ready = Ready(0b1000);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_readable(self) -> bool {
        self.contains(Self::READABLE)
    }

    pub fn is_writable(self) -> bool {
        self.contains(Self::WRITABLE)
    }

    pub fn is_closed(self) -> bool {
        self.contains(Self::CLOSED)
    }

    pub fn is_error(self) -> bool {
        self.contains(Self::ERROR)
    }

    pub fn contains(self, other: Ready) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }
}

impl BitOr for Ready {
    type Output = Ready;

    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

impl BitOrAssign for Ready {
    fn bitor_assign(&mut self, rhs: Ready) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::READABLE, "READABLE"),
            (Self::WRITABLE, "WRITABLE"),
            (Self::CLOSED, "CLOSED"),
            (Self::ERROR, "ERROR"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("(empty)")?;
        }
        Ok(())
    }
}

/// One readiness notification produced by [`EventListener::wait`]
///
/// [`EventListener::wait`]: crate::network::EventListener::wait
#[derive(Clone)]
pub struct SocketEvent {
    pub socket: Arc<Socket>,
    pub ready: Ready,
}

impl fmt::Debug for SocketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketEvent")
            .field("socket", &self.socket.id())
            .field("ready", &self.ready)
            .finish()
    }
}

/// Caller-owned event buffer filled by a wait call
pub struct Events {
    capacity: usize,
    ready: Vec<SocketEvent>,
    pub(crate) raw: Vec<(SocketId, Ready)>,
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub(crate) epoll_buf: Vec<libc::epoll_event>,
    pub(crate) mio_buf: Option<mio::Events>,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            ready: Vec::with_capacity(capacity),
            raw: Vec::with_capacity(capacity),
            #[cfg(any(target_os = "linux", target_os = "android"))]
            epoll_buf: Vec::new(),
            mio_buf: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SocketEvent> {
        self.ready.iter()
    }

    /// Move the collected events out, leaving the buffer empty
    pub fn drain(&mut self) -> std::vec::Drain<'_, SocketEvent> {
        self.ready.drain(..)
    }

    pub(crate) fn clear(&mut self) {
        self.ready.clear();
    }

    /// Fold readiness into an event already collected for `id`
    pub(crate) fn merge(&mut self, id: SocketId, ready: Ready) -> bool {
        match self.ready.iter_mut().find(|e| e.socket.id() == id) {
            Some(existing) => {
                existing.ready |= ready;
                true
            }
            None => false,
        }
    }

    /// Append an event, folding readiness into an existing entry for the same socket
    pub(crate) fn push(&mut self, socket: Arc<Socket>, ready: Ready) {
        if let Some(existing) = self
            .ready
            .iter_mut()
            .find(|e| e.socket.id() == socket.id())
        {
            existing.ready |= ready;
            return;
        }
        self.ready.push(SocketEvent { socket, ready });
    }
}

impl<'a> IntoIterator for &'a Events {
    type Item = &'a SocketEvent;
    type IntoIter = std::slice::Iter<'a, SocketEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.ready.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_flags() {
        let ready = Ready::READABLE | Ready::CLOSED;
        assert!(ready.is_readable());
        assert!(ready.is_closed());
        assert!(!ready.is_writable());
        assert!(!ready.contains(Ready::EMPTY));
        assert_eq!(format!("{:?}", ready), "READABLE | CLOSED");
        assert_eq!(format!("{:?}", Ready::EMPTY), "(empty)");
    }

    #[test]
    fn test_interest_combination() {
        let interest = Interest::READABLE | Interest::WRITABLE;
        assert!(interest.is_readable());
        assert!(interest.is_writable());
        assert!(!Interest::READABLE.is_writable());
    }
}
