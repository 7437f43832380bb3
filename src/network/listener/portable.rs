use super::{hangup, WAKE_TOKEN};
use crate::error::{Error, Result};
use crate::network::event::{Events, Interest, Ready};
use crate::network::socket::SocketId;
use mio::unix::SourceFd;
use mio::{Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// `mio::Poll` shared behind a mutex.
///
/// Only one thread polls at a time; the others queue on the mutex and
/// re-check the interrupt flag once they get it. Registration goes through a
/// cloned `Registry` and never contends with the poller. mio registrations
/// are edge-triggered without a one-shot mode, so the listener's registration
/// state filters repeated edges and `reregister` makes the OS report any
/// readiness that is still pending when a socket is rearmed.
pub(crate) struct PortableSelector {
    poll: Mutex<Poll>,
    registry: Registry,
    waker: Waker,
}

impl PortableSelector {
    pub(crate) fn new() -> Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), Token(WAKE_TOKEN as usize))?;
        Ok(Self {
            poll: Mutex::new(poll),
            registry,
            waker,
        })
    }

    fn token(id: SocketId) -> Result<Token> {
        usize::try_from(id)
            .map(Token)
            .map_err(|_| Error::state(format!("socket id {id} does not fit a poll token")))
    }

    fn interest(interest: Interest) -> mio::Interest {
        match (interest.is_readable(), interest.is_writable()) {
            (true, true) => mio::Interest::READABLE | mio::Interest::WRITABLE,
            (false, true) => mio::Interest::WRITABLE,
            _ => mio::Interest::READABLE,
        }
    }

    pub(crate) fn register(&self, fd: RawFd, id: SocketId, interest: Interest) -> Result<()> {
        self.registry
            .register(&mut SourceFd(&fd), Self::token(id)?, Self::interest(interest))?;
        Ok(())
    }

    pub(crate) fn reregister(&self, fd: RawFd, id: SocketId, interest: Interest) -> Result<()> {
        self.registry
            .reregister(&mut SourceFd(&fd), Self::token(id)?, Self::interest(interest))?;
        Ok(())
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> Result<()> {
        self.registry.deregister(&mut SourceFd(&fd))?;
        Ok(())
    }

    pub(crate) fn select(
        &self,
        events: &mut Events,
        timeout: Option<Duration>,
        interrupted: &AtomicBool,
    ) -> Result<()> {
        let mut poll = self.poll.lock();
        if interrupted.load(Ordering::Acquire) {
            return Ok(());
        }

        let capacity = events.capacity();
        let buf = events
            .mio_buf
            .get_or_insert_with(|| mio::Events::with_capacity(capacity));

        match poll.poll(buf, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        drop(poll);

        for event in buf.iter() {
            let Token(token) = event.token();
            if token == WAKE_TOKEN as usize {
                continue;
            }
            let mut ready = Ready::EMPTY;
            if event.is_readable() {
                ready |= Ready::READABLE;
            }
            if event.is_writable() {
                ready |= Ready::WRITABLE;
            }
            ready |= hangup(event.is_read_closed(), event.is_write_closed(), event.is_error());
            events.raw.push((token as SocketId, ready));
        }
        Ok(())
    }

    pub(crate) fn wake(&self) {
        // A failed wake leaves the flag set; the next poll round observes it.
        let _ = self.waker.wake();
    }
}
