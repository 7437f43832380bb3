use super::{hangup, timeout_millis, WAKE_TOKEN};
use crate::error::Result;
use crate::network::event::{Events, Interest, Ready};
use crate::network::socket::SocketId;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// epoll instance with an eventfd used as the interrupt handle.
///
/// Every socket is registered `EPOLLET | EPOLLONESHOT`, so the kernel hands a
/// readiness edge to a single `epoll_wait` caller no matter how many threads
/// are blocked on the same instance. The eventfd is level-triggered and only
/// drained by `reset_wake`, which wakes every waiter once interrupted.
pub(crate) struct EpollSelector {
    epfd: OwnedFd,
    wake: OwnedFd,
}

impl EpollSelector {
    pub(crate) fn new() -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let epfd = unsafe { OwnedFd::from_raw_fd(epfd) };

        let wake = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if wake < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let wake = unsafe { OwnedFd::from_raw_fd(wake) };

        let selector = Self { epfd, wake };
        selector.ctl(
            libc::EPOLL_CTL_ADD,
            selector.wake.as_raw_fd(),
            libc::EPOLLIN as u32,
            WAKE_TOKEN,
        )?;
        Ok(selector)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, flags: u32, token: u64) -> Result<()> {
        let mut event = libc::epoll_event {
            events: flags,
            u64: token,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn flags(interest: Interest) -> u32 {
        let mut flags = libc::EPOLLET | libc::EPOLLONESHOT | libc::EPOLLRDHUP;
        if interest.is_readable() {
            flags |= libc::EPOLLIN;
        }
        if interest.is_writable() {
            flags |= libc::EPOLLOUT;
        }
        flags as u32
    }

    pub(crate) fn register(&self, fd: RawFd, token: SocketId, interest: Interest) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, Self::flags(interest), token)
    }

    pub(crate) fn reregister(&self, fd: RawFd, token: SocketId, interest: Interest) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, Self::flags(interest), token)
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0)
    }

    pub(crate) fn select(&self, events: &mut Events, timeout: Option<Duration>) -> Result<()> {
        let capacity = events.capacity();
        let buf = &mut events.epoll_buf;
        if buf.len() != capacity {
            buf.resize(capacity, libc::epoll_event { events: 0, u64: 0 });
        }

        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                buf.as_mut_ptr(),
                i32::try_from(capacity).unwrap_or(i32::MAX),
                timeout_millis(timeout),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err.into());
        }

        for event in &buf[..n as usize] {
            // Copy out of the packed struct before inspecting
            let token = event.u64;
            let bits = event.events;
            if token == WAKE_TOKEN {
                continue;
            }
            events.raw.push((token, translate(bits)));
        }
        Ok(())
    }

    pub(crate) fn wake(&self) {
        let one: u64 = 1;
        // EAGAIN means the counter is saturated, which still wakes waiters.
        unsafe {
            libc::write(
                self.wake.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }

    pub(crate) fn reset_wake(&self) {
        let mut value: u64 = 0;
        unsafe {
            libc::read(
                self.wake.as_raw_fd(),
                &mut value as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }
}

fn translate(bits: u32) -> Ready {
    let mut ready = Ready::EMPTY;
    if bits & libc::EPOLLIN as u32 != 0 {
        ready |= Ready::READABLE;
    }
    if bits & libc::EPOLLOUT as u32 != 0 {
        ready |= Ready::WRITABLE;
    }
    ready | hangup(
        bits & (libc::EPOLLRDHUP | libc::EPOLLHUP) as u32 != 0,
        false,
        bits & libc::EPOLLERR as u32 != 0,
    )
}
