//! One-shot delivery and socket lifetime under real concurrency.

use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use strand_server::network::{Events, SocketId, SocketKind, SocketObserver};
use strand_server::{BackendKind, EventListener, Interest, Socket};

fn datagram() -> Arc<Socket> {
    Socket::bind_datagram("127.0.0.1:0".parse().unwrap()).unwrap()
}

/// Run `waiters` threads against `listener` until it is interrupted; returns
/// the total number of events they collected
fn spawn_waiters(listener: &Arc<EventListener>, waiters: usize) -> Vec<thread::JoinHandle<usize>> {
    (0..waiters)
        .map(|_| {
            let listener = Arc::clone(listener);
            thread::spawn(move || {
                let mut events = Events::with_capacity(16);
                let mut seen = 0;
                while !listener.is_interrupted() {
                    seen += listener
                        .wait(&mut events, Some(Duration::from_millis(20)))
                        .unwrap();
                }
                seen
            })
        })
        .collect()
}

fn one_shot_under_concurrent_waiters(backend: BackendKind) {
    let listener = Arc::new(EventListener::new(backend, 8).unwrap());
    let receiver = datagram();
    let sender = datagram();
    listener.add(&receiver, Interest::READABLE).unwrap();

    let waiters = spawn_waiters(&listener, 8);
    let target = receiver.local_addr().unwrap();
    sender.send_to(b"one", target).unwrap();
    sender.send_to(b"two", target).unwrap();
    thread::sleep(Duration::from_millis(200));

    // Still readable, but nobody rearmed it
    listener.rearm(&receiver, Interest::READABLE).unwrap();
    thread::sleep(Duration::from_millis(200));

    listener.interrupt();
    let total: usize = waiters.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total, 2, "one delivery per arming");
}

#[cfg(target_os = "linux")]
#[test]
fn test_epoll_delivers_once_per_arming() {
    one_shot_under_concurrent_waiters(BackendKind::Epoll);
}

#[test]
fn test_portable_delivers_once_per_arming() {
    one_shot_under_concurrent_waiters(BackendKind::Portable);
}

#[test]
fn test_interrupt_releases_every_waiter() {
    let listener = Arc::new(EventListener::new(BackendKind::Auto, 4).unwrap());
    let waiters: Vec<_> = (0..6)
        .map(|_| {
            let listener = Arc::clone(&listener);
            thread::spawn(move || {
                let mut events = Events::with_capacity(4);
                listener.wait(&mut events, None).unwrap()
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(50));
    listener.interrupt();
    for waiter in waiters {
        assert_eq!(waiter.join().unwrap(), 0);
    }

    listener.clear_interrupt();
    let mut events = Events::with_capacity(4);
    assert_eq!(
        listener
            .wait(&mut events, Some(Duration::from_millis(10)))
            .unwrap(),
        0
    );
}

#[derive(Default)]
struct Released {
    count: AtomicUsize,
}

impl SocketObserver for Released {
    fn on_released(&self, _id: SocketId, kind: SocketKind) {
        assert_eq!(kind, SocketKind::Datagram);
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_released_once_after_last_owner(
        delays in proptest::collection::vec(0u64..5, 1..12),
        register in any::<bool>(),
    ) {
        let observer = Arc::new(Released::default());
        let listener = EventListener::new(BackendKind::Auto, 4).unwrap();
        let socket = datagram();
        let weak: std::sync::Weak<Released> = Arc::downgrade(&observer);
        socket.set_observer(weak);
        if register {
            listener.add(&socket, Interest::READABLE).unwrap();
        }

        let barrier = Arc::new(Barrier::new(delays.len()));
        let owners: Vec<_> = delays
            .iter()
            .map(|&delay| {
                let clone = Arc::clone(&socket);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    thread::sleep(Duration::from_millis(delay));
                    drop(clone);
                })
            })
            .collect();
        for owner in owners {
            owner.join().unwrap();
        }

        prop_assert_eq!(observer.count.load(Ordering::SeqCst), 0);
        if register {
            listener.remove(&socket).unwrap();
            prop_assert_eq!(observer.count.load(Ordering::SeqCst), 0);
        }
        drop(socket);
        prop_assert_eq!(observer.count.load(Ordering::SeqCst), 1);
        drop(listener);
        prop_assert_eq!(observer.count.load(Ordering::SeqCst), 1);
    }
}
