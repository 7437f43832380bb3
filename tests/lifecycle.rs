//! Startup, worker hooks and graceful shutdown of the stream server.

mod common;

use common::{spawn_server, test_config, wait_until, WsClient};
use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strand_server::{Error, Message, Server, ServerState, WebSocketHandler, WsContext};

struct Silent;

impl WebSocketHandler for Silent {
    fn on_message(&self, _ctx: &mut WsContext<'_>, _message: Message) {}
}

fn shutdown_with_workers(threads: usize) {
    let started = Arc::new(AtomicUsize::new(0));
    let stopped = Arc::new(AtomicUsize::new(0));
    let server = {
        let started = Arc::clone(&started);
        let stopped = Arc::clone(&stopped);
        Server::new(test_config(threads))
            .unwrap()
            .with_websocket_handler(Silent)
            .on_worker_init(move |worker| {
                worker.insert("tag", worker.worker_id());
                started.fetch_add(1, Ordering::SeqCst);
            })
            .on_worker_teardown(move |worker| {
                assert_eq!(worker.get::<usize>("tag"), Some(&worker.worker_id()));
                stopped.fetch_add(1, Ordering::SeqCst);
            })
    };
    let (server, addr, handle) = spawn_server(server);
    assert_eq!(server.local_addr(), Some(addr));

    let workers = threads.max(1);
    assert!(wait_until(|| started.load(Ordering::SeqCst) == workers));
    assert_eq!(server.state(), ServerState::Running);

    let mut idle = TcpStream::connect(addr).unwrap();
    idle.set_read_timeout(Some(common::TIMEOUT)).unwrap();
    let _ws = WsClient::connect(addr);
    assert!(wait_until(|| server.active_connections() == 2));
    assert_eq!(server.accepted_total(), 2);

    server.stop();
    server.stop();
    handle.join().unwrap().unwrap();

    assert_eq!(server.state(), ServerState::Stopped);
    assert_eq!(stopped.load(Ordering::SeqCst), workers);
    assert_eq!(server.active_connections(), 0);

    let mut buf = [0u8; 16];
    assert_eq!(idle.read(&mut buf).unwrap(), 0, "idle connection is closed");
}

#[test]
fn test_shutdown_with_many_workers() {
    shutdown_with_workers(8);
}

#[test]
fn test_shutdown_with_inline_loop() {
    shutdown_with_workers(0);
}

#[test]
fn test_run_twice_is_refused() {
    let (server, _addr, handle) = spawn_server(Server::new(test_config(2)).unwrap());
    assert!(matches!(Arc::clone(&server).run(), Err(Error::State(_))));
    server.stop();
    handle.join().unwrap().unwrap();
}

#[test]
fn test_stop_from_another_thread_while_blocked() {
    let (server, _addr, handle) = spawn_server(Server::new(test_config(4)).unwrap());
    let stopper = {
        let server = Arc::clone(&server);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            server.stop();
        })
    };
    handle.join().unwrap().unwrap();
    stopper.join().unwrap();
    assert_eq!(server.state(), ServerState::Stopped);
}
