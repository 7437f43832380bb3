#![allow(dead_code)]

use bytes::BytesMut;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use strand_server::protocol::websocket::{handshake, DecoderConfig, FrameDecoder};
use strand_server::{Config, Message, Result, Server};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn test_config(threads: usize) -> Config {
    Config {
        port: 0,
        threads,
        ..Config::default()
    }
}

/// Run `server` on a background thread and wait until it is accepting
pub fn spawn_server(server: Server) -> (Arc<Server>, SocketAddr, JoinHandle<Result<()>>) {
    let (tx, rx) = mpsc::channel();
    let server = Arc::new(server.on_ready(move |bound| {
        let _ = tx.send(bound.addr);
    }));
    let handle = {
        let server = Arc::clone(&server);
        std::thread::spawn(move || server.run())
    };
    let addr = rx.recv_timeout(TIMEOUT).expect("server did not become ready");
    (server, addr, handle)
}

pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Minimal blocking WebSocket client
pub struct WsClient {
    pub stream: TcpStream,
    buf: BytesMut,
    decoder: FrameDecoder,
}

impl WsClient {
    pub fn connect(addr: SocketAddr) -> Self {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();

        let key = handshake::generate_key();
        stream
            .write_all(handshake::client_request(&addr.to_string(), "/", &key).as_bytes())
            .unwrap();

        let mut raw = Vec::new();
        let mut chunk = [0u8; 1024];
        let head_end = loop {
            if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            let n = stream.read(&mut chunk).unwrap();
            assert!(n > 0, "server closed during handshake");
            raw.extend_from_slice(&chunk[..n]);
        };

        let head = String::from_utf8_lossy(&raw[..head_end]).to_string();
        assert!(head.starts_with("HTTP/1.1 101"), "unexpected reply: {head}");
        assert!(head.contains(&handshake::accept_key(&key)));

        Self {
            stream,
            buf: BytesMut::from(&raw[head_end..]),
            decoder: FrameDecoder::new(DecoderConfig::client(1 << 20)),
        }
    }

    /// Send a message masked the way a client must
    pub fn send(&mut self, message: Message) {
        let mut out = BytesMut::new();
        message.encode(&mut out, Some([0x37, 0xfa, 0x21, 0x3d]));
        self.stream.write_all(&out).unwrap();
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    /// Next message, or `None` once the server has closed the stream
    pub fn recv(&mut self) -> Option<Message> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(message) = self.decoder.decode(&mut self.buf).unwrap() {
                return Some(message);
            }
            let n = self.stream.read(&mut chunk).unwrap();
            if n == 0 {
                return None;
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    pub fn read_raw(&mut self, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.stream.read_exact(&mut out).unwrap();
        out
    }
}
