//! UDP server on the same runtime as the stream server.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::network::{Interest, Socket, SocketEvent};
use crate::runtime::{Runtime, Service, ServerState, WorkerData};
use crate::server::BoundInfo;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Largest datagram received in one call
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

const RECV_BUFFER_KEY: &str = "strand.datagram.recv_buffer";

/// A received datagram's sender and a way to answer it
pub struct DatagramContext<'a> {
    socket: &'a Socket,
    peer: SocketAddr,
    worker: &'a mut WorkerData,
}

impl<'a> DatagramContext<'a> {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Send a datagram back to the sender
    pub fn reply(&self, data: &[u8]) -> Result<usize> {
        self.socket.send_to(data, self.peer)
    }

    pub fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<usize> {
        self.socket.send_to(data, target)
    }

    pub fn worker(&mut self) -> &mut WorkerData {
        &mut *self.worker
    }
}

pub trait DatagramHandler: Send + Sync {
    fn on_datagram(&self, ctx: &mut DatagramContext<'_>, data: &[u8]);
}

impl<F> DatagramHandler for F
where
    F: Fn(&mut DatagramContext<'_>, &[u8]) + Send + Sync,
{
    fn on_datagram(&self, ctx: &mut DatagramContext<'_>, data: &[u8]) {
        self(ctx, data)
    }
}

pub struct DatagramServer {
    config: Config,
    runtime: Runtime,
    handler: Arc<dyn DatagramHandler>,
    on_ready: Option<Box<dyn Fn(&BoundInfo) + Send + Sync>>,
    socket: Mutex<Option<Arc<Socket>>>,
    received: AtomicU64,
}

impl DatagramServer {
    pub fn new(config: Config, handler: impl DatagramHandler + 'static) -> Result<Self> {
        config.validate()?;
        if config.tls.is_some() {
            return Err(Error::Config(
                "TLS material is configured but datagram transport has no TLS".to_string(),
            ));
        }
        let runtime = Runtime::from_config(&config)?;
        Ok(Self {
            config,
            runtime,
            handler: Arc::new(handler),
            on_ready: None,
            socket: Mutex::new(None),
            received: AtomicU64::new(0),
        })
    }

    pub fn on_ready(mut self, callback: impl Fn(&BoundInfo) + Send + Sync + 'static) -> Self {
        self.on_ready = Some(Box::new(callback));
        self
    }

    /// Bind, then serve until [`stop`](Self::stop) is called
    pub fn run(self: Arc<Self>) -> Result<()> {
        if self.runtime.state() != ServerState::Created {
            return Err(Error::state("server has already been started"));
        }

        let socket = Socket::bind_datagram(self.config.socket_addr()?)?;
        let bound = socket.local_addr()?;
        *self.socket.lock() = Some(Arc::clone(&socket));

        let listener = Arc::clone(self.runtime.listener());
        listener.add(&socket, Interest::READABLE)?;
        self.runtime
            .transition(ServerState::Created, ServerState::Listening)?;

        info!("Datagram server listening on {}", bound);
        if let Some(callback) = &self.on_ready {
            callback(&BoundInfo {
                addr: bound,
                threads: self.runtime.threads(),
                backlog: 0,
                backend: listener.backend_name(),
            });
        }

        let result = self.runtime.run(Arc::clone(&self));

        let _ = listener.remove(&socket);
        socket.close();
        self.socket.lock().take();
        info!(received = self.datagrams_received(), "Datagram server stopped");
        result
    }

    pub fn stop(&self) {
        self.runtime.stop();
    }

    pub fn state(&self) -> ServerState {
        self.runtime.state()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.lock().as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn datagrams_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

impl Service for DatagramServer {
    fn on_event(self: &Arc<Self>, event: SocketEvent, worker: &mut WorkerData) -> Result<()> {
        let socket = &event.socket;
        // Reuse one receive buffer per worker
        let mut buf = worker
            .remove::<Vec<u8>>(RECV_BUFFER_KEY)
            .unwrap_or_else(|| vec![0u8; MAX_DATAGRAM_SIZE]);

        let mut result = Ok(());
        loop {
            match socket.recv_from(&mut buf) {
                Ok((n, peer)) => {
                    self.received.fetch_add(1, Ordering::Relaxed);
                    trace!(%peer, len = n, "datagram received");
                    let mut ctx = DatagramContext {
                        socket,
                        peer,
                        worker: &mut *worker,
                    };
                    self.handler.on_datagram(&mut ctx, &buf[..n]);
                }
                Err(e) if e.is_would_block() => break,
                Err(e) if e.is_disconnect() => {
                    // ICMP errors from an earlier send surface here
                    debug!(error = %e, "ignoring datagram error");
                }
                Err(e) => {
                    warn!(error = %e, "datagram receive failed");
                    result = Err(e);
                    break;
                }
            }
        }
        worker.insert(RECV_BUFFER_KEY, buf);

        self.runtime.listener().rearm(socket, Interest::READABLE)?;
        result
    }
}
