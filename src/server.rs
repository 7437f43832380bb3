use crate::config::Config;
use crate::error::{Error, Result};
use crate::network::connection::{CloseReason, DispatchContext, Outcome};
use crate::network::{
    Connection, ConnectionId, Interest, Socket, SocketEvent, SocketId, SocketKind, SocketObserver,
    SocketOption,
};
use crate::protocol::http::{HttpHandler, NotFound};
use crate::protocol::websocket::{CloseCode, DecoderConfig, Message, Role, WebSocketHandler};
use crate::runtime::{Runtime, Service, ServerState, WorkerData};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Reported to the `on_ready` callback once the server is accepting
#[derive(Debug, Clone)]
pub struct BoundInfo {
    pub addr: SocketAddr,
    pub threads: usize,
    pub backlog: u32,
    pub backend: &'static str,
}

/// Pause before rearming the acceptor after a non-transient accept error
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Bounds for how often idle workers look for expired closes
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

type ReadyCallback = Box<dyn Fn(&BoundInfo) + Send + Sync>;
type WorkerHook = Box<dyn Fn(&mut WorkerData) + Send + Sync>;

/// Multi-threaded stream server speaking HTTP with WebSocket upgrade
pub struct Server {
    config: Config,
    runtime: Runtime,
    http: Arc<dyn HttpHandler>,
    websocket: Option<Arc<dyn WebSocketHandler>>,
    on_ready: Option<ReadyCallback>,
    on_worker_init: Option<WorkerHook>,
    on_worker_teardown: Option<WorkerHook>,
    acceptor: Mutex<Option<Arc<Socket>>>,
    acceptor_id: AtomicU64,
    connections: DashMap<ConnectionId, Arc<Mutex<Connection>>>,
    active_connections: AtomicUsize,
    accepted_total: AtomicU64,
    sweep_interval: Duration,
    last_sweep: Mutex<Instant>,
}

impl Server {
    /// Create a new server with the given configuration
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        if config.tls.is_some() {
            return Err(Error::Config(
                "TLS material is configured but this build has no TLS transport".to_string(),
            ));
        }

        let sweep_interval = (config.close_timeout() / 4).clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL);
        let mut runtime = Runtime::from_config(&config)?;
        runtime.set_tick(Some(sweep_interval));
        Ok(Self {
            config,
            runtime,
            http: Arc::new(NotFound),
            websocket: None,
            on_ready: None,
            on_worker_init: None,
            on_worker_teardown: None,
            acceptor: Mutex::new(None),
            acceptor_id: AtomicU64::new(0),
            connections: DashMap::new(),
            active_connections: AtomicUsize::new(0),
            accepted_total: AtomicU64::new(0),
            sweep_interval,
            last_sweep: Mutex::new(Instant::now()),
        })
    }

    pub fn with_http_handler(mut self, handler: impl HttpHandler + 'static) -> Self {
        self.http = Arc::new(handler);
        self
    }

    pub fn with_websocket_handler(mut self, handler: impl WebSocketHandler + 'static) -> Self {
        self.websocket = Some(Arc::new(handler));
        self
    }

    pub fn on_ready(mut self, callback: impl Fn(&BoundInfo) + Send + Sync + 'static) -> Self {
        self.on_ready = Some(Box::new(callback));
        self
    }

    pub fn on_worker_init(mut self, hook: impl Fn(&mut WorkerData) + Send + Sync + 'static) -> Self {
        self.on_worker_init = Some(Box::new(hook));
        self
    }

    pub fn on_worker_teardown(mut self, hook: impl Fn(&mut WorkerData) + Send + Sync + 'static) -> Self {
        self.on_worker_teardown = Some(Box::new(hook));
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run the server, spawning worker threads
    ///
    /// This method blocks until the server is shut down.
    pub fn run(self: Arc<Self>) -> Result<()> {
        if self.runtime.state() != ServerState::Created {
            return Err(Error::state("server has already been started"));
        }

        let addr = self.config.socket_addr()?;
        let acceptor = Socket::listen(addr, self.config.backlog)?;
        let bound = acceptor.local_addr()?;
        self.acceptor_id.store(acceptor.id(), Ordering::Release);
        *self.acceptor.lock() = Some(Arc::clone(&acceptor));

        let listener = Arc::clone(self.runtime.listener());
        listener.add(&acceptor, Interest::READABLE)?;
        self.runtime
            .transition(ServerState::Created, ServerState::Listening)?;

        info!("Server listening on {}", bound);
        if let Some(callback) = &self.on_ready {
            callback(&BoundInfo {
                addr: bound,
                threads: self.runtime.threads(),
                backlog: self.config.backlog,
                backend: listener.backend_name(),
            });
        }

        let result = self.runtime.run(Arc::clone(&self));

        let _ = listener.remove(&acceptor);
        acceptor.close();
        self.acceptor.lock().take();
        self.close_all();
        info!("Server stopped");
        result
    }

    /// Signal the server to shut down gracefully
    pub fn stop(&self) {
        self.runtime.stop();
    }

    pub fn state(&self) -> ServerState {
        self.runtime.state()
    }

    /// Address the acceptor is bound to, once running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.acceptor.lock().as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Get the number of active client connections
    ///
    /// A connection counts until its socket is released, not merely closed.
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }

    pub fn accepted_total(&self) -> u64 {
        self.accepted_total.load(Ordering::Relaxed)
    }

    fn decoder_config(&self) -> DecoderConfig {
        DecoderConfig {
            role: Role::Server,
            max_message_size: self.config.max_message_size,
            strict_length_encoding: self.config.strict_length_encoding,
        }
    }

    fn accept_ready(self: &Arc<Self>, acceptor: &Arc<Socket>) -> Result<()> {
        loop {
            if self.runtime.is_stopping() {
                return Ok(());
            }
            match acceptor.accept() {
                Ok(Some((socket, addr))) => self.admit(socket, addr),
                Ok(None) => break,
                Err(e) => match accept_backoff(&e) {
                    None => continue,
                    Some(pause) => {
                        if e.is_resource_exhausted() {
                            warn!(error = %e, "out of resources accepting connections, backing off");
                        } else {
                            error!("Error accepting connection: {}", e);
                        }
                        std::thread::sleep(pause);
                        break;
                    }
                },
            }
        }
        self.runtime.listener().rearm(acceptor, Interest::READABLE)
    }

    fn admit(self: &Arc<Self>, socket: Arc<Socket>, addr: SocketAddr) {
        let id = socket.id();
        if self.config.tcp_nodelay {
            if let Err(e) = socket.set_opt(SocketOption::NoDelay(true)) {
                debug!(id, error = %e, "could not set nodelay");
            }
        }

        let observer: std::sync::Weak<Server> = Arc::downgrade(self);
        socket.set_observer(observer);
        self.active_connections.fetch_add(1, Ordering::AcqRel);
        self.accepted_total.fetch_add(1, Ordering::Relaxed);

        // The table entry must exist before the first event can fire
        let connection = Connection::new(Arc::clone(&socket), Some(addr), self.config.connection_buffer_size)
            .with_write_limit(self.config.max_pending_writes);
        self.connections.insert(id, Arc::new(Mutex::new(connection)));

        match self.runtime.listener().add(&socket, Interest::READABLE) {
            Ok(()) => debug!(id, %addr, "New connection"),
            Err(e) => {
                warn!(id, %addr, error = %e, "refusing connection");
                self.connections.remove(&id);
                socket.close();
            }
        }
    }

    fn dispatch(&self, event: SocketEvent, worker: &mut WorkerData) -> Result<()> {
        let id = event.socket.id();
        let Some(connection) = self.connections.get(&id).map(|entry| Arc::clone(entry.value()))
        else {
            trace!(id, "event for a connection that is already gone");
            return Ok(());
        };
        let mut connection = connection.lock();
        if connection.is_released() {
            return Ok(());
        }

        let mut ctx = DispatchContext {
            http: self.http.as_ref(),
            websocket: self.websocket.as_deref(),
            worker,
            decoder: self.decoder_config(),
        };
        match connection.dispatch(event.ready, &mut ctx) {
            Outcome::Rearm(interest) => {
                if let Err(e) = self.runtime.listener().rearm(&event.socket, interest) {
                    self.release(&mut connection, CloseReason::Io(e));
                }
            }
            Outcome::Close(reason) => self.release(&mut connection, reason),
        }
        Ok(())
    }

    /// Unregister and close a connection. The socket itself is released once
    /// the last reference (possibly an in-flight event) drops.
    fn release(&self, connection: &mut Connection, reason: CloseReason) {
        let id = connection.id();
        connection.mark_released();
        match &reason {
            CloseReason::Normal => debug!(id, "connection closed"),
            CloseReason::PeerClosed => debug!(id, "peer closed connection"),
            CloseReason::CloseTimeout => debug!(id, "peer did not answer close"),
            CloseReason::Protocol(e) => debug!(id, error = %e, "closing connection on protocol error"),
            CloseReason::Io(e) if e.is_disconnect() => debug!(id, error = %e, "connection reset"),
            CloseReason::Io(e) => warn!(id, error = %e, "closing connection on I/O error"),
        }

        let socket = connection.socket();
        if let Err(e) = self.runtime.listener().remove(socket) {
            trace!(id, error = %e, "socket was not registered");
        }
        socket.close();
        self.connections.remove(&id);

        if connection.is_websocket() {
            if let Some(handler) = &self.websocket {
                handler.on_close(id, connection.peer_close_code());
            }
        }
    }

    /// Close every remaining connection after the workers have stopped
    fn close_all(&self) {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|entry| *entry.key()).collect();
        if !ids.is_empty() {
            info!(count = ids.len(), "closing remaining connections");
        }
        for id in ids {
            let Some((_, connection)) = self.connections.remove(&id) else {
                continue;
            };
            let mut connection = connection.lock();
            if connection.is_websocket() {
                let _ = connection.send_message(Message::close(Some(CloseCode::GoingAway.as_u16()), "server shutting down"));
                let _ = connection.probe_write();
            }
            self.release(&mut connection, CloseReason::Normal);
        }
    }

    /// Release WebSocket connections whose close frame went unanswered.
    /// Connections busy on another worker are left for the next sweep.
    fn sweep_expired_closes(&self) {
        {
            let Some(mut last) = self.last_sweep.try_lock() else {
                return;
            };
            if last.elapsed() < self.sweep_interval {
                return;
            }
            *last = Instant::now();
        }

        let timeout = self.config.close_timeout();
        let now = Instant::now();
        let expired: Vec<Arc<Mutex<Connection>>> = self
            .connections
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .try_lock()
                    .and_then(|c| c.close_deadline(timeout))
                    .is_some_and(|deadline| deadline <= now)
            })
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for connection in expired {
            let Some(mut connection) = connection.try_lock() else {
                continue;
            };
            let still_expired = connection
                .close_deadline(timeout)
                .is_some_and(|deadline| deadline <= now);
            if !connection.is_released() && still_expired {
                self.release(&mut connection, CloseReason::CloseTimeout);
            }
        }
    }
}

/// How long to wait before accepting again after `error`, or `None` when the
/// next accept can follow immediately
fn accept_backoff(error: &Error) -> Option<Duration> {
    let interrupted = matches!(error, Error::Io(e) if e.kind() == std::io::ErrorKind::Interrupted);
    if error.is_disconnect() || interrupted {
        None
    } else {
        Some(ACCEPT_BACKOFF)
    }
}

impl Service for Server {
    fn on_event(self: &Arc<Self>, event: SocketEvent, worker: &mut WorkerData) -> Result<()> {
        if event.socket.id() == self.acceptor_id.load(Ordering::Acquire) {
            return self.accept_ready(&event.socket);
        }
        self.dispatch(event, worker)
    }

    fn on_tick(&self, _worker: &mut WorkerData) {
        self.sweep_expired_closes();
    }

    fn on_worker_start(&self, worker: &mut WorkerData) {
        if let Some(hook) = &self.on_worker_init {
            hook(worker);
        }
    }

    fn on_worker_stop(&self, worker: &mut WorkerData) {
        if let Some(hook) = &self.on_worker_teardown {
            hook(worker);
        }
    }
}

impl SocketObserver for Server {
    fn on_released(&self, id: SocketId, kind: SocketKind) {
        if kind == SocketKind::Stream {
            self.active_connections.fetch_sub(1, Ordering::AcqRel);
            trace!(id, "socket released");
        }
    }
}
