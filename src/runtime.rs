//! Worker pool shared by the stream and datagram servers.
//!
//! Every worker blocks in [`EventListener::wait`] on the same listener and
//! hands each event to the [`Service`]. One-shot delivery means a socket is
//! owned by exactly one worker between the event and its rearm, so services
//! never see the same socket on two threads at once.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::network::{EventListener, Events, SocketEvent};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created = 0,
    Listening = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
}

impl ServerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ServerState::Created,
            1 => ServerState::Listening,
            2 => ServerState::Running,
            3 => ServerState::Stopping,
            _ => ServerState::Stopped,
        }
    }
}

/// Per-worker key-value store handed to every callback run on that worker
pub struct WorkerData {
    worker_id: usize,
    values: HashMap<String, Box<dyn Any + Send>>,
}

impl WorkerData {
    pub fn new(worker_id: usize) -> Self {
        Self {
            worker_id,
            values: HashMap::new(),
        }
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Store a value, returning true if it replaced an existing one
    pub fn insert<T: Any + Send>(&mut self, key: impl Into<String>, value: T) -> bool {
        self.values.insert(key.into(), Box::new(value)).is_some()
    }

    pub fn get<T: Any + Send>(&self, key: &str) -> Option<&T> {
        self.values.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn get_mut<T: Any + Send>(&mut self, key: &str) -> Option<&mut T> {
        self.values.get_mut(key).and_then(|v| v.downcast_mut::<T>())
    }

    /// Remove a value; a value of another type is left in place
    pub fn remove<T: Any + Send>(&mut self, key: &str) -> Option<T> {
        if !self.values.get(key).is_some_and(|v| v.is::<T>()) {
            return None;
        }
        self.values
            .remove(key)
            .and_then(|v| v.downcast::<T>().ok())
            .map(|v| *v)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for WorkerData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerData")
            .field("worker_id", &self.worker_id)
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Event consumer run by every worker
pub trait Service: Send + Sync + 'static {
    /// Handle one event; errors are logged and do not stop the worker
    fn on_event(self: &Arc<Self>, event: SocketEvent, worker: &mut WorkerData) -> Result<()>;

    /// Called on every worker about once per tick, when the runtime has one
    fn on_tick(&self, _worker: &mut WorkerData) {}

    fn on_worker_start(&self, _worker: &mut WorkerData) {}

    fn on_worker_stop(&self, _worker: &mut WorkerData) {}
}

/// Lifecycle, stop flag and worker threads around a shared listener
pub struct Runtime {
    listener: Arc<EventListener>,
    state: AtomicU8,
    stop: AtomicBool,
    threads: usize,
    max_events: usize,
    pin_workers: bool,
    tick: Option<Duration>,
}

impl Runtime {
    pub fn new(listener: Arc<EventListener>, threads: usize, max_events: usize) -> Self {
        Self {
            listener,
            state: AtomicU8::new(ServerState::Created as u8),
            stop: AtomicBool::new(false),
            threads,
            max_events: max_events.max(1),
            pin_workers: false,
            tick: None,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let listener = EventListener::new(config.backend, config.max_registrations)?;
        let mut runtime = Self::new(Arc::new(listener), config.threads, config.max_events);
        runtime.pin_workers = config.pin_workers;
        Ok(runtime)
    }

    /// Bound every wait so [`Service::on_tick`] runs at this interval
    pub fn set_tick(&mut self, tick: Option<Duration>) {
        self.tick = tick;
    }

    pub fn listener(&self) -> &Arc<EventListener> {
        &self.listener
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub(crate) fn transition(&self, from: ServerState, to: ServerState) -> Result<()> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| {
                Error::state(format!(
                    "cannot move from {:?} to {:?}, server is {:?}",
                    from,
                    to,
                    ServerState::from_u8(actual)
                ))
            })
    }

    /// Run workers until [`stop`](Self::stop) is called.
    ///
    /// With zero threads the loop runs on the calling thread. Returns after
    /// every worker has finished; the state ends as `Stopped`.
    pub fn run<S: Service>(&self, service: Arc<S>) -> Result<()> {
        match self.state() {
            ServerState::Created => self.transition(ServerState::Created, ServerState::Running)?,
            _ => self.transition(ServerState::Listening, ServerState::Running)?,
        }
        // A stop that raced with startup still wins
        if self.is_stopping() {
            self.listener.interrupt();
        }

        let result = if self.threads == 0 {
            self.worker_loop(0, &service)
        } else {
            self.run_workers(&service)
        };

        self.state.store(ServerState::Stopped as u8, Ordering::Release);
        info!("All workers stopped");
        result
    }

    fn run_workers<S: Service>(&self, service: &Arc<S>) -> Result<()> {
        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(self.threads);
            for worker_id in 0..self.threads {
                let spawned = thread::Builder::new()
                    .name(format!("strand-worker-{worker_id}"))
                    .spawn_scoped(scope, move || self.worker_loop(worker_id, service));
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(e) => {
                        error!("Failed to spawn worker {}: {}", worker_id, e);
                        self.stop();
                        return Err(Error::from(e));
                    }
                }
            }

            let mut failed = 0;
            for handle in handles {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => failed += 1,
                    Err(_) => {
                        error!("Worker panicked");
                        failed += 1;
                    }
                }
            }
            if failed > 0 {
                warn!(failed, "workers exited with errors");
            }
            Ok(())
        })
    }

    fn worker_loop<S: Service>(&self, worker_id: usize, service: &Arc<S>) -> Result<()> {
        let mut data = WorkerData::new(worker_id);
        if self.pin_workers {
            pin_to_cpu(worker_id);
        }
        service.on_worker_start(&mut data);

        let mut events = Events::with_capacity(self.max_events);
        info!("Worker {} started", worker_id);

        let mut next_tick = self.tick.map(|tick| Instant::now() + tick);
        let result = loop {
            if self.is_stopping() {
                break Ok(());
            }
            let timeout = next_tick.map(|due| due.saturating_duration_since(Instant::now()));
            if let Err(e) = self.listener.wait(&mut events, timeout) {
                error!("Worker {} failed: {}", worker_id, e);
                break Err(e);
            }
            for event in events.drain() {
                let id = event.socket.id();
                if let Err(e) = service.on_event(event, &mut data) {
                    debug!(worker = worker_id, id, error = %e, "event handling failed");
                }
            }
            if let (Some(tick), Some(due)) = (self.tick, next_tick) {
                let now = Instant::now();
                if now >= due {
                    service.on_tick(&mut data);
                    next_tick = Some(now + tick);
                }
            }
        };

        service.on_worker_stop(&mut data);
        info!("Worker {} shutting down", worker_id);
        result
    }

    /// Ask every worker to finish. Safe to call from any thread, including a
    /// signal handler thread, and more than once.
    pub fn stop(&self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Initiating shutdown");
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                (s != ServerState::Stopped as u8).then_some(ServerState::Stopping as u8)
            });
        self.listener.interrupt();
    }
}

#[cfg(target_os = "linux")]
fn pin_to_cpu(worker_id: usize) {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let cpu = worker_id % num_cpus::get().max(1);
    let mut set = CpuSet::new();
    let pinned = set
        .set(cpu)
        .and_then(|_| sched_setaffinity(Pid::from_raw(0), &set));
    match pinned {
        Ok(()) => debug!(worker = worker_id, cpu, "pinned worker"),
        Err(e) => warn!(worker = worker_id, cpu, error = %e, "could not pin worker"),
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_cpu(worker_id: usize) {
    debug!(worker = worker_id, "cpu pinning is not supported on this platform");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use crate::network::{Interest, Socket};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_worker_data_store() {
        let mut data = WorkerData::new(3);
        assert_eq!(data.worker_id(), 3);
        assert!(!data.insert("count", 1u32));
        assert!(data.insert("count", 2u32));
        *data.get_mut::<u32>("count").unwrap() += 1;
        assert_eq!(data.get::<u32>("count"), Some(&3));
        assert_eq!(data.get::<String>("count"), None);
        assert_eq!(data.remove::<String>("count"), None);
        assert!(data.contains("count"));
        assert_eq!(data.remove::<u32>("count"), Some(3));
        assert!(data.is_empty());
    }

    #[test]
    fn test_state_transitions() {
        let listener = Arc::new(EventListener::new(BackendKind::Portable, 4).unwrap());
        let runtime = Runtime::new(listener, 0, 8);
        assert_eq!(runtime.state(), ServerState::Created);
        runtime
            .transition(ServerState::Created, ServerState::Listening)
            .unwrap();
        assert!(matches!(
            runtime.transition(ServerState::Created, ServerState::Listening),
            Err(Error::State(_))
        ));
        runtime.stop();
        assert_eq!(runtime.state(), ServerState::Stopping);
    }

    struct Counting {
        started: AtomicUsize,
        stopped: AtomicUsize,
        events: AtomicUsize,
        ticks: AtomicUsize,
    }

    impl Service for Counting {
        fn on_event(self: &Arc<Self>, _event: SocketEvent, _worker: &mut WorkerData) -> Result<()> {
            self.events.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_tick(&self, _worker: &mut WorkerData) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }

        fn on_worker_start(&self, _worker: &mut WorkerData) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        fn on_worker_stop(&self, _worker: &mut WorkerData) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting() -> Arc<Counting> {
        Arc::new(Counting {
            started: AtomicUsize::new(0),
            stopped: AtomicUsize::new(0),
            events: AtomicUsize::new(0),
            ticks: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_run_and_stop_with_workers() {
        let listener = Arc::new(EventListener::new(BackendKind::Auto, 16).unwrap());
        let runtime = Arc::new(Runtime::new(listener, 4, 8));
        let service = counting();

        let socket = Socket::bind_datagram("127.0.0.1:0".parse().unwrap()).unwrap();
        runtime.listener().add(&socket, Interest::READABLE).unwrap();

        let handle = {
            let runtime = Arc::clone(&runtime);
            let service = Arc::clone(&service);
            std::thread::spawn(move || runtime.run(service))
        };

        let sender = Socket::bind_datagram("127.0.0.1:0".parse().unwrap()).unwrap();
        sender.send_to(b"x", socket.local_addr().unwrap()).unwrap();
        for _ in 0..200 {
            if service.events.load(Ordering::SeqCst) > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        runtime.stop();
        handle.join().unwrap().unwrap();

        assert_eq!(runtime.state(), ServerState::Stopped);
        assert_eq!(service.events.load(Ordering::SeqCst), 1);
        assert_eq!(service.started.load(Ordering::SeqCst), 4);
        assert_eq!(service.stopped.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_zero_threads_runs_inline() {
        let listener = Arc::new(EventListener::new(BackendKind::Portable, 4).unwrap());
        let runtime = Arc::new(Runtime::new(listener, 0, 8));
        let service = counting();

        let stopper = {
            let runtime = Arc::clone(&runtime);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                runtime.stop();
            })
        };
        runtime.run(Arc::clone(&service)).unwrap();
        stopper.join().unwrap();

        assert_eq!(service.started.load(Ordering::SeqCst), 1);
        assert_eq!(service.stopped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_tick_runs_without_events() {
        let listener = Arc::new(EventListener::new(BackendKind::Auto, 4).unwrap());
        let mut runtime = Runtime::new(listener, 2, 8);
        runtime.set_tick(Some(Duration::from_millis(10)));
        let runtime = Arc::new(runtime);
        let service = counting();

        let stopper = {
            let runtime = Arc::clone(&runtime);
            let service = Arc::clone(&service);
            std::thread::spawn(move || {
                for _ in 0..500 {
                    if service.ticks.load(Ordering::SeqCst) >= 4 {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                runtime.stop();
            })
        };
        runtime.run(Arc::clone(&service)).unwrap();
        stopper.join().unwrap();

        assert!(service.ticks.load(Ordering::SeqCst) >= 4);
        assert_eq!(service.events.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stop_before_run() {
        let listener = Arc::new(EventListener::new(BackendKind::Portable, 4).unwrap());
        let runtime = Runtime::new(listener, 2, 8);
        runtime.stop();
        assert!(matches!(runtime.run(counting()), Err(Error::State(_))));
    }
}
