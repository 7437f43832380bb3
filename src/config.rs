use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

/// Readiness backend used by the event listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// epoll on Linux, portable everywhere else
    #[default]
    Auto,
    /// Native epoll with one-shot registrations (Linux only)
    Epoll,
    /// mio-based backend with one-shot enforced in software
    Portable,
}

/// TLS material for the transport layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ciphers: Option<String>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bind address
    pub bind_addr: String,

    /// Port to listen on (0 picks an ephemeral port)
    pub port: u16,

    /// Accept backlog depth
    pub backlog: u32,

    /// Number of worker threads (0 runs the reactor on the calling thread)
    pub threads: usize,

    /// Maximum events returned by a single listener wait
    pub max_events: usize,

    /// Maximum sockets tracked by the listener, acceptor included
    pub max_registrations: usize,

    /// Initial per-connection buffer size
    pub connection_buffer_size: usize,

    /// TCP nodelay
    pub tcp_nodelay: bool,

    /// Unsent bytes a connection may hold before it stops reading
    pub max_pending_writes: usize,

    /// How long a server-initiated WebSocket close waits for the peer
    pub close_timeout_ms: u64,

    /// Largest reassembled WebSocket message accepted
    pub max_message_size: usize,

    /// Reject payload lengths that are not minimally encoded
    pub strict_length_encoding: bool,

    /// Listener backend
    pub backend: BackendKind,

    /// Pin each worker to a CPU (Linux only)
    pub pin_workers: bool,

    /// Log level
    pub log_level: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port: 8080,
            backlog: 1024,
            threads: num_cpus::get(),
            max_events: 256,
            max_registrations: 65536,
            connection_buffer_size: 16 * 1024, // 16KB
            tcp_nodelay: true,
            max_pending_writes: 1024 * 1024, // 1MB
            close_timeout_ms: 5000,
            max_message_size: 16 * 1024 * 1024,
            strict_length_encoding: false,
            backend: BackendKind::Auto,
            pin_workers: false,
            log_level: "info".to_string(),
            tls: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Example
    ///
    /// ```no_run
    /// use strand_server::Config;
    ///
    /// # fn main() -> anyhow::Result<()> {
    /// let config = Config::from_file("config.toml")?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_events == 0 {
            anyhow::bail!("max_events must be > 0");
        }

        if self.max_registrations < 2 {
            anyhow::bail!("max_registrations must leave room for at least one connection");
        }

        if self.backlog == 0 {
            anyhow::bail!("backlog must be > 0");
        }

        if self.connection_buffer_size < 1024 {
            anyhow::bail!("connection_buffer_size must be >= 1024");
        }

        if self.max_pending_writes < self.connection_buffer_size {
            anyhow::bail!("max_pending_writes must be >= connection_buffer_size");
        }

        if self.close_timeout_ms == 0 {
            anyhow::bail!("close_timeout_ms must be > 0");
        }

        if self.max_message_size == 0 {
            anyhow::bail!("max_message_size must be > 0");
        }

        if let Some(tls) = &self.tls {
            if tls.cert_path.is_empty() || tls.key_path.is_empty() {
                anyhow::bail!("tls requires both cert_path and key_path");
            }
        }

        self.socket_addr()?;
        Ok(())
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Resolve `bind_addr:port` to the first matching socket address
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        (self.bind_addr.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| anyhow::anyhow!("bind address {} did not resolve", self.bind_addr))
    }
}
