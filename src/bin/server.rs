use clap::{Parser, ValueEnum};
use std::sync::Arc;
use strand_server::{
    BackendKind, Config, DatagramContext, DatagramServer, Message, Request, Response, Server,
    WebSocketHandler, WorkerData, WsContext,
};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    Auto,
    Epoll,
    Portable,
}

impl From<Backend> for BackendKind {
    fn from(backend: Backend) -> Self {
        match backend {
            Backend::Auto => BackendKind::Auto,
            Backend::Epoll => BackendKind::Epoll,
            Backend::Portable => BackendKind::Portable,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Bind address
    #[arg(short, long, default_value = "127.0.0.1")]
    bind: String,

    /// Number of worker threads (0 runs on the main thread)
    #[arg(short = 't', long)]
    threads: Option<usize>,

    /// Accept backlog
    #[arg(long, default_value_t = 1024)]
    backlog: u32,

    /// Event listener backend
    #[arg(long, value_enum, default_value_t = Backend::Auto)]
    backend: Backend,

    /// Serve UDP echo instead of HTTP/WebSocket
    #[arg(long)]
    udp: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Echoes every data message back to its sender
struct Echo;

impl WebSocketHandler for Echo {
    fn on_connect(&self, ctx: &mut WsContext<'_>) {
        info!(id = ctx.id(), peer = ?ctx.peer_addr(), "websocket connected");
    }

    fn on_message(&self, ctx: &mut WsContext<'_>, message: Message) {
        if message.kind().is_control() {
            return;
        }
        if let Err(e) = ctx.send(message) {
            warn!(id = ctx.id(), error = %e, "echo failed");
        }
    }

    fn on_close(&self, id: u64, code: Option<u16>) {
        info!(id, ?code, "websocket closed");
    }
}

fn hello(request: &Request, worker: &mut WorkerData) -> Response {
    match request.path.as_str() {
        "/" => Response::ok(format!("hello from worker {}\n", worker.worker_id()))
            .with_header("Content-Type", "text/plain"),
        _ => Response::not_found(),
    }
}

fn udp_echo(ctx: &mut DatagramContext<'_>, data: &[u8]) {
    if let Err(e) = ctx.reply(data) {
        warn!(peer = %ctx.peer(), error = %e, "datagram reply failed");
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };
    tracing_subscriber::fmt()
        .with_env_filter(format!("strand_server={}", log_level))
        .init();

    let config = if let Some(config_path) = args.config {
        Config::from_file(&config_path)?
    } else {
        let defaults = Config::default();
        Config {
            bind_addr: args.bind,
            port: args.port,
            threads: args.threads.unwrap_or(defaults.threads),
            backlog: args.backlog,
            backend: args.backend.into(),
            ..defaults
        }
    };

    info!(
        "Starting Strand Server v{} on {}:{} with {} worker threads",
        env!("CARGO_PKG_VERSION"),
        config.bind_addr,
        config.port,
        config.threads
    );

    let result = if args.udp {
        let server = Arc::new(DatagramServer::new(config, udp_echo)?);
        let server_clone = Arc::clone(&server);
        ctrlc::set_handler(move || {
            info!("Received shutdown signal, shutting down gracefully...");
            server_clone.stop();
        })?;
        server.run()
    } else {
        let server = Arc::new(
            Server::new(config)?
                .with_http_handler(hello)
                .with_websocket_handler(Echo)
                .on_ready(|bound| {
                    info!(
                        addr = %bound.addr,
                        threads = bound.threads,
                        backend = bound.backend,
                        "ready"
                    )
                }),
        );
        let server_clone = Arc::clone(&server);
        ctrlc::set_handler(move || {
            info!("Received shutdown signal, shutting down gracefully...");
            server_clone.stop();
        })?;
        server.run()
    };

    if let Err(e) = result {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}
