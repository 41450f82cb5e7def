//! arena-echo: a bounded-concurrency TCP echo server
//!
//! Every byte chunk a client sends is written straight back to it.
//!
//! Features:
//! - Fixed buffer arena sliced once at startup, no per-connection allocation
//! - Reusable I/O contexts bounding outstanding operations
//! - Admission gate capping concurrently connected clients
//! - Configuration via CLI arguments or TOML file

mod config;
mod runtime;
mod server;

use config::Config;
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        max_connections = config.max_connections,
        receive_buffer_size = config.receive_buffer_size,
        backlog = config.backlog,
        workers = ?config.workers,
        "Starting arena-echo server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build()?;

    let listen = config.listen;
    let mut server = Server::new(config);
    server.init();

    runtime.block_on(server.start(listen))?;

    let stats = server.stats();
    info!(
        total_bytes_read = stats.total_bytes_read,
        connected = stats.connected_clients,
        "Server stopped"
    );
    Ok(())
}
