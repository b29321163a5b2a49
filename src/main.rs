//! line-server: random-access line retrieval over TCP
//!
//! On startup the source file is scanned once and a fixed-width
//! offset/length index is written next to it, so any line can then be
//! served with two seeks. Clients speak a CRLF line protocol:
//! - `GET <n>`: returns line `n` (1-based) or `ERR`
//! - `QUIT`: closes the connection
//! - `SHUTDOWN`: closes the connection and stops the server once every
//!   open connection has drained

mod config;
mod index;
mod protocol;
mod server;
mod shutdown;
mod store;

use config::Config;
use server::{Server, ServerOptions};
use std::process::ExitCode;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Logging may not be initialized yet
            eprintln!("line-server: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
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
        source = %config.source_file.display(),
        host = %config.host,
        port = config.port,
        max_clients = ?config.max_clients,
        workers = ?config.workers,
        "Starting line-server"
    );

    // Indexing failures are fatal: no listener is started
    let session = index::build_index_with(&config.source_file, &config.index_options())?;

    let listener = server::bind_listener(config.listen_addr()?)?;
    let runtime = build_runtime(config.workers)?;

    runtime.block_on(async {
        let listener = TcpListener::from_std(listener)?;
        let server = Server::new(session, ServerOptions::from(&config));
        server.serve(listener).await;
        Ok::<_, std::io::Error>(())
    })?;

    info!("Server shut down");
    Ok(())
}

/// Build the multi-threaded runtime that runs the listener and handlers.
fn build_runtime(workers: Option<usize>) -> std::io::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = workers.filter(|&n| n > 0) {
        builder.worker_threads(workers);
    }
    builder.thread_name("line-server-worker").enable_all().build()
}
