//! discard-server: accepts TCP connections and discards everything received.
//!
//! Features:
//! - Dedicated acceptor thread, fixed pool of worker event loops
//! - Configurable backlog and keep-alive
//! - Optional greeting mode that logs inbound text
//! - Graceful two-phase shutdown on Ctrl-C
//! - Configuration via CLI arguments or TOML file

use discard_server::{Config, Server};
use std::process::ExitCode;
use std::thread;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        backlog = config.backlog,
        keepalive = config.keepalive,
        mode = ?config.mode,
        "Starting discard server"
    );

    let server = match Server::start(&config) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Failed to start server");
            return ExitCode::FAILURE;
        }
    };

    let stop = server.stop_handle();
    let signals = thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!(error = %e, "Failed to build signal runtime");
                    return;
                }
            };
            match runtime.block_on(tokio::signal::ctrl_c()) {
                Ok(()) => info!("Received Ctrl-C, shutting down"),
                Err(e) => error!(error = %e, "Failed to listen for Ctrl-C"),
            }
            stop.stop();
        });

    if let Err(e) = signals {
        error!(error = %e, "Failed to spawn signal thread");
        server.stop();
        return ExitCode::FAILURE;
    }

    let stats = server.wait();
    info!(
        accepted = stats.accepted,
        errors = stats.errors,
        bytes_discarded = stats.bytes_discarded,
        "Shutdown complete"
    );
    ExitCode::SUCCESS
}
