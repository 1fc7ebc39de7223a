//! Network runtime: one acceptor thread plus a fixed pool of worker threads.
//!
//! - `Listener`: owns the listening socket, accepts, hands off round-robin
//! - `worker`: per-thread mio event loop owning its connections
//! - `BufferPool`: per-worker read buffers released by scope
//! - `ConnectionRegistry`: slab of a worker's open connections
//!
//! Shutdown is two-phase: the acceptor closes the listening socket first,
//! then every worker drains and closes its connections.

mod acceptor;
pub mod buffer;
mod connection;
mod stats;
mod worker;

pub use acceptor::Listener;
pub use buffer::{receive_chunk, BufferPool, Lease, Received};
pub use stats::{ServerStats, StatsSnapshot};

use crate::config::Config;
use crate::error::ServerError;
use acceptor::{StopFlag, WAKER_TOKEN};
use mio::{Poll, Waker};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info};
use worker::WorkerGroup;

/// Signals a running [`Server`] to stop. Cheap to clone and `Send`.
#[derive(Clone)]
pub struct StopHandle {
    flag: Arc<StopFlag>,
    waker: Arc<Waker>,
}

impl StopHandle {
    /// Ask the acceptor to close the listening socket and the workers to
    /// drain. Returns immediately; calls after the first do nothing.
    pub fn stop(&self) {
        if self.flag.raise() {
            if let Err(e) = self.waker.wake() {
                error!(error = %e, "Failed to wake acceptor");
            }
        }
    }
}

/// A running discard server.
pub struct Server {
    addr: SocketAddr,
    stop: StopHandle,
    stats: Arc<ServerStats>,
    acceptor: Option<JoinHandle<()>>,
}

impl Server {
    /// Bind the listening socket and start the acceptor and workers.
    ///
    /// A bind failure is returned before any thread is started.
    pub fn start(config: &Config) -> Result<Self, ServerError> {
        let listener = Listener::bind(config)?;
        let addr = listener.local_addr();

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let flag = Arc::new(StopFlag::default());
        let stats = Arc::new(ServerStats::default());

        // Dropping the group stops its workers, including when the acceptor
        // thread below fails to spawn.
        let mut workers = WorkerGroup::spawn(config, &stats)?;

        info!(
            addr = %addr,
            workers = workers.len(),
            mode = ?config.mode,
            "Server started"
        );

        let acceptor_flag = Arc::clone(&flag);
        let acceptor = thread::Builder::new()
            .name("acceptor".to_string())
            .spawn(move || {
                if let Err(e) = listener.run(poll, &mut workers, &acceptor_flag) {
                    error!(error = %e, "Acceptor failed");
                }
                drop(workers);
                info!("Server stopped");
            })?;

        Ok(Self {
            addr,
            stop: StopHandle { flag, waker },
            stats,
            acceptor: Some(acceptor),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Block until the listening socket is closed and every worker has
    /// drained. Returns the final counters.
    pub fn wait(mut self) -> StatsSnapshot {
        self.join();
        self.stats.snapshot()
    }

    /// Stop accepting, drain workers, and block until everything is released.
    pub fn stop(mut self) -> StatsSnapshot {
        self.stop.stop();
        self.join();
        self.stats.snapshot()
    }

    fn join(&mut self) {
        if let Some(acceptor) = self.acceptor.take() {
            if acceptor.join().is_err() {
                error!("Acceptor panicked");
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.acceptor.is_some() {
            self.stop.stop();
            self.join();
        }
    }
}
