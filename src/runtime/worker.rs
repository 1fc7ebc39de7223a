//! Worker event loop.
//!
//! Readiness-based model: each worker owns a mio `Poll` (epoll on Linux,
//! kqueue on macOS) and the connections pinned to it. The acceptor hands
//! sockets over through a channel and wakes the worker with a `Waker`.
//! A connection's events are only ever handled on its worker's thread,
//! one at a time, in arrival order.

use crate::config::{Config, Mode};
use crate::error::ConnectionError;
use crate::protocols::discard::ConnectionHandler;
use crate::runtime::buffer::{receive_chunk, BufferPool, Received};
use crate::runtime::connection::{Connection, ConnectionRegistry};
use crate::runtime::stats::ServerStats;
use mio::event::Event;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const WAKER_TOKEN: Token = Token(usize::MAX);

/// Reads complete one at a time on a worker, so a couple of buffers suffice.
const POOL_BUFFERS: usize = 2;

/// Messages from the acceptor to a worker.
enum Command {
    /// Take ownership of an accepted socket.
    Register { stream: TcpStream, peer: SocketAddr },
    /// Stop admitting connections and drain.
    Shutdown,
}

/// Acceptor-side handle to a running worker.
struct WorkerHandle {
    id: usize,
    tx: Sender<Command>,
    waker: Arc<Waker>,
    thread: JoinHandle<()>,
    /// Set once a send found the worker's mailbox closed.
    exited: bool,
}

impl WorkerHandle {
    /// Queue a command and wake the worker. Hands the command back if the
    /// worker thread has already exited.
    fn send(&self, command: Command) -> Result<(), Command> {
        self.tx
            .send(command)
            .map_err(|mpsc::SendError(command)| command)?;
        if let Err(e) = self.waker.wake() {
            error!(worker = self.id, error = %e, "Failed to wake worker");
        }
        Ok(())
    }

    /// Wait for the worker thread to finish.
    fn join(self) {
        if self.thread.join().is_err() {
            error!(worker = self.id, "Worker panicked");
        }
    }
}

/// The fixed set of workers behind one listener.
///
/// Dropping the group is the second shutdown phase: every worker is told to
/// drain, then joined.
pub(crate) struct WorkerGroup {
    workers: Vec<WorkerHandle>,
    next: usize,
}

impl WorkerGroup {
    /// Start `config.worker_count()` workers. Workers already started are
    /// stopped again if a later one fails to spawn.
    pub(crate) fn spawn(config: &Config, stats: &Arc<ServerStats>) -> io::Result<Self> {
        let count = config.worker_count();
        let mut group = WorkerGroup {
            workers: Vec::with_capacity(count),
            next: 0,
        };
        for id in 0..count {
            group.workers.push(spawn(id, config, Arc::clone(stats))?);
        }
        Ok(group)
    }

    pub(crate) fn len(&self) -> usize {
        self.workers.len()
    }

    /// Hand a connection to the next live worker, round-robin.
    ///
    /// A worker whose mailbox is closed is skipped from then on. Fails with
    /// `BrokenPipe` once no worker is left; the stream is dropped.
    pub(crate) fn dispatch(&mut self, stream: TcpStream, peer: SocketAddr) -> io::Result<usize> {
        let mut command = Command::Register { stream, peer };
        for _ in 0..self.workers.len() {
            let idx = self.next % self.workers.len();
            self.next = self.next.wrapping_add(1);

            let worker = &mut self.workers[idx];
            if worker.exited {
                continue;
            }
            match worker.send(command) {
                Ok(()) => return Ok(worker.id),
                Err(returned) => {
                    warn!(worker = worker.id, peer = %peer, "Worker has exited, skipping it");
                    worker.exited = true;
                    command = returned;
                }
            }
        }
        Err(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "all workers have exited",
        ))
    }
}

impl Drop for WorkerGroup {
    fn drop(&mut self) {
        for worker in &self.workers {
            // A worker that already exited has nothing left to drain.
            let _ = worker.send(Command::Shutdown);
        }
        for worker in self.workers.drain(..) {
            worker.join();
        }
    }
}

/// Start a worker thread.
fn spawn(id: usize, config: &Config, stats: Arc<ServerStats>) -> io::Result<WorkerHandle> {
    let poll = Poll::new()?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
    let (tx, rx) = mpsc::channel();

    let worker = Worker {
        id,
        poll,
        rx,
        connections: ConnectionRegistry::new(config.max_connections),
        buffers: BufferPool::new(POOL_BUFFERS, config.buffer_size),
        stats,
        mode: config.mode,
        grace: config.shutdown_grace,
        drain_deadline: None,
    };
    let batch_size = config.batch_size;

    let thread = thread::Builder::new()
        .name(format!("worker-{id}"))
        .spawn(move || {
            if let Err(e) = worker.run(batch_size) {
                error!(worker = id, error = %e, "Worker failed");
            }
        })?;

    Ok(WorkerHandle {
        id,
        tx,
        waker,
        thread,
        exited: false,
    })
}

struct Worker {
    id: usize,
    poll: Poll,
    rx: Receiver<Command>,
    connections: ConnectionRegistry,
    buffers: BufferPool,
    stats: Arc<ServerStats>,
    mode: Mode,
    grace: Duration,
    /// Set once shutdown begins.
    drain_deadline: Option<Instant>,
}

impl Worker {
    fn run(mut self, batch_size: usize) -> io::Result<()> {
        let mut events = Events::with_capacity(batch_size);
        debug!(worker = self.id, "Worker started");

        let result = loop {
            let timeout = self
                .drain_deadline
                .map(|deadline| deadline.saturating_duration_since(Instant::now()));

            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                break Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => self.drain_mailbox(),
                    Token(conn_id) => self.handle_event(conn_id, event),
                }
            }

            if let Some(deadline) = self.drain_deadline {
                if self.connections.is_empty() || Instant::now() >= deadline {
                    break Ok(());
                }
            }
        };

        // Whatever is still open is closed here, on success and on failure.
        let remaining = self.connections.len();
        if remaining > 0 {
            info!(worker = self.id, connections = remaining, "Force-closing connections");
        }
        for conn_id in self.connections.ids() {
            self.close_connection(conn_id);
        }

        debug!(worker = self.id, "Worker stopped");
        result
    }

    fn drain_mailbox(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(Command::Register { stream, peer }) => self.register(stream, peer),
                Ok(Command::Shutdown) => self.begin_shutdown(),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.begin_shutdown();
                    break;
                }
            }
        }
    }

    fn begin_shutdown(&mut self) {
        if self.drain_deadline.is_none() {
            debug!(
                worker = self.id,
                connections = self.connections.len(),
                grace_ms = self.grace.as_millis() as u64,
                "Worker draining"
            );
            self.drain_deadline = Some(Instant::now() + self.grace);
        }
    }

    /// Attach a handler to a freshly accepted socket before any read.
    fn register(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        if self.drain_deadline.is_some() {
            debug!(worker = self.id, peer = %peer, "Worker draining, dropping connection");
            self.stats.on_rejected();
            return;
        }

        let conn_id = match self.connections.next_id() {
            Some(id) => id,
            None => {
                warn!(worker = self.id, peer = %peer, "Connection limit reached");
                self.stats.on_rejected();
                return;
            }
        };

        let handler = ConnectionHandler::new(conn_id, peer, self.mode);

        if let Err(e) = self
            .poll
            .registry()
            .register(&mut stream, Token(conn_id), Interest::READABLE)
        {
            warn!(worker = self.id, peer = %peer, error = %e, "Failed to register connection");
            self.stats.on_rejected();
            return;
        }

        let mut conn = Connection::new(stream, peer, handler);
        conn.handler.on_active(&mut conn.outbound);
        self.connections.insert(conn);
        self.stats.on_accepted();

        debug!(worker = self.id, conn_id, peer = %peer, "Accepted connection");

        if let Err(e) = self.update_interest(conn_id) {
            self.fail_connection(conn_id, e);
        }
    }

    fn handle_event(&mut self, conn_id: usize, event: &Event) {
        match self.process_event(conn_id, event) {
            Ok(true) => {}
            Ok(false) => self.close_connection(conn_id),
            Err(e) => self.fail_connection(conn_id, e),
        }
    }

    /// Returns `Ok(false)` once the peer has closed.
    fn process_event(&mut self, conn_id: usize, event: &Event) -> Result<bool, ConnectionError> {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            // Stale event for a connection closed earlier in this batch.
            return Ok(true);
        };

        if event.is_error() {
            return Err(match conn.stream.take_error()? {
                Some(e) => e.into(),
                None => ConnectionError::Reset,
            });
        }

        if event.is_writable() {
            conn.flush()?;
        }

        if event.is_readable() || event.is_read_closed() {
            let Connection {
                stream, handler, ..
            } = &mut *conn;
            let peer_closed = loop {
                let received = receive_chunk(
                    &mut self.buffers,
                    |buf| stream.read(buf),
                    |chunk| handler.on_data(chunk),
                )?;
                match received {
                    Received::Chunk(n) => self.stats.on_discarded(n),
                    Received::WouldBlock => break false,
                    Received::Eof => break true,
                }
            };
            if peer_closed {
                conn.finish();
                return Ok(false);
            }
        }

        self.update_interest(conn_id)?;
        Ok(true)
    }

    fn update_interest(&mut self, conn_id: usize) -> Result<(), ConnectionError> {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return Ok(());
        };
        let desired = conn.desired_interest();
        if desired != conn.interest {
            self.poll
                .registry()
                .reregister(&mut conn.stream, Token(conn_id), desired)?;
            conn.interest = desired;
        }
        Ok(())
    }

    fn fail_connection(&mut self, conn_id: usize, cause: ConnectionError) {
        if let Some(conn) = self.connections.get_mut(conn_id) {
            conn.handler.on_error(&cause);
            self.stats.on_error();
        }
        self.close_connection(conn_id);
    }

    fn close_connection(&mut self, conn_id: usize) {
        if let Some(mut conn) = self.connections.remove(conn_id) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            conn.handler.on_closed();
            self.stats.on_closed();

            debug!(
                worker = self.id,
                conn_id,
                peer = %conn.peer,
                discarded = conn.handler.discarded(),
                "Connection closed"
            );
        }
    }
}
