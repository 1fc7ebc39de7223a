//! Listening socket and accept loop.
//!
//! The acceptor runs on its own thread and does nothing but accept: every
//! new socket is configured and handed to a worker, round-robin. Once no
//! worker is left to take connections the acceptor stops.

use crate::config::Config;
use crate::error::ServerError;
use crate::runtime::worker::WorkerGroup;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(0);
pub(crate) const WAKER_TOKEN: Token = Token(1);

/// Set by `stop()`; checked by the accept loop after each wakeup.
#[derive(Debug, Default)]
pub(crate) struct StopFlag(AtomicBool);

impl StopFlag {
    /// Returns `true` the first time it is called.
    pub(crate) fn raise(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A bound, listening TCP socket.
pub struct Listener {
    listener: TcpListener,
    addr: SocketAddr,
    keepalive: bool,
}

impl Listener {
    /// Bind and listen on the configured address.
    ///
    /// `SO_REUSEADDR` is set so restarts are not blocked by `TIME_WAIT`, but
    /// `SO_REUSEPORT` is not: binding a port something already listens on
    /// fails with [`ServerError::Bind`].
    pub fn bind(config: &Config) -> Result<Self, ServerError> {
        let addr = config.listen_addr()?;
        let bind_err = |source: io::Error| ServerError::Bind { addr, source };

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(bind_err)?;
        socket.set_reuse_address(true).map_err(bind_err)?;
        socket.set_nonblocking(true).map_err(bind_err)?;
        socket.bind(&addr.into()).map_err(bind_err)?;
        // Validated to fit in i32 by Config::validate.
        let backlog = i32::try_from(config.backlog).unwrap_or(i32::MAX);
        socket.listen(backlog).map_err(bind_err)?;

        let listener = TcpListener::from_std(socket.into());
        let addr = listener.local_addr().map_err(bind_err)?;

        info!(addr = %addr, backlog, keepalive = config.keepalive, "Listening");

        Ok(Self {
            listener,
            addr,
            keepalive: config.keepalive,
        })
    }

    /// Address actually bound (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Accept until `stop` is raised, then close the listening socket.
    ///
    /// `poll` must have the stop waker registered under [`WAKER_TOKEN`].
    /// Fails early if every worker has exited.
    pub(crate) fn run(
        mut self,
        mut poll: Poll,
        workers: &mut WorkerGroup,
        stop: &StopFlag,
    ) -> io::Result<()> {
        poll.registry()
            .register(&mut self.listener, LISTENER_TOKEN, Interest::READABLE)?;

        let mut events = Events::with_capacity(64);

        while !stop.is_raised() {
            if let Err(e) = poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                if event.token() == LISTENER_TOKEN && !stop.is_raised() {
                    self.accept_ready(workers)?;
                }
            }
        }

        poll.registry().deregister(&mut self.listener)?;
        info!(addr = %self.addr, "Listener closed");
        Ok(())
    }

    fn accept_ready(&self, workers: &mut WorkerGroup) -> io::Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = self.configure(&stream) {
                        warn!(peer = %peer, error = %e, "Failed to configure socket");
                        continue;
                    }
                    let worker = workers.dispatch(stream, peer)?;
                    debug!(peer = %peer, worker, "Handed off connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    return Ok(());
                }
            }
        }
    }

    fn configure(&self, stream: &mio::net::TcpStream) -> io::Result<()> {
        stream.set_nodelay(true)?;
        SockRef::from(stream).set_keepalive(self.keepalive)
    }
}
