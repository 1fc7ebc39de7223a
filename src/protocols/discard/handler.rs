//! Per-connection handler for the discard protocol.

use super::text::TextDecoder;
use crate::config::Mode;
use crate::error::ConnectionError;
use bytes::BytesMut;
use std::net::SocketAddr;
use tracing::{debug, info, warn};

/// Written once to every peer in greeting mode.
pub const GREETING: &[u8] = b"Netty rocks!";

/// Lifecycle phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Accepted, not yet registered for I/O.
    Created,
    /// Registered; receiving data events.
    Active,
    /// Terminal.
    Closed,
}

/// State for exactly one accepted connection.
///
/// Events arrive in order from the single worker that owns the connection,
/// so the handler needs no synchronization.
#[derive(Debug)]
pub struct ConnectionHandler {
    conn_id: usize,
    peer: SocketAddr,
    mode: Mode,
    phase: Phase,
    decoder: Option<TextDecoder>,
    discarded: u64,
}

impl ConnectionHandler {
    pub fn new(conn_id: usize, peer: SocketAddr, mode: Mode) -> Self {
        Self {
            conn_id,
            peer,
            mode,
            phase: Phase::Created,
            decoder: None,
            discarded: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Bytes received and dropped so far.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// The connection was registered for I/O.
    ///
    /// In greeting mode the greeting is queued on `outbound`; the caller
    /// flushes it without waiting for any acknowledgment.
    pub fn on_active(&mut self, outbound: &mut BytesMut) {
        if self.phase != Phase::Created {
            return;
        }
        self.phase = Phase::Active;

        if self.mode == Mode::Greeting {
            outbound.extend_from_slice(GREETING);
            self.decoder = Some(TextDecoder::new());
        }
    }

    /// One inbound chunk. Chunk boundaries carry no meaning.
    ///
    /// The chunk is borrowed; the caller owns and releases its buffer.
    pub fn on_data(&mut self, chunk: &[u8]) -> Result<(), ConnectionError> {
        if self.phase != Phase::Active {
            return Ok(());
        }
        self.discarded += chunk.len() as u64;

        if let Some(decoder) = self.decoder.as_mut() {
            let text = decoder.decode(chunk)?;
            if !text.is_empty() {
                info!(conn_id = self.conn_id, peer = %self.peer, text = %text, "Received text");
            }
        }
        Ok(())
    }

    /// An I/O or processing fault. Delegates to [`handle_connection_error`];
    /// the caller must close the connection afterwards.
    ///
    /// Only the first error on a connection is reported.
    pub fn on_error(&mut self, cause: &ConnectionError) {
        if self.phase == Phase::Closed {
            return;
        }
        handle_connection_error(self.conn_id, self.peer, cause);
    }

    /// The connection is gone. Drops all per-connection state.
    pub fn on_closed(&mut self) {
        if self.phase == Phase::Closed {
            return;
        }
        self.phase = Phase::Closed;

        if let Some(decoder) = self.decoder.take() {
            if decoder.pending() > 0 {
                debug!(
                    conn_id = self.conn_id,
                    pending = decoder.pending(),
                    "Dropping incomplete trailing character"
                );
            }
        }
    }
}

/// Policy for every per-connection fault: log it. The connection is always
/// closed by the caller; the error never reaches other connections.
pub fn handle_connection_error(conn_id: usize, peer: SocketAddr, cause: &ConnectionError) {
    if cause.is_disconnect() {
        debug!(conn_id, peer = %peer, error = %cause, "Connection dropped");
    } else {
        warn!(conn_id, peer = %peer, error = %cause, "Connection error, closing");
    }
}
