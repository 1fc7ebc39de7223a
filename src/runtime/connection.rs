//! Per-worker connection state.
//!
//! Each connection owns its socket, its handler and any bytes still
//! waiting to be written. Nothing here is shared across workers.

use crate::error::ConnectionError;
use crate::protocols::discard::ConnectionHandler;
use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::Interest;
use slab::Slab;
use std::io::{self, Write};
use std::net::SocketAddr;
use tracing::debug;

/// A single client connection.
pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub handler: ConnectionHandler,
    /// Bytes queued by the handler and not yet accepted by the socket.
    pub outbound: BytesMut,
    /// Interest currently registered with the poller.
    pub interest: Interest,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, handler: ConnectionHandler) -> Self {
        Self {
            stream,
            peer,
            handler,
            outbound: BytesMut::new(),
            interest: Interest::READABLE,
        }
    }

    /// Interest this connection needs given its pending output.
    pub fn desired_interest(&self) -> Interest {
        if self.outbound.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        }
    }

    /// Write as much queued output as the socket takes without blocking.
    pub fn flush(&mut self) -> Result<(), ConnectionError> {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0").into())
                }
                Ok(n) => self.outbound.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Last write attempt before the connection is dropped after the peer
    /// closed. Whatever the socket does not take is lost.
    pub fn finish(&mut self) {
        if self.outbound.is_empty() {
            return;
        }
        if let Err(e) = self.flush() {
            debug!(peer = %self.peer, error = %e, "Dropping unsent output");
        } else if !self.outbound.is_empty() {
            debug!(peer = %self.peer, pending = self.outbound.len(), "Dropping unsent output");
        }
    }
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations. Slab keys double
/// as poll tokens.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    /// Key the next inserted connection will get, or `None` at capacity.
    pub fn next_id(&self) -> Option<usize> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        Some(self.connections.vacant_key())
    }

    /// Insert a connection, returning its key.
    pub fn insert(&mut self, conn: Connection) -> usize {
        self.connections.insert(conn)
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<Connection> {
        self.connections.try_remove(id)
    }

    /// Keys of all open connections.
    pub fn ids(&self) -> Vec<usize> {
        self.connections.iter().map(|(id, _)| id).collect()
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;
    use std::io::Read;

    fn pair() -> (TcpStream, std::net::TcpStream, SocketAddr) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (TcpStream::from_std(server), client, peer)
    }

    #[test]
    fn test_registry_capacity() {
        let mut registry = ConnectionRegistry::new(1);
        let (stream, _client, peer) = pair();

        let id = registry.next_id().unwrap();
        let handler = ConnectionHandler::new(id, peer, Mode::Discard);
        assert_eq!(registry.insert(Connection::new(stream, peer, handler)), id);

        // At capacity
        assert!(registry.next_id().is_none());
        assert_eq!(registry.ids(), vec![id]);

        assert!(registry.remove(id).is_some());
        assert!(registry.remove(id).is_none());
        assert!(registry.is_empty());
        assert!(registry.next_id().is_some());
    }

    #[test]
    fn test_flush_and_interest() {
        let (stream, mut client, peer) = pair();
        let handler = ConnectionHandler::new(0, peer, Mode::Greeting);
        let mut conn = Connection::new(stream, peer, handler);

        assert_eq!(conn.desired_interest(), Interest::READABLE);

        conn.outbound.extend_from_slice(b"hi");
        assert_eq!(
            conn.desired_interest(),
            Interest::READABLE | Interest::WRITABLE
        );

        conn.flush().unwrap();
        assert!(conn.outbound.is_empty());

        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn test_finish_writes_pending_output() {
        let (stream, mut client, peer) = pair();
        let handler = ConnectionHandler::new(0, peer, Mode::Greeting);
        let mut conn = Connection::new(stream, peer, handler);

        client.shutdown(std::net::Shutdown::Write).unwrap();
        conn.outbound.extend_from_slice(b"bye");
        conn.finish();
        assert!(conn.outbound.is_empty());
        drop(conn);

        let mut received = Vec::new();
        client.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"bye");
    }
}
