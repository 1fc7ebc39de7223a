//! Error types for the discard server.
//!
//! Startup failures (`ServerError`) are fatal and reported to the operator.
//! Per-connection failures (`ConnectionError`) only ever close the affected
//! connection.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Fatal server-level errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listening socket could not be bound (port in use, no privilege).
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The configured listen address does not parse.
    #[error("invalid listen address '{0}'")]
    InvalidAddress(String),

    /// Runtime setup failure (poll creation, thread spawn).
    #[error("runtime error: {0}")]
    Io(#[from] io::Error),
}

impl ServerError {
    /// True for `Bind` errors.
    pub fn is_bind(&self) -> bool {
        matches!(self, ServerError::Bind { .. })
    }
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}", path = .path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file '{path}': {source}", path = .path.display())]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Faults on a single established connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Underlying socket I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Peer reset or aborted the connection.
    #[error("connection reset by peer")]
    Reset,

    /// Inbound bytes were not valid UTF-8 (greeting mode only).
    #[error("invalid utf-8 in inbound data at byte {offset}")]
    Decode { offset: usize },

    /// The receive handler panicked while inspecting a chunk.
    #[error("handler panicked: {0}")]
    HandlerPanic(String),

    /// No read buffer was available in the worker's pool.
    #[error("buffer pool exhausted")]
    PoolExhausted,
}

impl ConnectionError {
    /// Errors that are a normal part of peers going away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ConnectionError::Reset => true,
            ConnectionError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
