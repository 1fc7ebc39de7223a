//! discard-server: a TCP discard protocol server.
//!
//! Accepts connections, reads and drops everything clients send, and
//! optionally greets each client once. Built on a mio acceptor thread and
//! a fixed pool of mio worker threads.

pub mod config;
pub mod error;
pub mod protocols;
pub mod runtime;

pub use config::{Config, Mode};
pub use error::{ConfigError, ConnectionError, ServerError};
pub use runtime::{Server, StopHandle};
