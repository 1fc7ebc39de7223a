//! Discard protocol.
//!
//! The server accepts any byte stream and produces no corresponding output.
//! There is no framing: inbound chunks are whatever the socket returned and
//! never line up with the sender's writes.
//!
//! Two behaviors share one handler, selected by [`Mode`](crate::config::Mode):
//!
//! - `discard`: nothing is ever written; inbound bytes are counted and dropped.
//! - `greeting`: on connect the peer receives [`GREETING`] exactly once
//!   (fire-and-forget); inbound bytes are decoded as UTF-8 and logged.
//!
//! ```text
//! Client:  <any bytes>
//! Server:  <nothing>                      (discard)
//! Server:  Netty rocks!                   (greeting, once, on connect)
//! ```

pub mod handler;
mod text;

pub use handler::{handle_connection_error, ConnectionHandler, Phase, GREETING};
pub use text::TextDecoder;
