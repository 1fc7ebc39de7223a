//! Connection protocol implementations.
//!
//! - `discard`: read and drop everything, optionally greeting the peer
//!   and logging what it sends.

pub mod discard;
