//! Per-worker read buffer pool.
//!
//! Provides fixed-size buffer allocation without per-read malloc overhead.
//! Buffers are handed out as scoped [`Lease`]s: the buffer goes back to the
//! pool when the lease is dropped, on every exit path of the code holding it
//! (normal return, early `?` return, or unwinding out of a panic).

use crate::error::ConnectionError;
use std::io;
use std::ops::{Deref, DerefMut};
use std::panic::{self, AssertUnwindSafe};

/// Per-worker buffer pool with fixed-size buffers.
///
/// Buffers are pre-allocated and reused to avoid allocation overhead
/// on the hot path. The pool tracks which buffers are in use via a free list.
pub struct BufferPool {
    /// Actual buffer storage.
    buffers: Vec<Box<[u8]>>,
    /// Stack of available buffer indices (LIFO for cache locality).
    free_list: Vec<usize>,
    /// Size of each buffer.
    buffer_size: usize,
    /// Leases handed out over the pool's lifetime.
    leased: u64,
    /// Leases returned over the pool's lifetime.
    released: u64,
}

impl BufferPool {
    /// Create a new buffer pool.
    ///
    /// # Arguments
    /// * `count` - Number of buffers to pre-allocate
    /// * `size` - Size of each buffer in bytes
    pub fn new(count: usize, size: usize) -> Self {
        let buffers = (0..count).map(|_| vec![0u8; size].into_boxed_slice()).collect();
        // Reverse so index 0 is handed out first.
        let free_list = (0..count).rev().collect();

        Self {
            buffers,
            free_list,
            buffer_size: size,
            leased: 0,
            released: 0,
        }
    }

    /// Lease a buffer from the pool.
    ///
    /// Returns `None` if no buffers are available.
    pub fn lease(&mut self) -> Option<Lease<'_>> {
        let idx = self.free_list.pop()?;
        self.leased += 1;
        Some(Lease { pool: self, idx })
    }

    fn release(&mut self, idx: usize) {
        debug_assert!(idx < self.buffers.len(), "buffer index out of bounds");
        debug_assert!(!self.free_list.contains(&idx), "buffer released twice");
        self.free_list.push(idx);
        self.released += 1;
    }

    /// Get the size of each buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Get the total number of buffers.
    pub fn capacity(&self) -> usize {
        self.buffers.len()
    }

    /// Get the number of available buffers.
    pub fn available(&self) -> usize {
        self.free_list.len()
    }

    /// Total leases handed out.
    pub fn leased(&self) -> u64 {
        self.leased
    }

    /// Total leases returned.
    pub fn released(&self) -> u64 {
        self.released
    }
}

/// A buffer borrowed from a [`BufferPool`], returned on drop.
pub struct Lease<'a> {
    pool: &'a mut BufferPool,
    idx: usize,
}

impl Deref for Lease<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.pool.buffers[self.idx]
    }
}

impl DerefMut for Lease<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.pool.buffers[self.idx]
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        self.pool.release(self.idx);
    }
}

/// Outcome of a single [`receive_chunk`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// A chunk of this many bytes was read and inspected.
    Chunk(usize),
    /// The peer closed its write side.
    Eof,
    /// The socket has no more data for now.
    WouldBlock,
}

/// Read one chunk into a leased buffer and hand it to `inspect`.
///
/// The lease is released exactly once before this returns, whatever
/// `read` or `inspect` do. A panic in `inspect` is caught and turned
/// into [`ConnectionError::HandlerPanic`].
pub fn receive_chunk<R, F>(
    pool: &mut BufferPool,
    mut read: R,
    inspect: F,
) -> Result<Received, ConnectionError>
where
    R: FnMut(&mut [u8]) -> io::Result<usize>,
    F: FnOnce(&[u8]) -> Result<(), ConnectionError>,
{
    let mut lease = pool.lease().ok_or(ConnectionError::PoolExhausted)?;

    let n = loop {
        match read(&mut lease) {
            Ok(0) => return Ok(Received::Eof),
            Ok(n) => break n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Ok(Received::WouldBlock)
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    };

    let chunk = &lease[..n];
    match panic::catch_unwind(AssertUnwindSafe(|| inspect(chunk))) {
        Ok(result) => result.map(|()| Received::Chunk(n)),
        Err(payload) => Err(ConnectionError::HandlerPanic(panic_message(&*payload))),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
