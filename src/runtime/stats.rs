//! Server-wide connection counters shared by the acceptor and workers.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ServerStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    closed: AtomicU64,
    errors: AtomicU64,
    bytes_discarded: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Connections a worker took ownership of.
    pub accepted: u64,
    /// Connections closed on arrival because a worker was full or draining.
    pub rejected: u64,
    pub closed: u64,
    /// Connections closed because of a `ConnectionError`.
    pub errors: u64,
    pub bytes_discarded: u64,
}

impl StatsSnapshot {
    /// Connections currently open.
    pub fn active(&self) -> u64 {
        self.accepted.saturating_sub(self.closed)
    }
}

impl ServerStats {
    pub(crate) fn on_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_closed(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_discarded(&self, bytes: usize) {
        self.bytes_discarded
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            bytes_discarded: self.bytes_discarded.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_active() {
        let stats = ServerStats::default();
        stats.on_accepted();
        stats.on_accepted();
        stats.on_closed();
        stats.on_discarded(1024);

        let snap = stats.snapshot();
        assert_eq!(snap.accepted, 2);
        assert_eq!(snap.active(), 1);
        assert_eq!(snap.bytes_discarded, 1024);
    }
}
