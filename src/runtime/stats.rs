//! Server-wide counters shared by every connection.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Cross-connection counters. Each is updated independently.
#[derive(Debug, Default)]
pub struct Stats {
    total_bytes_read: AtomicU64,
    connected_clients: AtomicUsize,
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub total_bytes_read: u64,
    pub connected_clients: usize,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `n` received bytes. Returns the new running total.
    pub fn add_bytes_read(&self, n: usize) -> u64 {
        self.total_bytes_read.fetch_add(n as u64, Ordering::AcqRel) + n as u64
    }

    /// Returns the connected-client count after the increment.
    pub fn connection_opened(&self) -> usize {
        self.connected_clients.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns the connected-client count after the decrement.
    pub fn connection_closed(&self) -> usize {
        let prev = self.connected_clients.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "connected client count underflow");
        prev - 1
    }

    pub fn total_bytes_read(&self) -> u64 {
        self.total_bytes_read.load(Ordering::Acquire)
    }

    pub fn connected_clients(&self) -> usize {
        self.connected_clients.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_bytes_read: self.total_bytes_read(),
            connected_clients: self.connected_clients(),
        }
    }
}
