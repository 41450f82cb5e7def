//! Admission gate bounding the number of concurrently accepted connections.
//!
//! The accept loop takes a permit before every accept. When none are left
//! it waits, and further connection attempts sit in the listen backlog.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Counting gate with `capacity` permits.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    permits: Arc<Semaphore>,
    capacity: usize,
}

/// One admitted connection. Returned to the gate on release or drop.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionPermit {
    /// Give the permit back to the gate. Never blocks.
    pub fn release(self) {}
}

impl AdmissionGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a permit.
    ///
    /// Returns `None` once the gate has been closed.
    pub async fn acquire(&self) -> Option<AdmissionPermit> {
        let permit = Arc::clone(&self.permits).acquire_owned().await.ok()?;
        Some(AdmissionPermit { _permit: permit })
    }

    /// Stop admitting. Pending and future `acquire` calls return `None`.
    pub fn close(&self) {
        self.permits.close();
    }

    /// Permits currently available.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Permits currently held by accepted (or accepting) connections.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.available()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
