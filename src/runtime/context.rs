//! Reusable I/O contexts and the pool that holds idle ones.
//!
//! Each context pairs one arena segment with the bookkeeping for a single
//! outstanding operation. Contexts are created once at startup, bound to a
//! connection while in use, and returned to the pool on close.

use std::sync::Mutex;
use tracing::{debug, trace};

use crate::runtime::{BufferArena, Completion, ConnectionState, Segment, Stats, Step};

/// Type of the operation outstanding on a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Receive,
    Send,
}

/// One reusable operation slot.
#[derive(Debug)]
pub struct IoContext<S> {
    id: usize,
    segment: Segment,
    pending: Option<OpKind>,
    conn: Option<ConnectionState<S>>,
}

impl<S> IoContext<S> {
    pub fn new(id: usize, segment: Segment) -> Self {
        Self {
            id,
            segment,
            pending: None,
            conn: None,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Attach a freshly accepted connection.
    ///
    /// # Panics
    /// Panics if the context is already bound.
    pub fn bind(&mut self, conn: ConnectionState<S>) {
        assert!(
            self.conn.is_none(),
            "context {} bound to two connections",
            self.id
        );
        self.conn = Some(conn);
    }

    /// Detach the connection, if any.
    pub fn unbind(&mut self) -> Option<ConnectionState<S>> {
        self.pending = None;
        self.conn.take()
    }

    #[cfg(test)]
    pub fn connection(&self) -> Option<&ConnectionState<S>> {
        self.conn.as_ref()
    }

    #[cfg(test)]
    pub fn pending(&self) -> Option<OpKind> {
        self.pending
    }

    /// Record that `op` is now outstanding.
    ///
    /// # Panics
    /// Panics if another operation is still outstanding.
    pub fn issue(&mut self, op: OpKind) {
        if let Some(outstanding) = self.pending {
            panic!(
                "context {}: issued {:?} while {:?} is outstanding",
                self.id, op, outstanding
            );
        }
        self.pending = Some(op);
    }

    /// Route a completion into the bound connection's state machine.
    ///
    /// Received bytes are added to the server-wide counter here.
    ///
    /// # Panics
    /// Panics if the completion does not match the outstanding operation or
    /// the context has no connection.
    pub fn complete(&mut self, completion: Completion, stats: &Stats) -> Step {
        let issued = self.pending.take();
        if issued != Some(completion.kind()) {
            panic!(
                "context {}: unexpected {:?} completion, outstanding operation was {:?}",
                self.id,
                completion.kind(),
                issued
            );
        }

        let Some(conn) = self.conn.as_mut() else {
            panic!("context {}: completion on unbound context", self.id);
        };

        match completion {
            Completion::Receive(result) => {
                let step = conn.on_receive(result);
                if let Step::Send(ref range) = step {
                    let total_bytes_read = stats.add_bytes_read(range.len());
                    debug!(total_bytes_read, "Bytes received");
                }
                step
            }
            Completion::Send(result) => conn.on_send(result),
        }
    }

    /// Split into the transport and the segment for issuing I/O.
    ///
    /// # Panics
    /// Panics if the context has no connection.
    pub fn io_parts(&mut self) -> (&mut S, &mut [u8]) {
        let Some(conn) = self.conn.as_mut() else {
            panic!("context {}: I/O issued on unbound context", self.id);
        };
        (conn.stream_mut(), &mut self.segment[..])
    }

    /// Clear connection-specific state. The segment is left as is; every
    /// operation overwrites the region it uses.
    fn reset(&mut self) {
        self.pending = None;
        self.conn = None;
    }
}

/// LIFO pool of idle contexts, guarded by a single lock.
pub struct ContextPool<S> {
    idle: Mutex<Vec<IoContext<S>>>,
    capacity: usize,
}

impl<S> ContextPool<S> {
    /// Create an empty pool for `capacity` contexts.
    pub fn new(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// Create `capacity` contexts, each bound to its own arena segment.
    ///
    /// # Panics
    /// Panics if the pool was already populated or the arena runs out.
    pub fn populate(&self, arena: &mut BufferArena) {
        let mut idle = self.idle.lock().unwrap();
        assert!(idle.is_empty(), "context pool populated twice");

        for id in 0..self.capacity {
            let segment = arena.next_segment();
            trace!(
                context = id,
                offset = segment.offset(),
                len = segment.len(),
                "Bound context to arena segment"
            );
            idle.push(IoContext::new(id, segment));
        }
    }

    /// Take an idle context.
    ///
    /// # Panics
    /// Panics if the pool is empty. The admission gate is sized to the same
    /// capacity, so an empty pool means the two have drifted apart.
    pub fn take(&self) -> IoContext<S> {
        match self.idle.lock().unwrap().pop() {
            Some(ctx) => ctx,
            None => panic!(
                "context pool exhausted: all {} contexts in use",
                self.capacity
            ),
        }
    }

    /// Clear a context and return it to the pool.
    pub fn release(&self, mut ctx: IoContext<S>) {
        ctx.reset();
        let mut idle = self.idle.lock().unwrap();
        assert!(
            idle.len() < self.capacity,
            "context pool overfilled on release of context {}",
            ctx.id
        );
        idle.push(ctx);
    }

    /// Number of idle contexts.
    pub fn available(&self) -> usize {
        self.idle.lock().unwrap().len()
    }

    /// Number of contexts currently bound to connections.
    pub fn in_use(&self) -> usize {
        self.capacity - self.available()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
