//! Connection runtime: pre-allocated buffers, reusable contexts and the
//! per-connection state machine.
//!
//! Shared pieces:
//! - `BufferArena`: one block sliced into fixed segments at startup
//! - `ContextPool`: idle `IoContext`s, each owning one segment
//! - `AdmissionGate`: bounds concurrently accepted connections
//! - `ConnectionState`: receive/send state machine for one connection
//! - `Dispatcher`: drives each connection's completions on the tokio runtime

mod arena;
mod connection;
mod context;
mod dispatch;
mod gate;
mod stats;

pub(crate) use arena::{BufferArena, Segment};
pub(crate) use connection::{Completion, ConnState, ConnectionState, Step};
pub(crate) use context::{ContextPool, IoContext, OpKind};
pub(crate) use dispatch::Dispatcher;
pub(crate) use gate::{AdmissionGate, AdmissionPermit};
pub(crate) use stats::{Stats, StatsSnapshot};

/// Buffer segments reserved per connection: one receive, one send.
pub const OPS_PER_CONNECTION: usize = 2;
