//! Per-connection state machine.
//!
//! A connection alternates between one outstanding receive and one
//! outstanding send until the peer goes away:
//!
//! ```text
//! Receiving -> Sending -> Receiving -> ... -> Closing -> Closed
//! ```
//!
//! The machine never touches the transport itself. The dispatcher issues the
//! operation named by each [`Step`], and feeds its result back in.

use chrono::{DateTime, Utc};
use std::io;
use std::net::SocketAddr;
use std::ops::Range;
use tracing::{debug, trace};

use crate::runtime::OpKind;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// A receive into the segment is outstanding.
    Receiving,
    /// Echoing the received bytes back.
    Sending {
        /// Bytes of the echo already accepted by the transport.
        written: usize,
        /// Bytes received, all of which must be echoed.
        total: usize,
    },
    /// No further I/O will be issued.
    Closing,
    /// Transport handle shut down and released.
    Closed,
}

/// Result of one finished transport operation.
#[derive(Debug)]
pub enum Completion {
    Receive(io::Result<usize>),
    Send(io::Result<usize>),
}

impl Completion {
    pub fn kind(&self) -> OpKind {
        match self {
            Completion::Receive(_) => OpKind::Receive,
            Completion::Send(_) => OpKind::Send,
        }
    }
}

/// What the dispatcher must do next for a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Receive into the whole segment.
    Receive,
    /// Send this range of the segment.
    Send(Range<usize>),
    /// Shut the connection down.
    Close,
}

/// Bookkeeping for one accepted connection, owned by the bound context.
#[derive(Debug)]
pub struct ConnectionState<S> {
    stream: S,
    peer: SocketAddr,
    state: ConnState,
    bytes_received: u64,
    bytes_sent: u64,
    accepted_at: DateTime<Utc>,
}

impl<S> ConnectionState<S> {
    /// Wrap a freshly accepted transport. The first operation is a receive.
    pub fn new(stream: S, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::Receiving,
            bytes_received: 0,
            bytes_sent: 0,
            accepted_at: Utc::now(),
        }
    }

    /// Advance after a receive finished.
    ///
    /// # Panics
    /// Panics if the connection was not receiving.
    pub fn on_receive(&mut self, result: io::Result<usize>) -> Step {
        assert_eq!(
            self.state,
            ConnState::Receiving,
            "receive completed while connection was not receiving"
        );

        match result {
            Ok(0) => {
                trace!(peer = %self.peer, "Peer closed connection");
                self.begin_close()
            }
            Ok(n) => {
                self.bytes_received += n as u64;
                self.state = ConnState::Sending {
                    written: 0,
                    total: n,
                };
                Step::Send(0..n)
            }
            Err(e) => {
                debug!(peer = %self.peer, error = %e, "Receive failed");
                self.begin_close()
            }
        }
    }

    /// Advance after a send finished.
    ///
    /// A short send is a continuation: the remainder is sent before the
    /// next receive is issued.
    ///
    /// # Panics
    /// Panics if the connection was not sending.
    pub fn on_send(&mut self, result: io::Result<usize>) -> Step {
        let ConnState::Sending { written, total } = self.state else {
            panic!(
                "send completed while connection was in state {:?}",
                self.state
            );
        };

        match result {
            Ok(0) => {
                debug!(peer = %self.peer, "Send accepted no bytes");
                self.begin_close()
            }
            Ok(n) => {
                self.bytes_sent += n as u64;
                let written = written + n;
                if written < total {
                    self.state = ConnState::Sending { written, total };
                    Step::Send(written..total)
                } else {
                    self.state = ConnState::Receiving;
                    Step::Receive
                }
            }
            Err(e) => {
                debug!(peer = %self.peer, error = %e, "Send failed");
                self.begin_close()
            }
        }
    }

    fn begin_close(&mut self) -> Step {
        self.state = ConnState::Closing;
        Step::Close
    }

    /// Mark the connection closed once the transport has been shut down.
    ///
    /// # Panics
    /// Panics unless the connection was closing.
    pub fn finish(&mut self) {
        assert_eq!(
            self.state,
            ConnState::Closing,
            "connection finished while in state {:?}",
            self.state
        );
        self.state = ConnState::Closed;
        let lifetime = Utc::now() - self.accepted_at;
        debug!(
            peer = %self.peer,
            bytes_received = self.bytes_received,
            bytes_sent = self.bytes_sent,
            lifetime_ms = lifetime.num_milliseconds(),
            "Connection closed"
        );
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnState {
        self.state
    }
}
