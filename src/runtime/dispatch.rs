//! Completion dispatch for accepted connections.
//!
//! Every accepted connection gets a context from the pool and one task that
//! issues the operation named by the state machine, waits for it, and feeds
//! the result back in. Only one operation per connection is ever in flight.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{info, trace};

use crate::runtime::{
    AdmissionGate, AdmissionPermit, Completion, ConnState, ConnectionState, ContextPool,
    IoContext, OpKind, Stats, Step,
};

/// Shared resources for all connections of one server.
pub struct Dispatcher<S> {
    pool: ContextPool<S>,
    gate: AdmissionGate,
    stats: Stats,
}

impl<S> Dispatcher<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// The pool and gate must have the same capacity.
    pub fn new(pool: ContextPool<S>, gate: AdmissionGate) -> Arc<Self> {
        assert_eq!(
            pool.capacity(),
            gate.capacity(),
            "context pool and admission gate capacities differ"
        );
        Arc::new(Self {
            pool,
            gate,
            stats: Stats::new(),
        })
    }

    /// Bind an accepted connection to a context and return the task that
    /// drives it. The caller spawns it.
    ///
    /// The permit is held until the connection is closed.
    pub fn dispatch(
        self: &Arc<Self>,
        stream: S,
        peer: SocketAddr,
        permit: AdmissionPermit,
    ) -> impl Future<Output = ()> + Send + 'static {
        let connected = self.stats.connection_opened();

        let mut ctx = self.pool.take();
        ctx.bind(ConnectionState::new(stream, peer));

        info!(
            peer = %peer,
            connected,
            context = ctx.id(),
            permits_in_flight = self.gate.in_flight(),
            "Client connection accepted"
        );

        let this = Arc::clone(self);
        async move {
            let ctx = drive(ctx, &this.stats).await;
            this.finish(ctx, permit, peer);
        }
    }

    fn finish(&self, ctx: IoContext<S>, permit: AdmissionPermit, peer: SocketAddr) {
        let connected = self.stats.connection_closed();
        self.pool.release(ctx);
        permit.release();
        info!(
            peer = %peer,
            connected,
            contexts_in_use = self.pool.in_use(),
            "Client disconnected"
        );
    }

    #[cfg(test)]
    pub fn pool(&self) -> &ContextPool<S> {
        &self.pool
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }
}

/// Run one connection's state machine to completion and close it.
///
/// Returns the context, unbound, ready to go back to the pool.
pub async fn drive<S>(mut ctx: IoContext<S>, stats: &Stats) -> IoContext<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut step = Step::Receive;

    loop {
        let completion = match step {
            Step::Receive => {
                ctx.issue(OpKind::Receive);
                let (stream, buf) = ctx.io_parts();
                Completion::Receive(stream.read(buf).await)
            }
            Step::Send(range) => {
                ctx.issue(OpKind::Send);
                let (stream, buf) = ctx.io_parts();
                Completion::Send(stream.write(&buf[range]).await)
            }
            Step::Close => break,
        };

        step = ctx.complete(completion, stats);
    }

    let closed = close(&mut ctx).await;
    debug_assert_eq!(closed, Some(ConnState::Closed));
    ctx
}

/// Half-close the outbound direction, then drop the transport.
///
/// Returns the final connection state.
async fn close<S>(ctx: &mut IoContext<S>) -> Option<ConnState>
where
    S: AsyncWrite + Unpin,
{
    let mut conn = ctx.unbind()?;

    // Peer may already be gone
    if let Err(e) = conn.stream_mut().shutdown().await {
        trace!(peer = %conn.peer(), error = %e, "Half-close failed");
    }

    conn.finish();
    Some(conn.state())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::BufferArena;
    use std::io;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::ReadBuf;
    use tokio_test::io::Builder;

    const PEER: &str = "127.0.0.1:6000";

    fn context<S>(segment_size: usize) -> IoContext<S> {
        let mut arena = BufferArena::initialize(segment_size, 2);
        IoContext::new(0, arena.next_segment())
    }

    fn bound<S>(stream: S, segment_size: usize) -> IoContext<S> {
        let mut ctx = context(segment_size);
        ctx.bind(ConnectionState::new(stream, PEER.parse().unwrap()));
        ctx
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Read(Vec<u8>),
        Write(Vec<u8>),
        Shutdown,
    }

    /// Transport that feeds scripted chunks, then EOF, and accepts at most
    /// `max_write` bytes per write.
    struct ChunkedStream {
        reads: Vec<Vec<u8>>,
        max_write: usize,
        log: Arc<Mutex<Vec<Event>>>,
    }

    impl ChunkedStream {
        fn new(reads: &[&str], max_write: usize) -> (Self, Arc<Mutex<Vec<Event>>>) {
            let log = Arc::new(Mutex::new(Vec::new()));
            let stream = Self {
                reads: reads.iter().rev().map(|r| r.as_bytes().to_vec()).collect(),
                max_write,
                log: Arc::clone(&log),
            };
            (stream, log)
        }
    }

    impl AsyncRead for ChunkedStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if let Some(chunk) = self.reads.pop() {
                buf.put_slice(&chunk);
                self.log.lock().unwrap().push(Event::Read(chunk));
            }
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for ChunkedStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let n = buf.len().min(self.max_write);
            self.log.lock().unwrap().push(Event::Write(buf[..n].to_vec()));
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.log.lock().unwrap().push(Event::Shutdown);
            Poll::Ready(Err(io::ErrorKind::NotConnected.into()))
        }
    }

    #[tokio::test]
    async fn test_ping_echo() {
        let mock = Builder::new().read(b"ping").write(b"ping").build();
        let stats = Stats::new();

        let ctx = drive(bound(mock, 64), &stats).await;

        assert!(ctx.connection().is_none());
        assert!(ctx.pending().is_none());
        assert_eq!(stats.total_bytes_read(), 4);
    }

    #[tokio::test]
    async fn test_multiple_chunks_echoed_in_order() {
        let mock = Builder::new()
            .read(b"hello ")
            .write(b"hello ")
            .read(b"world")
            .write(b"world")
            .build();
        let stats = Stats::new();

        drive(bound(mock, 64), &stats).await;
        assert_eq!(stats.total_bytes_read(), 11);
    }

    #[tokio::test]
    async fn test_read_error_closes() {
        let mock = Builder::new()
            .read(b"abc")
            .write(b"abc")
            .read_error(io::Error::from(io::ErrorKind::ConnectionReset))
            .build();
        let stats = Stats::new();

        let ctx = drive(bound(mock, 16), &stats).await;
        assert!(ctx.connection().is_none());
        assert_eq!(stats.total_bytes_read(), 3);
    }

    #[tokio::test]
    async fn test_write_error_closes() {
        let mock = Builder::new()
            .read(b"abc")
            .write_error(io::Error::from(io::ErrorKind::BrokenPipe))
            .build();
        let stats = Stats::new();

        let ctx = drive(bound(mock, 16), &stats).await;
        assert!(ctx.connection().is_none());
    }

    #[tokio::test]
    async fn test_partial_send_continuation() {
        let (stream, log) = ChunkedStream::new(&["abcdefghij", "xyz"], 4);
        let stats = Stats::new();

        drive(bound(stream, 32), &stats).await;

        let events = log.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                Event::Read(b"abcdefghij".to_vec()),
                Event::Write(b"abcd".to_vec()),
                Event::Write(b"efgh".to_vec()),
                Event::Write(b"ij".to_vec()),
                Event::Read(b"xyz".to_vec()),
                Event::Write(b"xyz".to_vec()),
                Event::Shutdown,
            ]
        );
        assert_eq!(stats.total_bytes_read(), 13);
    }

    #[tokio::test]
    async fn test_stale_segment_bytes_not_echoed() {
        let mut ctx: IoContext<ChunkedStream> = context(16);

        let (first, _) = ChunkedStream::new(&["0123456789"], 16);
        ctx.bind(ConnectionState::new(first, PEER.parse().unwrap()));
        let mut ctx = drive(ctx, &Stats::new()).await;

        let (second, log) = ChunkedStream::new(&["ab"], 16);
        ctx.bind(ConnectionState::new(second, PEER.parse().unwrap()));
        drive(ctx, &Stats::new()).await;

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                Event::Read(b"ab".to_vec()),
                Event::Write(b"ab".to_vec()),
                Event::Shutdown,
            ]
        );
    }

    #[tokio::test]
    async fn test_dispatcher_returns_resources() {
        let capacity = 2;
        let mut arena = BufferArena::initialize(32, capacity * 2);
        let pool = ContextPool::new(capacity);
        pool.populate(&mut arena);
        let dispatcher = Dispatcher::new(pool, AdmissionGate::new(capacity));

        let permit = dispatcher.gate().acquire().await.unwrap();
        let mock = Builder::new()
            .read(b"ping")
            .wait(Duration::from_millis(50))
            .write(b"ping")
            .build();

        let handle = tokio::spawn(dispatcher.dispatch(mock, PEER.parse().unwrap(), permit));

        // Connection in progress holds one context and one permit
        assert_eq!(dispatcher.stats().connected_clients(), 1);
        assert_eq!(dispatcher.pool().in_use(), 1);
        assert_eq!(dispatcher.gate().in_flight(), 1);

        handle.await.unwrap();

        assert_eq!(dispatcher.stats().connected_clients(), 0);
        assert_eq!(dispatcher.stats().total_bytes_read(), 4);
        assert_eq!(dispatcher.pool().available(), capacity);
        assert_eq!(dispatcher.gate().in_flight(), 0);
    }
}
