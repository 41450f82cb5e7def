//! TCP echo server.
//!
//! Owns the listening socket and the accept loop. Every accept first takes a
//! permit from the admission gate, so at most `max_connections` clients are
//! connected at once; further attempts wait in the listen backlog.

use crate::config::Config;
use crate::runtime::{
    AdmissionGate, BufferArena, ContextPool, Dispatcher, StatsSnapshot, OPS_PER_CONNECTION,
};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info};

/// Server instance
pub struct Server {
    config: Config,
    arena: Option<BufferArena>,
    dispatcher: Option<Arc<Dispatcher<TcpStream>>>,
}

impl Server {
    /// Create an uninitialized server. Call [`Server::init`] before serving.
    pub fn new(config: Config) -> Self {
        Server {
            config,
            arena: None,
            dispatcher: None,
        }
    }

    /// Allocate the buffer arena and populate the context pool.
    ///
    /// Only the first call does anything.
    pub fn init(&mut self) {
        if self.dispatcher.is_some() {
            debug!("Server already initialized");
            return;
        }

        let max_connections = self.config.max_connections;
        let segment_size = self.config.receive_buffer_size;

        let mut arena =
            BufferArena::initialize(segment_size, max_connections * OPS_PER_CONNECTION);
        let pool = ContextPool::new(max_connections);
        pool.populate(&mut arena);

        info!(
            arena_bytes = arena.len(),
            segment_size = arena.segment_size(),
            contexts = pool.capacity(),
            segments_bound = arena.allocated(),
            spare_segments = arena.remaining(),
            "Buffer arena initialized"
        );

        self.dispatcher = Some(Dispatcher::new(pool, AdmissionGate::new(max_connections)));
        self.arena = Some(arena);
    }

    /// Create the listening socket with the configured backlog.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(&self, addr: SocketAddr) -> Result<TcpListener, ServerError> {
        let listener = create_listener(addr, self.config.backlog)
            .map_err(|e| ServerError::Bind(addr, e))?;
        TcpListener::from_std(listener).map_err(|e| ServerError::Bind(addr, e))
    }

    /// Bind to `addr` and serve until Ctrl-C.
    pub async fn start(&self, addr: SocketAddr) -> Result<(), ServerError> {
        let listener = self.bind(addr)?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Run the accept loop on `listener` until `shutdown` resolves.
    ///
    /// While waiting in `accept` the loop already holds the permit for the
    /// next client, so below capacity `in_flight` is one more than the
    /// connected count.
    ///
    /// Connections still open at shutdown are not drained.
    ///
    /// # Panics
    /// Re-raises the panic of any connection task.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let dispatcher = self.dispatcher()?;
        if let Ok(addr) = listener.local_addr() {
            info!(
                address = %addr,
                max_connections = self.config.max_connections,
                arena_bytes = self.arena.as_ref().map_or(0, BufferArena::len),
                "Server listening"
            );
        }

        tokio::pin!(shutdown);
        let mut connections = JoinSet::new();

        loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                Some(joined) = connections.join_next() => {
                    reap(joined);
                    continue;
                }
                permit = dispatcher.gate().acquire() => match permit {
                    Some(permit) => permit,
                    None => break,
                },
            };

            let accepted = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                Some(joined) = connections.join_next() => {
                    reap(joined);
                    continue;
                }
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(dispatcher.dispatch(stream, peer, permit));
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    permit.release();
                }
            }
        }

        connections.detach_all();
        dispatcher.gate().close();
        info!(
            connected = dispatcher.stats().connected_clients(),
            "Accept loop stopped"
        );
        Ok(())
    }

    /// Current counters. All zero before [`Server::init`].
    pub fn stats(&self) -> StatsSnapshot {
        match &self.dispatcher {
            Some(dispatcher) => dispatcher.stats().snapshot(),
            None => StatsSnapshot {
                total_bytes_read: 0,
                connected_clients: 0,
            },
        }
    }

    fn dispatcher(&self) -> Result<&Arc<Dispatcher<TcpStream>>, ServerError> {
        self.dispatcher.as_ref().ok_or(ServerError::NotInitialized)
    }
}

/// Surface a panicked connection task in the accept loop. A lost context
/// would leave the pool and the gate out of step.
fn reap(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!("Connection task panicked");
            std::panic::resume_unwind(e.into_panic());
        }
    }
}

/// Resolves on Ctrl-C. Never resolves if the handler cannot be installed.
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
}

/// Create a non-blocking TCP listener with an explicit backlog.
fn create_listener(addr: SocketAddr, backlog: u32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;

    Ok(socket.into())
}

/// Server lifecycle errors
#[derive(Debug)]
pub enum ServerError {
    NotInitialized,
    Bind(SocketAddr, io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::NotInitialized => write!(f, "Server used before init()"),
            ServerError::Bind(addr, e) => write!(f, "Failed to listen on {addr}: {e}"),
        }
    }
}

impl std::error::Error for ServerError {}
