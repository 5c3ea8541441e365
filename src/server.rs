//! TCP admission server with a blocking concurrent-connection cap
//!
//! A permit is taken from a semaphore before every `accept`, so once
//! `max_connections` clients are connected the server simply stops accepting
//! until one of them leaves. Nothing is rejected; the kernel backlog absorbs
//! the wait.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info};

/// Pause after a failed accept before trying again (e.g. out of descriptors)
const ACCEPT_ERROR_BACKOFF_MS: u64 = 100;

/// What the server does after a handler returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing more to do; the connection is dropped when its task ends
    Continue,
    /// Run the disconnect handler and close the connection
    Close,
    /// Stop accepting connections
    Shutdown,
}

/// An accepted client connection
pub struct Connection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    server: ServerHandle,
}

impl Connection {
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn server(&self) -> &ServerHandle {
        &self.server
    }
}

/// Cloneable handle used to observe and stop a running server
#[derive(Debug, Clone)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections. Idempotent; in-flight connections drain on their own.
    pub fn shutdown(&self) {
        if !self.shutdown_tx.send_replace(true) {
            info!(addr = %self.local_addr, "Connection server shutting down");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

/// Events raised by a [`ConnectionServer`]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Called once before the accept loop starts; `Shutdown` skips serving
    fn on_startup(&self, _server: &ServerHandle) -> Action {
        Action::Continue
    }

    /// Called for every accepted connection, in its own task
    fn on_connect(&self, conn: &mut Connection) -> impl Future<Output = Action> + Send;

    /// Called after a connection was closed because of [`Action::Close`]
    fn on_disconnect(&self, _conn: &Connection) {}

    /// Called once the accept loop has ended
    fn on_shutdown(&self, _server: &ServerHandle) {}
}

/// TCP acceptor for one listener
pub struct ConnectionServer {
    listener: TcpListener,
    max_connections: usize,
    handle: ServerHandle,
}

impl ConnectionServer {
    /// Bind the listener; `max_connections` of 0 is treated as 1
    pub async fn bind(addr: SocketAddr, max_connections: usize) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", addr, e))?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            listener,
            max_connections: max_connections.max(1),
            handle: ServerHandle {
                local_addr,
                shutdown_tx: Arc::new(shutdown_tx),
            },
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.handle.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Run the accept loop until the server is shut down
    pub async fn serve<H: ConnectionHandler>(self, handler: Arc<H>) -> anyhow::Result<()> {
        let limiter = Arc::new(Semaphore::new(self.max_connections));
        let mut shutdown_rx = self.handle.shutdown_tx.subscribe();

        if handler.on_startup(&self.handle) == Action::Shutdown {
            self.handle.shutdown();
        }

        info!(
            addr = %self.handle.local_addr,
            max_connections = self.max_connections,
            "Connection server listening"
        );

        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }

            // Backpressure: wait for a free slot before accepting
            let permit = tokio::select! {
                permit = Arc::clone(&limiter).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let (stream, peer_addr) = tokio::select! {
                result = self.listener.accept() => match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        if self.handle.is_shutdown() {
                            break;
                        }
                        error!(error = %e, "Failed to accept connection");
                        drop(permit);
                        tokio::time::sleep(Duration::from_millis(ACCEPT_ERROR_BACKOFF_MS)).await;
                        continue;
                    }
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            debug!(peer = %peer_addr, "Accepted connection");

            let handler = Arc::clone(&handler);
            let handle = self.handle.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let mut conn = Connection {
                    stream,
                    peer_addr,
                    server: handle.clone(),
                };

                match handler.on_connect(&mut conn).await {
                    Action::Continue => {}
                    Action::Close => {
                        let _ = conn.stream.shutdown().await;
                        handler.on_disconnect(&conn);
                    }
                    Action::Shutdown => handle.shutdown(),
                }
            });
        }

        drop(self.listener);
        handler.on_shutdown(&self.handle);
        info!(addr = %self.handle.local_addr, "Connection server stopped");
        Ok(())
    }
}
