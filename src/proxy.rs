//! Byte-transparent bridge between client connections and worker channels
//!
//! The bridge never looks at FastCGI records: whatever the client sends is
//! copied to the worker and the other way round until both sides are done.

use crate::error::{Direction, ProxyIoError};
use crate::pool::WorkerPool;
use crate::server::{Action, Connection, ConnectionHandler, ServerHandle};
use parking_lot::RwLock;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn};

/// Workers tried for one connection when a worker's endpoint refuses it
const CONNECT_ATTEMPTS: u32 = 2;

/// The pool currently serving a listener, replaceable on reload
pub type SharedPool = Arc<RwLock<Arc<WorkerPool>>>;

/// Result of a proxied session, one entry per direction
#[derive(Debug)]
pub struct ProxyOutcome {
    /// Bytes copied from the client to the worker
    pub client_to_worker: io::Result<u64>,
    /// Bytes copied from the worker back to the client
    pub worker_to_client: io::Result<u64>,
}

impl ProxyOutcome {
    /// Whether both directions ended with a clean EOF
    pub fn is_clean(&self) -> bool {
        self.client_to_worker.is_ok() && self.worker_to_client.is_ok()
    }

    /// Per-direction failures, client side first
    pub fn into_errors(self) -> Vec<ProxyIoError> {
        [
            (Direction::ClientToWorker, self.client_to_worker),
            (Direction::WorkerToClient, self.worker_to_client),
        ]
        .into_iter()
        .filter_map(|(direction, result)| {
            result
                .err()
                .map(|source| ProxyIoError { direction, source })
        })
        .collect()
    }
}

/// Copy bytes both ways between `client` and `worker` until both directions end.
///
/// Each direction has its own buffer. When a direction finishes, the write
/// side of its destination is shut down so the peer observes EOF.
pub async fn bridge<C, W>(client: &mut C, worker: &mut W) -> ProxyOutcome
where
    C: AsyncRead + AsyncWrite + Unpin,
    W: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut worker_rd, mut worker_wr) = tokio::io::split(worker);

    let (client_to_worker, worker_to_client) = tokio::join!(
        pipe(&mut client_rd, &mut worker_wr),
        pipe(&mut worker_rd, &mut client_wr),
    );

    ProxyOutcome {
        client_to_worker,
        worker_to_client,
    }
}

async fn pipe<R, W>(reader: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy(reader, writer).await;
    // Best effort: the peer may already be gone
    let _ = writer.shutdown().await;
    copied
}

/// Connection handler routing each accepted client to an idle worker
pub struct FastCgiHandler {
    instance: usize,
    pool: SharedPool,
}

impl FastCgiHandler {
    pub fn new(instance: usize, pool: SharedPool) -> Self {
        Self { instance, pool }
    }

    /// The pool new connections are routed to
    pub fn current_pool(&self) -> Arc<WorkerPool> {
        Arc::clone(&self.pool.read())
    }
}

impl ConnectionHandler for FastCgiHandler {
    fn on_startup(&self, server: &ServerHandle) -> Action {
        info!(
            instance = self.instance,
            addr = %server.local_addr(),
            "FastCGI listener ready"
        );
        Action::Continue
    }

    async fn on_connect(&self, conn: &mut Connection) -> Action {
        // Sessions stay on the pool they started with, even across a reload
        let pool = self.current_pool();
        let peer = conn.peer_addr();

        for attempt in 1..=CONNECT_ATTEMPTS {
            let Some(mut worker) = pool.get_idle_process() else {
                error!(instance = self.instance, %peer, "No worker available, closing connection");
                return Action::Close;
            };

            let result = worker.proxy(conn.stream_mut()).await;
            let worker_id = worker.id();
            pool.put_idle_process(worker);

            match result {
                Ok(outcome) => {
                    if outcome.is_clean() {
                        debug!(instance = self.instance, %peer, worker = worker_id, "Proxy session finished");
                    } else {
                        for err in outcome.into_errors() {
                            debug!(
                                instance = self.instance,
                                %peer,
                                worker = worker_id,
                                direction = %err.direction,
                                error = %err.source,
                                "Proxy session ended with error"
                            );
                        }
                    }
                    return Action::Close;
                }
                Err(e) if e.is_connect() => {
                    warn!(
                        instance = self.instance,
                        %peer,
                        worker = worker_id,
                        attempt,
                        error = %e,
                        "Worker refused connection"
                    );
                }
                Err(e) => {
                    warn!(instance = self.instance, %peer, error = %e, "Proxy failed");
                    return Action::Close;
                }
            }
        }

        error!(instance = self.instance, %peer, "No worker accepted the connection");
        Action::Close
    }

    fn on_disconnect(&self, conn: &Connection) {
        debug!(instance = self.instance, peer = %conn.peer_addr(), "Client disconnected");
    }

    fn on_shutdown(&self, server: &ServerHandle) {
        info!(
            instance = self.instance,
            addr = %server.local_addr(),
            "FastCGI listener stopped"
        );
    }
}
