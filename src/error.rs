//! Error taxonomy for worker and pool operations

use std::fmt;
use std::io;
use thiserror::Error;

/// Errors raised while creating, connecting to or registering workers
#[derive(Debug, Error)]
pub enum PoolError {
    /// The worker process could not be spawned, even after a retry
    #[error("failed to spawn worker `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// The worker's IPC endpoint did not accept a connection
    #[error("failed to connect to worker endpoint {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// The worker exited before it could be registered with its pool
    #[error("worker {endpoint} exited before it was registered")]
    Exited { endpoint: String },

    /// The pool is shutting down and refuses to create workers
    #[error("pool is stopping")]
    Stopping,
}

impl PoolError {
    /// Whether this error came from connecting to a worker's endpoint
    pub fn is_connect(&self) -> bool {
        matches!(self, PoolError::Connect { .. })
    }
}

/// Direction of a proxied byte stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client bytes flowing to the worker
    ClientToWorker,
    /// Worker bytes flowing back to the client
    WorkerToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToWorker => write!(f, "client->worker"),
            Direction::WorkerToClient => write!(f, "worker->client"),
        }
    }
}

/// I/O failure of one direction of a proxied session (advisory only)
#[derive(Debug, Error)]
#[error("proxy {direction} failed: {source}")]
pub struct ProxyIoError {
    pub direction: Direction,
    #[source]
    pub source: io::Error,
}
