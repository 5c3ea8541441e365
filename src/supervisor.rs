//! Listener lifecycle and configuration reload
//!
//! The supervisor owns one listener per configured instance. A reload builds a
//! fresh pool for each listener, swaps it in for new connections and lets the
//! old pool drain in the background; sessions already running keep their
//! worker from the old pool until they finish.

use crate::config::{Config, InstanceConfig};
use crate::pool::WorkerPool;
use crate::proxy::{FastCgiHandler, SharedPool};
use crate::server::{ConnectionServer, ServerHandle};
use anyhow::Context;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Requests delivered to a running supervisor, usually from signal handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Re-read the configuration file and replace every pool
    Reload,
    /// Shut everything down and return from [`Supervisor::run`]
    Stop,
    Pause,
    Continue,
}

/// Service state as reported to the outside world
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ServiceState {
    #[default]
    Running,
    /// Reported only; listeners keep serving
    Paused,
    Stopped,
}

/// Result of a configuration reload, by instance index
#[derive(Debug, Clone, Default)]
pub struct ReloadResult {
    /// Listeners now served by a freshly started pool
    pub swapped: Vec<usize>,
    /// Listeners created for new instances
    pub added: Vec<usize>,
    /// Listeners force-stopped because their instance is gone
    pub removed: Vec<usize>,
    /// Instances whose new pool or listener failed to start
    pub failed: Vec<usize>,
}

struct Listener {
    instance: usize,
    /// Configured address, kept to detect changes on reload
    bind: String,
    max_connections: usize,
    pool: SharedPool,
    server: ServerHandle,
    task: JoinHandle<()>,
}

impl Listener {
    fn current_pool(&self) -> Arc<WorkerPool> {
        Arc::clone(&self.pool.read())
    }
}

/// Owner of every listener and pool in the process
pub struct Supervisor {
    config_path: Option<PathBuf>,
    socket_dir: PathBuf,
    listeners: Vec<Listener>,
    /// Replaced or removed pools still waiting for in-flight sessions
    draining: JoinSet<()>,
    state: ServiceState,
}

impl Supervisor {
    /// Start a pool and a listener for every instance.
    ///
    /// If any instance fails to start, the ones already running are shut
    /// down before the error is returned.
    pub async fn start(config: &Config, config_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let mut supervisor = Self {
            config_path,
            socket_dir: config.socket_dir(),
            listeners: Vec::with_capacity(config.instances.len()),
            draining: JoinSet::new(),
            state: ServiceState::Running,
        };

        for (index, instance) in config.instances.iter().enumerate() {
            match start_listener(index, instance, &supervisor.socket_dir).await {
                Ok(listener) => supervisor.listeners.push(listener),
                Err(e) => {
                    supervisor.shutdown().await;
                    return Err(e);
                }
            }
        }

        info!(
            listeners = supervisor.listeners.len(),
            socket_dir = %supervisor.socket_dir.display(),
            "All listeners started"
        );
        Ok(supervisor)
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(|l| l.server.local_addr()).collect()
    }

    /// The pool currently receiving new connections for a listener
    pub fn pool(&self, instance: usize) -> Option<Arc<WorkerPool>> {
        self.listeners.get(instance).map(Listener::current_pool)
    }

    /// Number of replaced pools that have not finished draining
    pub fn draining(&self) -> usize {
        self.draining.len()
    }

    /// Reload from the file the supervisor was started with
    pub async fn reload_config(&mut self) -> anyhow::Result<ReloadResult> {
        let path = self
            .config_path
            .clone()
            .context("No configuration file to reload")?;
        let config = Config::load(&path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
        Ok(self.apply_config(config).await)
    }

    /// Replace every pool with one built from `config`.
    ///
    /// A listener whose new pool fails to start keeps its current pool. The
    /// bind address and connection limit of a running listener cannot be
    /// changed this way.
    pub async fn apply_config(&mut self, config: Config) -> ReloadResult {
        let mut result = ReloadResult::default();

        for (index, instance) in config.instances.iter().enumerate() {
            if let Some(listener) = self.listeners.get_mut(index) {
                if listener.bind != instance.bind
                    || listener.max_connections != instance.max_connections()
                {
                    warn!(
                        instance = index,
                        bind = %listener.bind,
                        new_bind = %instance.bind,
                        max_connections = listener.max_connections,
                        new_max_connections = instance.max_connections(),
                        "Listener settings cannot be changed by reload, keeping current ones"
                    );
                }

                let pool = WorkerPool::new(index, instance.clone(), &self.socket_dir);
                if let Err(e) = pool.start().await {
                    error!(instance = index, error = %e, "Failed to start new pool, keeping current one");
                    result.failed.push(index);
                    continue;
                }

                let old = std::mem::replace(&mut *listener.pool.write(), pool);
                info!(instance = index, "Worker pool replaced (config reload)");
                self.draining.spawn(async move {
                    old.stop().await;
                });
                result.swapped.push(index);
            } else {
                match start_listener(index, instance, &self.socket_dir).await {
                    Ok(listener) => {
                        info!(instance = index, addr = %listener.server.local_addr(), "Listener added (config reload)");
                        self.listeners.push(listener);
                        result.added.push(index);
                    }
                    Err(e) => {
                        // Listener indices must stay contiguous
                        error!(instance = index, error = %e, "Failed to add listener");
                        result.failed.extend(index..config.instances.len());
                        break;
                    }
                }
            }
        }

        while self.listeners.len() > config.instances.len() {
            let Some(listener) = self.listeners.pop() else {
                break;
            };
            info!(instance = listener.instance, addr = %listener.server.local_addr(), "Removing listener (config reload)");
            result.removed.push(listener.instance);

            listener.server.shutdown();
            let pool = listener.current_pool();
            pool.kill_all();
            let task = listener.task;
            self.draining.spawn(async move {
                let _ = task.await;
                pool.stop().await;
            });
        }

        info!(
            swapped = result.swapped.len(),
            added = result.added.len(),
            removed = result.removed.len(),
            failed = result.failed.len(),
            "Configuration reloaded"
        );

        result
    }

    /// Apply one control command; returns false once the supervisor should stop
    pub async fn handle_command(&mut self, command: ControlCommand) -> bool {
        match command {
            ControlCommand::Reload => {
                match self.reload_config().await {
                    Ok(result) => {
                        if !result.failed.is_empty() {
                            warn!(instances = ?result.failed, "Some instances kept their previous configuration");
                        }
                    }
                    Err(e) => error!(error = %e, "Failed to reload configuration"),
                }
                true
            }
            ControlCommand::Pause => {
                info!("Service paused");
                self.state = ServiceState::Paused;
                true
            }
            ControlCommand::Continue => {
                info!("Service resumed");
                self.state = ServiceState::Running;
                true
            }
            ControlCommand::Stop => false,
        }
    }

    /// Process control commands until `Stop` arrives or every sender is gone
    pub async fn run(mut self, mut commands: mpsc::Receiver<ControlCommand>) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        debug!("Control channel closed");
                        break;
                    };
                    debug!(?command, "Control command received");
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                Some(joined) = self.draining.join_next(), if !self.draining.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Pool drain task failed");
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Stop every listener, wait for all pools to drain. Idempotent.
    pub async fn shutdown(&mut self) {
        if self.state == ServiceState::Stopped {
            return;
        }
        info!(listeners = self.listeners.len(), "Shutting down");

        let listeners = std::mem::take(&mut self.listeners);
        for listener in &listeners {
            listener.server.shutdown();
        }

        for listener in listeners {
            if let Err(e) = listener.task.await {
                error!(instance = listener.instance, error = %e, "Listener task failed");
            }
            let pool = Arc::clone(&listener.pool.read());
            pool.stop().await;
        }

        while let Some(joined) = self.draining.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Pool drain task failed");
            }
        }

        self.state = ServiceState::Stopped;
        info!("Shutdown complete");
    }
}

async fn start_listener(
    index: usize,
    instance: &InstanceConfig,
    socket_dir: &Path,
) -> anyhow::Result<Listener> {
    let addr = instance
        .bind_addr()
        .map_err(|e| anyhow::anyhow!("instances[{}]: {}", index, e))?;

    let pool = WorkerPool::new(index, instance.clone(), socket_dir);
    pool.start()
        .await
        .with_context(|| format!("Failed to start worker pool for instances[{}]", index))?;

    let server = match ConnectionServer::bind(addr, instance.max_connections()).await {
        Ok(server) => server,
        Err(e) => {
            pool.stop().await;
            return Err(e);
        }
    };

    let shared: SharedPool = Arc::new(RwLock::new(pool));
    let handler = Arc::new(FastCgiHandler::new(index, Arc::clone(&shared)));
    let server_handle = server.handle();
    let task = tokio::spawn(async move {
        if let Err(e) = server.serve(handler).await {
            error!(instance = index, error = %e, "Connection server error");
        }
    });

    Ok(Listener {
        instance: index,
        bind: instance.bind.clone(),
        max_connections: instance.max_connections(),
        pool: shared,
        server: server_handle,
        task,
    })
}
