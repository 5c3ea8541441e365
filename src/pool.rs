//! Worker pool for one FastCGI listener
//!
//! Idle workers are kept on a stack so the most recently used (warmest)
//! worker is handed out first. Every worker has a watcher task that owns its
//! OS process; the watcher is the only place that learns about exits and it
//! replaces workers that crash.
//!
//! Bookkeeping (`idle`, `tracked`, `stopping`) lives behind a single mutex
//! that is never held across an `.await` or a process spawn.

use crate::config::InstanceConfig;
use crate::error::PoolError;
use crate::process::{self, ExitHandle, WorkerCommand, WorkerProcess, WorkerState};
use parking_lot::Mutex;
use std::path::Path;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Child;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Interval for polling drain status during shutdown (in milliseconds)
const DRAIN_POLL_INTERVAL_MS: u64 = 50;

/// Delay before a crashed worker is replaced (in milliseconds)
const RESTART_DELAY_MS: u64 = 500;

/// A worker counted against the pool's capacity
struct TrackedWorker {
    id: u64,
    exit: Arc<ExitHandle>,
}

struct PoolState {
    /// Most recently idle worker on top
    idle: Vec<WorkerProcess>,
    tracked: Vec<TrackedWorker>,
    stopping: bool,
}

impl PoolState {
    /// Remove a worker from capacity accounting, returns whether it was tracked
    fn untrack(&mut self, id: u64) -> bool {
        match self.tracked.iter().position(|t| t.id == id) {
            Some(pos) => {
                self.tracked.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    fn take_idle(&mut self, id: u64) -> Option<WorkerProcess> {
        let pos = self.idle.iter().position(|w| w.id() == id)?;
        Some(self.idle.remove(pos))
    }
}

/// Counters for the lifetime of a pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Worker processes spawned
    pub spawned: AtomicU64,
    /// Workers retired because they were stale
    pub recycled: AtomicU64,
    /// Workers that exited without being asked to
    pub crashed: AtomicU64,
    /// Worker connections opened for sessions, counted at hand-back
    pub requests: AtomicU64,
}

impl PoolStats {
    pub fn get_spawned(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    pub fn get_recycled(&self) -> u64 {
        self.recycled.load(Ordering::Relaxed)
    }

    pub fn get_crashed(&self) -> u64 {
        self.crashed.load(Ordering::Relaxed)
    }

    pub fn get_requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

/// Snapshot of the pool's bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub idle: usize,
    pub tracked: usize,
    pub stopping: bool,
}

/// Bounded pool of worker processes for one listener.
///
/// Like the other long-lived components, the pool is shared across tasks
/// behind an `Arc`; [`new`](WorkerPool::new) returns one directly. Methods
/// that spawn background tasks take `self: &Arc<Self>`.
pub struct WorkerPool {
    instance: usize,
    config: InstanceConfig,
    command: Arc<WorkerCommand>,
    state: Mutex<PoolState>,
    /// Watcher tasks whose process has not been reaped yet
    live: AtomicUsize,
    stats: PoolStats,
    shutdown_tx: watch::Sender<bool>,
    /// Spawns allowed before `spawn_worker` fails
    #[cfg(test)]
    spawn_budget: AtomicUsize,
}

impl WorkerPool {
    pub fn new(instance: usize, config: InstanceConfig, socket_dir: &Path) -> Arc<Self> {
        let command = Arc::new(WorkerCommand::from_instance(&config, socket_dir));
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            instance,
            config,
            command,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                tracked: Vec::new(),
                stopping: false,
            }),
            live: AtomicUsize::new(0),
            stats: PoolStats::default(),
            shutdown_tx,
            #[cfg(test)]
            spawn_budget: AtomicUsize::new(usize::MAX),
        })
    }

    pub fn instance(&self) -> usize {
        self.instance
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.state.lock();
        PoolStatus {
            idle: state.idle.len(),
            tracked: state.tracked.len(),
            stopping: state.stopping,
        }
    }

    /// Number of worker processes not yet reaped, tracked or not
    pub fn live_processes(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Bring up `min_processes` workers, all or nothing, and start the reclaim loop
    pub async fn start(self: &Arc<Self>) -> Result<(), PoolError> {
        info!(
            instance = self.instance,
            command = %self.config.exec_path,
            min_processes = self.config.min_processes,
            max_processes = self.config.max_processes,
            max_requests = self.config.max_requests_per_process,
            idle_timeout_secs = self.config.idle_timeout_secs,
            "Starting worker pool"
        );

        for _ in 0..self.config.min_processes {
            if let Err(e) = self.spawn_worker() {
                error!(instance = self.instance, error = %e, "Failed to start minimum workers, stopping pool");
                self.stop().await;
                return Err(e);
            }
        }

        if let Some(interval) = self.config.idle_timeout() {
            // Subscribed here so a stop() that lands before the task runs is still seen
            let shutdown_rx = self.shutdown_tx.subscribe();
            let pool = Arc::clone(self);
            tokio::spawn(async move {
                pool.reclaim_loop(interval, shutdown_rx).await;
            });
        }

        Ok(())
    }

    /// Start one worker and register it as idle.
    ///
    /// Nothing is registered when the spawn fails. A worker that finds the
    /// pool stopping, or already exited, is retired and reported as an error.
    /// One that finds the pool full is retired without being counted.
    fn spawn_worker(self: &Arc<Self>) -> Result<(), PoolError> {
        if self.state.lock().stopping {
            return Err(PoolError::Stopping);
        }

        #[cfg(test)]
        if self
            .spawn_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_err()
        {
            return Err(PoolError::Spawn {
                command: self.command.exec_path.clone(),
                source: std::io::Error::other("spawn budget exhausted"),
            });
        }

        let mut worker = WorkerProcess::new(Arc::clone(&self.command));
        let child = worker.try_start()?;
        self.stats.spawned.fetch_add(1, Ordering::Relaxed);
        self.watch_worker(child, &worker);

        let mut state = self.state.lock();
        if state.stopping {
            drop(state);
            worker.retire();
            return Err(PoolError::Stopping);
        }
        if worker.is_closed() {
            drop(state);
            worker.retire();
            return Err(PoolError::Exited {
                endpoint: worker.endpoint().to_string(),
            });
        }
        if state.tracked.len() >= self.config.max_processes {
            drop(state);
            debug!(instance = self.instance, worker = worker.id(), "Pool is full, discarding surplus worker");
            worker.set_in_pool(false);
            worker.retire();
            return Ok(());
        }

        state.tracked.push(TrackedWorker {
            id: worker.id(),
            exit: worker.exit_handle(),
        });
        worker.set_in_pool(true);
        worker.touch_idle();
        state.idle.push(worker);
        Ok(())
    }

    /// Spawn the watcher task that owns `child` for its whole life
    fn watch_worker(self: &Arc<Self>, child: Child, worker: &WorkerProcess) {
        let pool = Arc::clone(self);
        let id = worker.id();
        let exit = worker.exit_handle();
        let endpoint = worker.endpoint().to_string();

        self.live.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let status = process::supervise(child, Arc::clone(&exit), endpoint.clone()).await;
            pool.on_worker_exit(id, &exit, &endpoint, status).await;
            pool.live.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Bookkeeping for a reaped worker.
    ///
    /// A tracked worker that exited without being retired is replaced, but
    /// only after `RESTART_DELAY_MS` rather than immediately, so a worker that
    /// dies on startup cannot spin the pool.
    async fn on_worker_exit(
        self: &Arc<Self>,
        id: u64,
        exit: &ExitHandle,
        endpoint: &str,
        status: Option<ExitStatus>,
    ) {
        let (was_tracked, stopping, retired) = {
            let mut state = self.state.lock();
            state.take_idle(id);
            let was_tracked = state.untrack(id);
            (was_tracked, state.stopping, exit.is_retired())
        };

        if retired {
            debug!(instance = self.instance, worker = id, ?status, "Retired worker exited");
            return;
        }

        self.stats.crashed.fetch_add(1, Ordering::Relaxed);
        warn!(instance = self.instance, worker = id, endpoint, ?status, "Worker exited unexpectedly");

        if stopping || !was_tracked {
            return;
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(RESTART_DELAY_MS)) => {}
            _ = shutdown_rx.wait_for(|stopping| *stopping) => return,
        }

        match self.spawn_worker() {
            Ok(()) => info!(instance = self.instance, replaced = id, "Replacement worker started"),
            Err(PoolError::Stopping) => {}
            Err(e) => error!(instance = self.instance, replaced = id, error = %e, "Failed to replace crashed worker"),
        }
    }

    /// Take the most recently idle worker, growing the pool by one if allowed.
    ///
    /// `None` means no worker is available right now (pool at capacity or
    /// stopping); callers should close or delay the client.
    pub fn get_idle_process(self: &Arc<Self>) -> Option<WorkerProcess> {
        if let Some(worker) = self.pop_idle() {
            return Some(worker);
        }

        let can_grow = {
            let state = self.state.lock();
            !state.stopping && state.tracked.len() < self.config.max_processes
        };
        if !can_grow {
            return None;
        }

        if let Err(e) = self.spawn_worker() {
            warn!(instance = self.instance, error = %e, "Failed to grow worker pool");
            return None;
        }
        self.pop_idle()
    }

    fn pop_idle(&self) -> Option<WorkerProcess> {
        let mut state = self.state.lock();
        if state.stopping {
            return None;
        }
        while let Some(mut worker) = state.idle.pop() {
            // Its watcher is about to clean up; never hand out a dead worker
            if worker.is_closed() {
                continue;
            }
            worker.mark_in_use();
            return Some(worker);
        }
        None
    }

    /// Hand a worker back after a session; stale workers are retired.
    pub fn put_idle_process(self: &Arc<Self>, mut worker: WorkerProcess) {
        worker.close_channel();
        worker.touch_idle();
        self.stats
            .requests
            .fetch_add(worker.take_unreported_requests(), Ordering::Relaxed);

        let mut state = self.state.lock();
        if !self.is_stale(&worker, state.stopping, Instant::now()) {
            state.idle.push(worker);
            return;
        }

        let was_tracked = state.untrack(worker.id());
        state.take_idle(worker.id());
        let replace = was_tracked
            && worker.in_pool()
            && !state.stopping
            && state.tracked.len() < self.config.min_processes;
        worker.retire();
        drop(state);

        self.stats.recycled.fetch_add(1, Ordering::Relaxed);
        info!(
            instance = self.instance,
            worker = worker.id(),
            requests = worker.request_count(),
            closed = worker.is_closed(),
            "Recycling worker"
        );

        if replace {
            let pool = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = pool.spawn_worker() {
                    if !matches!(e, PoolError::Stopping) {
                        error!(instance = pool.instance, error = %e, "Failed to start replacement worker");
                    }
                }
            });
        }
    }

    /// Whether a worker must be retired instead of reused.
    ///
    /// A worker in use is never stale.
    pub fn is_stale(&self, worker: &WorkerProcess, stopping: bool, now: Instant) -> bool {
        if worker.state() == WorkerState::InUse {
            return false;
        }

        let idle_expired = self
            .config
            .idle_timeout()
            .is_some_and(|timeout| now.saturating_duration_since(worker.idle_since()) > timeout);

        stopping
            || worker.is_closed()
            || !worker.in_pool()
            || worker.request_count() >= self.config.max_requests_per_process
            || idle_expired
    }

    async fn reclaim_loop(self: Arc<Self>, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;

        debug!(instance = self.instance, interval_secs = interval.as_secs(), "Reclaim loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.reclaim_tick(),
                // Resolves at once if the pool was stopped before the loop started
                _ = shutdown_rx.wait_for(|stopping| *stopping) => break,
            }
        }

        debug!(instance = self.instance, "Reclaim loop stopped");
    }

    /// Refill towards the minimum and reclaim at most one stale worker.
    ///
    /// Only the oldest idle worker (bottom of the stack) is inspected per
    /// tick, which bounds the work done under the lock.
    fn reclaim_tick(self: &Arc<Self>) {
        let (below_min, reclaimed) = {
            let mut state = self.state.lock();
            if state.stopping {
                return;
            }
            let below_min = state.tracked.len() < self.config.min_processes;

            let oldest_is_stale = state
                .idle
                .first()
                .map(|w| self.is_stale(w, false, Instant::now()))
                .unwrap_or(false);
            let reclaimed = if oldest_is_stale {
                let worker = state.idle.remove(0);
                state.untrack(worker.id());
                Some(worker)
            } else {
                None
            };

            (below_min, reclaimed)
        };

        if below_min {
            match self.spawn_worker() {
                Ok(()) => debug!(instance = self.instance, "Refilled pool towards minimum"),
                Err(e) => warn!(instance = self.instance, error = %e, "Failed to refill pool"),
            }
        }

        if let Some(mut worker) = reclaimed {
            self.stats.recycled.fetch_add(1, Ordering::Relaxed);
            info!(
                instance = self.instance,
                worker = worker.id(),
                idle_secs = worker.idle_since().elapsed().as_secs(),
                "Reclaiming idle worker"
            );
            worker.retire();
        }
    }

    /// Stop creating workers, kill idle ones and wait for in-use ones to come back.
    ///
    /// Returns once every tracked worker is gone and reaped. Idempotent.
    pub async fn stop(&self) {
        let first = {
            let mut state = self.state.lock();
            let first = !state.stopping;
            state.stopping = true;
            first
        };

        if first {
            info!(instance = self.instance, "Stopping worker pool");
            self.shutdown_tx.send_replace(true);
        }

        let drain_start = Instant::now();
        loop {
            let idle = std::mem::take(&mut self.state.lock().idle);
            for mut worker in idle {
                worker.retire();
            }

            let drained = {
                let state = self.state.lock();
                state.tracked.is_empty() && state.idle.is_empty()
            };
            if drained && self.live.load(Ordering::SeqCst) == 0 {
                break;
            }

            tokio::time::sleep(Duration::from_millis(DRAIN_POLL_INTERVAL_MS)).await;
        }

        if first {
            info!(
                instance = self.instance,
                drained_in_ms = drain_start.elapsed().as_millis() as u64,
                "Worker pool stopped"
            );
        }
    }

    /// Kill every tracked worker, including ones serving a connection.
    ///
    /// Used when a listener is removed outright; follow with [`stop`](Self::stop)
    /// to wait for the processes to be reaped.
    pub fn kill_all(&self) {
        let state = self.state.lock();
        for tracked in &state.tracked {
            tracked.exit.retire();
            tracked.exit.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn sleeper(min: usize, max: usize) -> InstanceConfig {
        let mut config = InstanceConfig::new("127.0.0.1:0", "sh")
            .with_args(vec!["-c".to_string(), "exec sleep 60".to_string(), "worker".to_string()])
            .with_processes(min, max);
        config.idle_timeout_secs = 0;
        config.connect_timeout_ms = 0;
        config
    }

    fn socket_dir() -> std::path::PathBuf {
        std::env::temp_dir().join("fcgi-pool-tests")
    }

    async fn wait_until<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_start_creates_min_workers() {
        let pool = WorkerPool::new(0, sleeper(2, 4), &socket_dir());
        pool.start().await.unwrap();

        let status = pool.status();
        assert_eq!(status.idle, 2);
        assert_eq!(status.tracked, 2);
        assert!(!status.stopping);
        assert_eq!(pool.stats().get_spawned(), 2);

        pool.stop().await;
        assert_eq!(pool.status(), PoolStatus { idle: 0, tracked: 0, stopping: true });
        assert_eq!(pool.live_processes(), 0);
    }

    #[tokio::test]
    async fn test_start_failure_leaves_no_workers() {
        let mut config = sleeper(3, 4);
        config.exec_path = "/nonexistent/fcgi-worker".to_string();
        let pool = WorkerPool::new(0, config, &socket_dir());

        let err = pool.start().await.unwrap_err();
        assert!(matches!(err, PoolError::Spawn { .. }));
        assert_eq!(pool.status().tracked, 0);
        assert_eq!(pool.status().idle, 0);
        assert_eq!(pool.live_processes(), 0);
    }

    #[tokio::test]
    async fn test_start_failure_after_some_workers_cleans_up() {
        let pool = WorkerPool::new(0, sleeper(3, 4), &socket_dir());
        pool.spawn_budget.store(2, Ordering::SeqCst);

        let err = pool.start().await.unwrap_err();
        assert!(matches!(err, PoolError::Spawn { .. }));

        // The two workers that did start were stopped and reaped
        assert_eq!(pool.stats().get_spawned(), 2);
        assert_eq!(pool.status(), PoolStatus { idle: 0, tracked: 0, stopping: true });
        assert_eq!(pool.live_processes(), 0);
        assert_eq!(pool.stats().get_crashed(), 0);
    }

    #[tokio::test]
    async fn test_stop_right_after_start_ends_reclaim_loop() {
        let mut config = sleeper(1, 1);
        config.idle_timeout_secs = 1;
        let pool = WorkerPool::new(0, config, &socket_dir());

        pool.start().await.unwrap();
        pool.stop().await;

        // Past one reclaim interval, nothing else holds the pool
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(Arc::strong_count(&pool), 1);
    }

    #[tokio::test]
    async fn test_get_idle_is_lifo_and_distinct() {
        let pool = WorkerPool::new(0, sleeper(2, 4), &socket_dir());
        pool.start().await.unwrap();

        let a = pool.get_idle_process().unwrap();
        let b = pool.get_idle_process().unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.state(), WorkerState::InUse);
        assert_eq!(pool.status().idle, 0);

        let (a_id, b_id) = (a.id(), b.id());
        pool.put_idle_process(a);
        pool.put_idle_process(b);

        // Most recently returned comes out first
        let next = pool.get_idle_process().unwrap();
        assert_eq!(next.id(), b_id);
        let after = pool.get_idle_process().unwrap();
        assert_eq!(after.id(), a_id);

        pool.put_idle_process(next);
        pool.put_idle_process(after);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_grows_to_max_then_exhausts() {
        let pool = WorkerPool::new(0, sleeper(1, 2), &socket_dir());
        pool.start().await.unwrap();

        let first = pool.get_idle_process().unwrap();
        let second = pool.get_idle_process().expect("pool grows below max");
        assert_eq!(pool.status().tracked, 2);
        assert!(pool.get_idle_process().is_none());

        pool.put_idle_process(first);
        pool.put_idle_process(second);
        assert_eq!(pool.status().idle, 2);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_put_idle_keeps_channel_unset() {
        let pool = WorkerPool::new(0, sleeper(1, 1), &socket_dir());
        pool.start().await.unwrap();

        let worker = pool.get_idle_process().unwrap();
        pool.put_idle_process(worker);

        let worker = pool.get_idle_process().unwrap();
        assert!(!worker.has_channel());
        assert!(worker.in_pool());
        pool.put_idle_process(worker);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_stale_predicate() {
        let pool = WorkerPool::new(0, sleeper(1, 2), &socket_dir());
        pool.start().await.unwrap();

        let mut worker = pool.get_idle_process().unwrap();
        let now = Instant::now();
        // In use is never stale, even when stopping
        assert!(!pool.is_stale(&worker, true, now));

        worker.touch_idle();
        assert!(!pool.is_stale(&worker, false, now));
        assert!(pool.is_stale(&worker, true, now));

        // Not counted against capacity
        worker.set_in_pool(false);
        assert!(pool.is_stale(&worker, false, now));
        worker.set_in_pool(true);

        pool.put_idle_process(worker);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_idle_timeout_is_stale() {
        let mut config = sleeper(1, 2);
        config.idle_timeout_secs = 1;
        let pool = WorkerPool::new(0, config, &socket_dir());
        pool.start().await.unwrap();

        let mut worker = pool.get_idle_process().unwrap();
        worker.touch_idle();
        assert!(!pool.is_stale(&worker, false, Instant::now()));
        assert!(pool.is_stale(&worker, false, Instant::now() + Duration::from_secs(2)));

        pool.put_idle_process(worker);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_reclaim_loop_replaces_idle_worker() {
        let mut config = sleeper(1, 2);
        config.idle_timeout_secs = 1;
        let pool = WorkerPool::new(0, config, &socket_dir());
        pool.start().await.unwrap();

        let worker = pool.get_idle_process().unwrap();
        let original = worker.id();
        pool.put_idle_process(worker);

        let reclaimed = wait_until(|| pool.stats().get_recycled() >= 1).await;
        assert!(reclaimed, "idle worker should be reclaimed");

        // The next tick refills towards the minimum
        assert!(wait_until(|| pool.status().idle == 1).await);
        let worker = pool.get_idle_process().unwrap();
        assert_ne!(worker.id(), original);
        pool.put_idle_process(worker);
        pool.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_external_kill_is_replaced() {
        let pool = WorkerPool::new(0, sleeper(2, 4), &socket_dir());
        pool.start().await.unwrap();

        let worker = pool.get_idle_process().unwrap();
        let (victim, pid) = (worker.id(), worker.pid().unwrap());
        pool.put_idle_process(worker);

        unsafe {
            libc::kill(pid as i32, libc::SIGKILL);
        }

        assert!(wait_until(|| pool.stats().get_crashed() == 1).await);
        assert!(wait_until(|| pool.stats().get_spawned() == 3 && pool.status().idle == 2).await);
        assert_eq!(pool.status().tracked, 2);

        let a = pool.get_idle_process().unwrap();
        let b = pool.get_idle_process().unwrap();
        assert_ne!(a.id(), victim);
        assert_ne!(b.id(), victim);
        pool.put_idle_process(a);
        pool.put_idle_process(b);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_closed_worker_is_recycled_on_return() {
        let pool = WorkerPool::new(0, sleeper(1, 2), &socket_dir());
        pool.start().await.unwrap();

        let worker = pool.get_idle_process().unwrap();
        let victim = worker.id();
        worker.kill();
        assert!(wait_until(|| worker.is_closed()).await);

        pool.put_idle_process(worker);
        assert_eq!(pool.stats().get_recycled(), 1);

        // The watcher replaced it, the returned worker is never reused
        assert!(wait_until(|| pool.status().idle == 1).await);
        let next = pool.get_idle_process().unwrap();
        assert_ne!(next.id(), victim);
        pool.put_idle_process(next);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_use_worker() {
        let pool = WorkerPool::new(0, sleeper(3, 3), &socket_dir());
        pool.start().await.unwrap();

        let in_use = pool.get_idle_process().unwrap();
        assert_eq!(pool.status(), PoolStatus { idle: 2, tracked: 3, stopping: false });

        let stopping = Arc::clone(&pool);
        let stop_task = tokio::spawn(async move { stopping.stop().await });

        assert!(wait_until(|| pool.status().tracked == 1).await);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!stop_task.is_finished());
        assert!(pool.get_idle_process().is_none());

        pool.put_idle_process(in_use);
        tokio::time::timeout(Duration::from_secs(5), stop_task)
            .await
            .expect("stop should return once the worker is handed back")
            .unwrap();

        assert_eq!(pool.status(), PoolStatus { idle: 0, tracked: 0, stopping: true });
        assert_eq!(pool.live_processes(), 0);
        assert_eq!(pool.stats().get_crashed(), 0);
    }

    #[tokio::test]
    async fn test_stopped_pool_refuses_workers() {
        let pool = WorkerPool::new(0, sleeper(1, 2), &socket_dir());
        pool.start().await.unwrap();
        pool.stop().await;
        // Second stop returns immediately
        pool.stop().await;

        assert!(pool.get_idle_process().is_none());
        assert!(matches!(pool.spawn_worker(), Err(PoolError::Stopping)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_never_shares_workers() {
        let pool = WorkerPool::new(0, sleeper(4, 4), &socket_dir());
        pool.start().await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            tasks.push(tokio::spawn(async move { pool.get_idle_process() }));
        }

        let mut workers = Vec::new();
        for task in tasks {
            if let Some(worker) = task.await.unwrap() {
                workers.push(worker);
            }
        }

        let ids: HashSet<u64> = workers.iter().map(|w| w.id()).collect();
        assert_eq!(ids.len(), workers.len());
        assert_eq!(workers.len(), 4);

        for worker in workers {
            pool.put_idle_process(worker);
        }
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_kill_all_terminates_in_use_workers() {
        let pool = WorkerPool::new(0, sleeper(2, 2), &socket_dir());
        pool.start().await.unwrap();

        let in_use = pool.get_idle_process().unwrap();
        pool.kill_all();
        assert!(wait_until(|| in_use.is_closed()).await);

        pool.put_idle_process(in_use);
        tokio::time::timeout(Duration::from_secs(5), pool.stop())
            .await
            .expect("stop should return once killed workers are reaped");
        assert_eq!(pool.stats().get_crashed(), 0);
        assert_eq!(pool.live_processes(), 0);
    }
}
