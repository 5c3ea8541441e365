use crate::config::InstanceConfig;
use crate::error::PoolError;
use crate::proxy::{self, ProxyOutcome};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Flag preceding the endpoint in a worker's command line (`php-cgi -b <path>`)
pub const ENDPOINT_FLAG: &str = "-b";

/// Number of spawn attempts before a start is reported as failed
const SPAWN_ATTEMPTS: u32 = 2;

/// Interval between connection attempts while a worker binds its endpoint
const CONNECT_RETRY_INTERVAL_MS: u64 = 10;

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// Byte stream to a worker's endpoint
#[cfg(unix)]
pub type IpcStream = tokio::net::UnixStream;

/// Byte stream to a worker's endpoint
#[cfg(windows)]
pub type IpcStream = tokio::net::windows::named_pipe::NamedPipeClient;

/// Lifecycle state of a worker process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Spawned, not yet handed to the pool
    Starting,
    /// Waiting in the pool for a connection
    Idle,
    /// Owned by a caller serving a connection
    InUse,
    /// The OS process has exited
    Closed,
}

/// Everything needed to launch a worker for one instance
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub exec_path: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Directory for UNIX domain socket endpoints
    pub socket_dir: PathBuf,
    /// How long `connect` keeps retrying an endpoint that is not bound yet
    pub connect_timeout: Duration,
}

impl WorkerCommand {
    pub fn from_instance(config: &InstanceConfig, socket_dir: &Path) -> Self {
        Self {
            exec_path: config.exec_path.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
            socket_dir: socket_dir.to_path_buf(),
            connect_timeout: config.connect_timeout(),
        }
    }

    fn build(&self, endpoint: &str) -> Command {
        let mut cmd = Command::new(&self.exec_path);
        cmd.args(&self.args);
        cmd.arg(ENDPOINT_FLAG).arg(endpoint);
        cmd.envs(&self.env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);
        cmd
    }
}

/// Exit bookkeeping shared between a worker and its watcher task
#[derive(Debug, Default)]
pub struct ExitHandle {
    kill: Notify,
    closed: AtomicBool,
    retired: AtomicBool,
}

impl ExitHandle {
    /// Ask the watcher to terminate the process
    pub fn kill(&self) {
        self.kill.notify_one();
    }

    /// Mark the worker as intentionally removed, so its exit is not a crash
    pub fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }
}

/// One backend worker process and, while serving, its IPC channel
#[derive(Debug)]
pub struct WorkerProcess {
    id: u64,
    command: Arc<WorkerCommand>,
    endpoint: String,
    pid: Option<u32>,
    exit: Arc<ExitHandle>,
    channel: Option<IpcStream>,
    request_count: u64,
    /// Part of `request_count` already reported to the pool
    reported_requests: u64,
    state: WorkerState,
    in_pool: bool,
    idle_since: Instant,
}

impl WorkerProcess {
    pub fn new(command: Arc<WorkerCommand>) -> Self {
        Self {
            id: NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed),
            command,
            endpoint: String::new(),
            pid: None,
            exit: Arc::new(ExitHandle::default()),
            channel: None,
            request_count: 0,
            reported_requests: 0,
            state: WorkerState::Starting,
            in_pool: false,
            idle_since: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    pub fn state(&self) -> WorkerState {
        if self.exit.is_closed() {
            WorkerState::Closed
        } else {
            self.state
        }
    }

    pub fn is_closed(&self) -> bool {
        self.exit.is_closed()
    }

    pub fn in_pool(&self) -> bool {
        self.in_pool
    }

    pub fn idle_since(&self) -> Instant {
        self.idle_since
    }

    pub fn has_channel(&self) -> bool {
        self.channel.is_some()
    }

    pub fn exit_handle(&self) -> Arc<ExitHandle> {
        Arc::clone(&self.exit)
    }

    pub(crate) fn set_in_pool(&mut self, in_pool: bool) {
        self.in_pool = in_pool;
    }

    pub(crate) fn mark_in_use(&mut self) {
        self.state = WorkerState::InUse;
    }

    /// Reset the idle clock and leave the in-use state
    pub(crate) fn touch_idle(&mut self) {
        self.idle_since = Instant::now();
        self.state = WorkerState::Idle;
    }

    /// Connections opened since the last call
    pub(crate) fn take_unreported_requests(&mut self) -> u64 {
        let fresh = self.request_count - self.reported_requests;
        self.reported_requests = self.request_count;
        fresh
    }

    /// Drop the IPC channel, if one is open
    pub fn close_channel(&mut self) {
        self.channel = None;
    }

    /// Spawn the OS process on a freshly generated endpoint.
    ///
    /// The spawn is retried once. The returned child must be handed to
    /// [`supervise`]; it is the only place that waits on or kills it.
    pub fn try_start(&mut self) -> Result<Child, PoolError> {
        self.endpoint = new_endpoint(&self.command.socket_dir);
        self.request_count = 0;
        self.reported_requests = 0;
        self.channel = None;
        self.pid = None;
        self.state = WorkerState::Starting;
        self.exit = Arc::new(ExitHandle::default());

        #[cfg(unix)]
        std::fs::create_dir_all(&self.command.socket_dir).map_err(|e| PoolError::Spawn {
            command: self.command.exec_path.clone(),
            source: e,
        })?;

        let mut attempt = 1;
        loop {
            match self.command.build(&self.endpoint).spawn() {
                Ok(child) => {
                    self.pid = child.id();
                    info!(
                        worker = self.id,
                        pid = self.pid,
                        endpoint = %self.endpoint,
                        command = %self.command.exec_path,
                        "Worker process spawned"
                    );
                    return Ok(child);
                }
                Err(e) if attempt < SPAWN_ATTEMPTS => {
                    warn!(
                        worker = self.id,
                        attempt,
                        command = %self.command.exec_path,
                        error = %e,
                        "Worker spawn failed, retrying"
                    );
                    attempt += 1;
                }
                Err(e) => {
                    return Err(PoolError::Spawn {
                        command: self.command.exec_path.clone(),
                        source: e,
                    });
                }
            }
        }
    }

    /// Open one IPC channel to the running worker.
    ///
    /// Any previously open channel is closed first. `request_count` grows by
    /// one only when the connection succeeds.
    pub async fn connect(&mut self) -> Result<(), PoolError> {
        self.channel = None;
        let stream = self.dial().await?;
        self.channel = Some(stream);
        Ok(())
    }

    async fn dial(&mut self) -> Result<IpcStream, PoolError> {
        let deadline = Instant::now() + self.command.connect_timeout;
        loop {
            match open_channel(&self.endpoint).await {
                Ok(stream) => {
                    self.request_count += 1;
                    debug!(
                        worker = self.id,
                        endpoint = %self.endpoint,
                        request_count = self.request_count,
                        "Connected to worker"
                    );
                    return Ok(stream);
                }
                Err(e) if is_not_ready(&e) && !self.is_closed() && Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(CONNECT_RETRY_INTERVAL_MS)).await;
                }
                Err(e) => {
                    return Err(PoolError::Connect {
                        endpoint: self.endpoint.clone(),
                        source: e,
                    });
                }
            }
        }
    }

    /// Bridge `client` to a fresh IPC channel until both directions finish.
    ///
    /// Blocks for the whole session. The channel is closed before returning.
    pub async fn proxy<S>(&mut self, client: &mut S) -> Result<ProxyOutcome, PoolError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.channel = None;
        let mut channel = self.dial().await?;
        let outcome = proxy::bridge(client, &mut channel).await;
        drop(channel);
        Ok(outcome)
    }

    /// Force-terminate the OS process. Idempotent.
    pub fn kill(&self) {
        debug!(worker = self.id, pid = self.pid, "Killing worker");
        self.exit.kill();
    }

    /// Kill the process as an intentional removal rather than a crash
    pub(crate) fn retire(&mut self) {
        self.channel = None;
        self.exit.retire();
        self.kill();
    }
}

/// Wait for a worker process to exit, killing it when its handle asks to.
///
/// Marks the handle closed and removes the endpoint socket once the process
/// has been reaped.
pub async fn supervise(mut child: Child, exit: Arc<ExitHandle>, endpoint: String) -> Option<ExitStatus> {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = exit.kill.notified() => {
            if let Err(e) = child.start_kill() {
                warn!(endpoint = %endpoint, error = %e, "Failed to kill worker process");
            }
            child.wait().await
        }
    };

    exit.closed.store(true, Ordering::SeqCst);
    remove_endpoint(&endpoint);

    match status {
        Ok(status) => Some(status),
        Err(e) => {
            warn!(endpoint = %endpoint, error = %e, "Error waiting for worker to exit");
            None
        }
    }
}

fn is_not_ready(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
    )
}

#[cfg(unix)]
fn new_endpoint(socket_dir: &Path) -> String {
    socket_dir
        .join(format!("fcgi-{}.sock", Uuid::new_v4().simple()))
        .to_string_lossy()
        .into_owned()
}

#[cfg(windows)]
fn new_endpoint(_socket_dir: &Path) -> String {
    format!(r"\\.\pipe\fcgi-pool\{}", Uuid::new_v4().simple())
}

#[cfg(unix)]
async fn open_channel(endpoint: &str) -> io::Result<IpcStream> {
    tokio::net::UnixStream::connect(endpoint).await
}

#[cfg(windows)]
async fn open_channel(endpoint: &str) -> io::Result<IpcStream> {
    tokio::net::windows::named_pipe::ClientOptions::new().open(endpoint)
}

#[cfg(unix)]
fn remove_endpoint(endpoint: &str) {
    if let Err(e) = std::fs::remove_file(endpoint) {
        if e.kind() != io::ErrorKind::NotFound {
            debug!(endpoint, error = %e, "Failed to remove worker socket");
        }
    }
}

#[cfg(windows)]
fn remove_endpoint(_endpoint: &str) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleeper_command() -> Arc<WorkerCommand> {
        Arc::new(WorkerCommand {
            exec_path: "sh".to_string(),
            // `exec` so killing the shell kills the sleeper too
            args: vec!["-c".to_string(), "exec sleep 60".to_string(), "worker".to_string()],
            env: HashMap::new(),
            socket_dir: std::env::temp_dir().join("fcgi-pool-tests"),
            connect_timeout: Duration::ZERO,
        })
    }

    #[tokio::test]
    async fn test_try_start_generates_unique_endpoints() {
        let command = sleeper_command();
        let mut a = WorkerProcess::new(Arc::clone(&command));
        let mut b = WorkerProcess::new(command);
        assert_ne!(a.id(), b.id());

        let child_a = a.try_start().unwrap();
        let child_b = b.try_start().unwrap();

        assert!(!a.endpoint().is_empty());
        assert_ne!(a.endpoint(), b.endpoint());
        assert!(a.endpoint().ends_with(".sock"));
        assert!(a.pid().is_some());
        assert_eq!(a.state(), WorkerState::Starting);
        assert_eq!(a.request_count(), 0);

        let watch_a = tokio::spawn(supervise(child_a, a.exit_handle(), a.endpoint().to_string()));
        let watch_b = tokio::spawn(supervise(child_b, b.exit_handle(), b.endpoint().to_string()));
        a.kill();
        b.kill();
        watch_a.await.unwrap();
        watch_b.await.unwrap();
    }

    #[tokio::test]
    async fn test_try_start_missing_executable() {
        let mut command = (*sleeper_command()).clone();
        command.exec_path = "/nonexistent/fcgi-worker".to_string();
        let mut worker = WorkerProcess::new(Arc::new(command));

        let err = worker.try_start().unwrap_err();
        assert!(matches!(err, PoolError::Spawn { .. }));
        assert!(err.to_string().contains("/nonexistent/fcgi-worker"));
        assert!(worker.pid().is_none());
    }

    #[tokio::test]
    async fn test_kill_is_idempotent_and_marks_closed() {
        let mut worker = WorkerProcess::new(sleeper_command());
        let child = worker.try_start().unwrap();
        let watcher = tokio::spawn(supervise(
            child,
            worker.exit_handle(),
            worker.endpoint().to_string(),
        ));

        worker.kill();
        worker.kill();

        let status = tokio::time::timeout(Duration::from_secs(5), watcher)
            .await
            .expect("watcher should finish after kill")
            .unwrap();
        assert!(status.is_some());
        assert!(!status.unwrap().success());
        assert!(worker.is_closed());
        assert_eq!(worker.state(), WorkerState::Closed);

        // Killing an exited worker is harmless
        worker.kill();
    }

    #[tokio::test]
    async fn test_supervise_observes_natural_exit() {
        let command = Arc::new(WorkerCommand {
            args: vec!["-c".to_string(), "exit 3".to_string(), "worker".to_string()],
            ..(*sleeper_command()).clone()
        });
        let mut worker = WorkerProcess::new(command);
        let child = worker.try_start().unwrap();

        let status = supervise(child, worker.exit_handle(), worker.endpoint().to_string())
            .await
            .unwrap();
        assert_eq!(status.code(), Some(3));
        assert!(worker.is_closed());
        assert!(!worker.exit_handle().is_retired());
    }

    #[tokio::test]
    async fn test_connect_fails_when_endpoint_not_bound() {
        let mut worker = WorkerProcess::new(sleeper_command());
        let child = worker.try_start().unwrap();
        let watcher = tokio::spawn(supervise(
            child,
            worker.exit_handle(),
            worker.endpoint().to_string(),
        ));

        let err = worker.connect().await.unwrap_err();
        assert!(err.is_connect());
        assert_eq!(worker.request_count(), 0);
        assert!(!worker.has_channel());

        worker.retire();
        watcher.await.unwrap();
        assert!(worker.exit_handle().is_retired());
    }

    #[tokio::test]
    async fn test_proxy_reports_connect_error() {
        let mut worker = WorkerProcess::new(sleeper_command());
        let child = worker.try_start().unwrap();
        let watcher = tokio::spawn(supervise(
            child,
            worker.exit_handle(),
            worker.endpoint().to_string(),
        ));

        let (mut client, _peer) = tokio::io::duplex(64);
        let err = worker.proxy(&mut client).await.unwrap_err();
        assert!(err.is_connect());
        assert_eq!(worker.request_count(), 0);

        worker.kill();
        watcher.await.unwrap();
    }

    #[test]
    fn test_touch_idle_and_in_use() {
        let mut worker = WorkerProcess::new(sleeper_command());
        assert_eq!(worker.state(), WorkerState::Starting);
        assert!(!worker.in_pool());

        worker.mark_in_use();
        assert_eq!(worker.state(), WorkerState::InUse);

        let before = worker.idle_since();
        worker.touch_idle();
        assert_eq!(worker.state(), WorkerState::Idle);
        assert!(worker.idle_since() >= before);
    }

    #[test]
    fn test_worker_command_from_instance() {
        let mut env = HashMap::new();
        env.insert("PHP_FCGI_MAX_REQUESTS".to_string(), "0".to_string());
        let instance = InstanceConfig::new("127.0.0.1:9000", "/usr/bin/php-cgi")
            .with_args(vec!["-c".to_string(), "/etc/php.ini".to_string()])
            .with_env(env);

        let command = WorkerCommand::from_instance(&instance, Path::new("/run/fcgi"));
        assert_eq!(command.exec_path, "/usr/bin/php-cgi");
        assert_eq!(command.args, vec!["-c", "/etc/php.ini"]);
        assert_eq!(command.env.len(), 1);
        assert_eq!(command.socket_dir, PathBuf::from("/run/fcgi"));
        assert_eq!(command.connect_timeout, Duration::from_millis(3000));

        let built = command.build("/run/fcgi/fcgi-1.sock");
        let args: Vec<_> = built.as_std().get_args().collect();
        assert_eq!(args, vec!["-c", "/etc/php.ini", ENDPOINT_FLAG, "/run/fcgi/fcgi-1.sock"]);
    }
}
