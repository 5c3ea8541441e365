use fcgi_pool::config::Config;
use fcgi_pool::supervisor::{ControlCommand, Supervisor};
use fcgi_pool::{PKG_NAME, VERSION};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "fcgi-pool.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = parse_config_path(std::env::args().skip(1))?;

    // Load before logging so the configured level applies
    let loaded = Config::load(&config_path);
    init_logging(loaded.as_ref().map(|c| c.log_level.as_str()).unwrap_or("info"));

    let config = loaded.map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let supervisor = Supervisor::start(&config, Some(config_path.clone())).await?;

    let (command_tx, command_rx) = mpsc::channel(16);
    tokio::spawn(forward_signals(command_tx));

    supervisor.run(command_rx).await;

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Exiting");
    Ok(())
}

/// `fcgi-pool [--conf <path>]`
fn parse_config_path<I: Iterator<Item = String>>(mut args: I) -> anyhow::Result<PathBuf> {
    let mut path = PathBuf::from(DEFAULT_CONFIG_PATH);
    while let Some(arg) = args.next() {
        if arg == "--conf" {
            let value = args
                .next()
                .ok_or_else(|| anyhow::anyhow!("--conf requires a path"))?;
            path = PathBuf::from(value);
        } else if let Some(value) = arg.strip_prefix("--conf=") {
            path = PathBuf::from(value);
        } else {
            anyhow::bail!("Unknown argument: {} (usage: {} [--conf <path>])", arg, PKG_NAME);
        }
    }
    Ok(path)
}

/// RUST_LOG wins over the configured level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Translate process signals into control commands
async fn forward_signals(commands: mpsc::Sender<ControlCommand>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let streams = (
            signal(SignalKind::terminate()),
            signal(SignalKind::hangup()),
            signal(SignalKind::user_defined1()),
            signal(SignalKind::user_defined2()),
        );
        let (mut sigterm, mut sighup, mut sigusr1, mut sigusr2) = match streams {
            (Ok(term), Ok(hup), Ok(usr1), Ok(usr2)) => (term, hup, usr1, usr2),
            _ => {
                error!("Failed to install signal handlers, stopping");
                let _ = commands.send(ControlCommand::Stop).await;
                return;
            }
        };

        loop {
            let command = tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    ControlCommand::Stop
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    ControlCommand::Stop
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, reloading configuration...");
                    ControlCommand::Reload
                }
                _ = sigusr1.recv() => {
                    info!("Received SIGUSR1, pausing...");
                    ControlCommand::Pause
                }
                _ = sigusr2.recv() => {
                    info!("Received SIGUSR2, continuing...");
                    ControlCommand::Continue
                }
            };

            let stop = command == ControlCommand::Stop;
            if commands.send(command).await.is_err() || stop {
                return;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
        } else {
            info!("Received Ctrl+C, shutting down...");
        }
        let _ = commands.send(ControlCommand::Stop).await;
    }
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        // Non-blocking exclusive lock, held for the life of the process
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        // Only truncate once the lock is ours
        file.set_len(0)?;
        writeln!(&file, "{}", std::process::id())?;
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;

        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting FastCGI process manager");
    info!(
        socket_dir = %config.socket_dir().display(),
        pid_file = ?config.pid_file,
        log_level = %config.log_level,
        "Manager settings"
    );
    for (index, instance) in config.instances.iter().enumerate() {
        info!(
            instance = index,
            bind = %instance.bind,
            command = %instance.exec_path,
            args = ?instance.args,
            min_processes = instance.min_processes,
            max_processes = instance.max_processes,
            max_requests = instance.max_requests_per_process,
            idle_timeout_secs = instance.idle_timeout_secs,
            max_connections = instance.max_connections(),
            "Instance configuration"
        );
    }
}
