use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Global configuration for the process manager
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Log filter used when RUST_LOG is not set (default: info)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,

    /// Directory holding the workers' UNIX domain sockets
    pub socket_dir: Option<String>,

    /// One entry per TCP listener
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

/// Configuration for a single listener and its worker pool
///
/// # Security Warning
///
/// `exec_path` and `args` are executed directly with the permissions of the
/// manager. Configuration files must be protected accordingly.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct InstanceConfig {
    /// TCP address the listener binds, e.g. "127.0.0.1:9000"
    pub bind: String,

    /// Worker executable (e.g. php-cgi)
    pub exec_path: String,

    /// Arguments passed before the reserved `-b <endpoint>` pair
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables added to the manager's environment
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Workers started eagerly and kept alive (default: 2)
    #[serde(default = "default_min_processes")]
    pub min_processes: usize,

    /// Upper bound of workers owned by the pool (default: 4)
    #[serde(default = "default_max_processes")]
    pub max_processes: usize,

    /// Requests a worker serves before it is recycled (default: 5000)
    #[serde(default = "default_max_requests_per_process")]
    pub max_requests_per_process: u64,

    /// Seconds an idle worker may sit unused before it is reclaimed (default: 20, 0 disables)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Concurrent client connections accepted (default: max_processes)
    pub max_connections: Option<usize>,

    /// How long to keep retrying a worker endpoint that is not yet bound (default: 3000)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

impl InstanceConfig {
    /// Create a new instance config with defaults
    pub fn new(bind: &str, exec_path: &str) -> Self {
        Self {
            bind: bind.to_string(),
            exec_path: exec_path.to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            min_processes: default_min_processes(),
            max_processes: default_max_processes(),
            max_requests_per_process: default_max_requests_per_process(),
            idle_timeout_secs: default_idle_timeout(),
            max_connections: None,
            connect_timeout_ms: default_connect_timeout(),
        }
    }

    /// Set arguments (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set environment variables (builder pattern)
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Set pool sizing (builder pattern)
    pub fn with_processes(mut self, min: usize, max: usize) -> Self {
        self.min_processes = min;
        self.max_processes = max;
        self
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections.unwrap_or(self.max_processes).max(1)
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, String> {
        self.bind
            .parse()
            .map_err(|e| format!("invalid bind address '{}': {}", self.bind, e))
    }

    /// Validate the instance configuration
    pub fn validate(&self, index: usize) -> Result<(), String> {
        if self.exec_path.trim().is_empty() {
            return Err(format!("Instance #{}: 'exec_path' must not be empty", index));
        }

        if let Err(e) = self.bind_addr() {
            return Err(format!("Instance #{}: {}", index, e));
        }

        if self.min_processes > self.max_processes && self.max_processes > 0 {
            return Err(format!(
                "Instance #{}: 'min_processes' ({}) exceeds 'max_processes' ({})",
                index, self.min_processes, self.max_processes
            ));
        }

        Ok(())
    }

    /// Replace unusable limits with safe values
    pub fn normalize(&mut self, index: usize) {
        if self.max_requests_per_process < 1 {
            warn!(instance = index, "max_requests_per_process is less than 1, using 500");
            self.max_requests_per_process = 500;
        }

        if self.max_processes < 1 {
            warn!(instance = index, "max_processes is less than 1, using 4");
            self.max_processes = 4;
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_min_processes() -> usize {
    2
}

fn default_max_processes() -> usize {
    4
}

fn default_max_requests_per_process() -> u64 {
    5000
}

fn default_idle_timeout() -> u64 {
    20 // seconds
}

fn default_connect_timeout() -> u64 {
    3000 // 3 seconds for a fresh worker to bind its socket
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            pid_file: None,
            socket_dir: None,
            instances: Vec::new(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse, normalize and validate configuration text
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        for (index, instance) in config.instances.iter_mut().enumerate() {
            instance.normalize(index);
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.instances.is_empty() {
            errors.push("at least one [[instances]] entry is required".to_string());
        }

        for (index, instance) in self.instances.iter().enumerate() {
            if let Err(e) = instance.validate(index) {
                errors.push(e);
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Directory where worker endpoints are created
    pub fn socket_dir(&self) -> PathBuf {
        self.socket_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("fcgi-pool"))
    }
}
