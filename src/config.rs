//! Harness configuration
//!
//! Defaults reproduce the classic run: connect to `127.0.0.1` without
//! verifying the host key, drop safe mode, start `build/log_server`, then
//! start `build/log_test_client` once the server is ready.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::command::{CommandLine, SafeMode};
use crate::error::{HarnessError, Result};
use crate::paths;
use crate::readiness::ReadinessProbe;

/// Top-level configuration file structure
#[derive(Debug, Clone, Deserialize)]
pub struct HarnessConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Escape command lines before sending them (off by default)
    #[serde(default)]
    pub safe_mode: bool,
    #[serde(default = "default_tasks", rename = "task")]
    pub tasks: Vec<TaskSpec>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            safe_mode: false,
            tasks: default_tasks(),
        }
    }
}

/// How to authenticate the SSH session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Agent,
    Key,
    Password,
    None,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::Agent => "agent",
            AuthMethod::Key => "key",
            AuthMethod::Password => "password",
            AuthMethod::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "agent" => Some(AuthMethod::Agent),
            "key" => Some(AuthMethod::Key),
            "password" => Some(AuthMethod::Password),
            "none" => Some(AuthMethod::None),
            _ => None,
        }
    }
}

/// SSH connection settings
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth: AuthMethod,
    /// Private key for `auth = "key"`
    pub key_path: PathBuf,
    pub password: Option<String>,
    /// Skip host key verification entirely
    pub accept_any_host_key: bool,
    /// `SHA256:` fingerprints accepted when verification is on
    pub host_key_fingerprints: Vec<String>,
    /// Total connect attempts, including the first
    pub connect_attempts: u32,
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 22,
            user: whoami::username(),
            auth: AuthMethod::Agent,
            key_path: paths::default_key_path(),
            password: None,
            accept_any_host_key: true,
            host_key_fingerprints: Vec::new(),
            connect_attempts: 3,
            connect_timeout_ms: 10_000,
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("auth", &self.auth)
            .field("key_path", &self.key_path)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("accept_any_host_key", &self.accept_any_host_key)
            .field("host_key_fingerprints", &self.host_key_fingerprints)
            .field("connect_attempts", &self.connect_attempts)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .finish()
    }
}

impl ConnectionConfig {
    /// `host:port` as passed to the SSH client
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// One remote process to launch
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    /// Program path; `{cwd}` expands to the local working directory
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Earlier task that must be ready before this one starts
    pub wait_for: Option<String>,
    pub ready_pattern: Option<String>,
    pub ready_delay_ms: Option<u64>,
    /// Give up on readiness after this long
    pub ready_timeout_ms: Option<u64>,
    /// Terminate the remote process after this long
    pub timeout_ms: Option<u64>,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            wait_for: None,
            ready_pattern: None,
            ready_delay_ms: None,
            ready_timeout_ms: None,
            timeout_ms: None,
        }
    }

    pub fn command_line(&self, cwd: &Path) -> CommandLine {
        let program = self.command.replace("{cwd}", &cwd.to_string_lossy());
        CommandLine::new(program).args(self.args.iter().cloned())
    }

    /// A pattern wins over a delay; with neither the task is ready on start
    pub fn readiness(&self) -> ReadinessProbe {
        if let Some(pattern) = &self.ready_pattern {
            ReadinessProbe::Pattern(pattern.clone())
        } else if let Some(ms) = self.ready_delay_ms {
            ReadinessProbe::Delay(Duration::from_millis(ms))
        } else {
            ReadinessProbe::Immediate
        }
    }

    pub fn ready_timeout(&self) -> Option<Duration> {
        self.ready_timeout_ms.map(Duration::from_millis)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

fn default_tasks() -> Vec<TaskSpec> {
    let mut server = TaskSpec::new("server", "{cwd}/build/log_server");
    server.ready_delay_ms = Some(1000);

    let mut client = TaskSpec::new("client", "{cwd}/build/log_test_client");
    client.wait_for = Some("server".to_string());

    vec![server, client]
}

impl HarnessConfig {
    /// Load from a TOML file; a missing file yields the defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!("config not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| HarnessError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::from_toml(&content)
            .map_err(|e| HarnessError::Config(format!("{}: {}", path.display(), e)))?;

        tracing::info!(
            "loaded {} task(s) from {}",
            config.tasks.len(),
            path.display()
        );

        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| HarnessError::Config(e.to_string()))
    }

    /// Apply `SSHHARNESS_*` environment overrides
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(host) = std::env::var("SSHHARNESS_HOST") {
            self.connection.host = host;
        }
        if let Ok(port) = std::env::var("SSHHARNESS_PORT") {
            self.connection.port = port
                .parse()
                .map_err(|_| HarnessError::Config(format!("SSHHARNESS_PORT={port} is not a port")))?;
        }
        if let Ok(user) = std::env::var("SSHHARNESS_USER") {
            self.connection.user = user;
        }
        if let Ok(password) = std::env::var("SSHHARNESS_PASSWORD") {
            self.connection.password = Some(password);
        }
        Ok(())
    }

    pub fn safe_mode(&self) -> SafeMode {
        SafeMode::from_flag(self.safe_mode)
    }

    /// Reject configurations the harness cannot run
    pub fn validate(&self) -> Result<()> {
        if self.tasks.is_empty() {
            return Err(HarnessError::Config("no tasks configured".to_string()));
        }

        if self.connection.auth == AuthMethod::Password && self.connection.password.is_none() {
            return Err(HarnessError::Config(
                "password authentication selected but no password given".to_string(),
            ));
        }

        if !self.connection.accept_any_host_key && self.connection.host_key_fingerprints.is_empty() {
            return Err(HarnessError::Config(
                "host key verification is on but no fingerprints are pinned".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for task in &self.tasks {
            if task.name.trim().is_empty() {
                return Err(HarnessError::Config("task with empty name".to_string()));
            }
            if task.command.trim().is_empty() {
                return Err(HarnessError::Config(format!(
                    "task {} has an empty command",
                    task.name
                )));
            }
            // wait_for may only point backwards, which rules out cycles
            if let Some(dep) = &task.wait_for {
                if !seen.contains(dep.as_str()) {
                    return Err(HarnessError::Config(format!(
                        "task {} waits for {}, which is not an earlier task",
                        task.name, dep
                    )));
                }
            }
            if !seen.insert(task.name.as_str()) {
                return Err(HarnessError::Config(format!(
                    "duplicate task name {}",
                    task.name
                )));
            }
        }

        Ok(())
    }
}
