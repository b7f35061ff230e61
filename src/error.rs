//! Error types for the harness library

use std::path::PathBuf;

/// Errors raised while connecting, launching, or configuring remote tasks.
///
/// Failures of a remote process itself are not errors: they end up as a
/// [`TaskStatus`](crate::task::TaskStatus) inside the task's report.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("failed to connect to {addr} after {attempts} attempt(s): {reason}")]
    Connect {
        addr: String,
        attempts: u32,
        reason: String,
    },

    #[error("authentication rejected for user {user} ({method})")]
    AuthRejected { user: String, method: String },

    #[error("host key {fingerprint} is not in the pinned list")]
    HostKeyRejected { fingerprint: String },

    #[error("ssh channel error: {0}")]
    Channel(#[from] russh::Error),

    #[error("command refused in safe mode: {0}")]
    UnsafeCommand(String),

    #[error("task {task} never became ready: {reason}")]
    NotReady { task: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T, E = HarnessError> = std::result::Result<T, E>;
