//! Remote execution seam
//!
//! `RemoteSession` implements these traits over SSH; tests drive the harness
//! with scripted implementations instead.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;

use crate::command::{CommandLine, SafeMode};
use crate::error::Result;

/// How a remote process ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    Code(u32),
    Signal { name: String, core_dumped: bool },
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Code(0))
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Code(code) => write!(f, "exit code {}", code),
            ExitStatus::Signal { name, core_dumped } => {
                write!(f, "signal {}", name)?;
                if *core_dumped {
                    write!(f, " (core dumped)")?;
                }
                Ok(())
            }
        }
    }
}

/// Something observed on a running remote process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Exit(ExitStatus),
}

/// A started remote process.
///
/// `next_event` returns `None` once the underlying channel is closed. A
/// process whose events end without an [`ProcessEvent::Exit`] lost its
/// connection.
#[async_trait]
pub trait RemoteProcess: Send {
    /// Wait for the next event.
    ///
    /// The supervisor keeps one call in flight until it completes. It drops
    /// an unfinished call only when it is about to [`terminate`] the process,
    /// so implementations need not be cancel safe.
    ///
    /// [`terminate`]: RemoteProcess::terminate
    async fn next_event(&mut self) -> Option<ProcessEvent>;

    /// Ask the remote side to stop the process and close the channel
    async fn terminate(&mut self) -> Result<()>;
}

/// Starts remote commands
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Guard applied by [`CommandRunner::execute`]
    fn safe_mode(&self) -> SafeMode {
        SafeMode::Enabled
    }

    /// Start `command` (already rendered for the remote shell)
    async fn start(&self, command: &str) -> Result<Box<dyn RemoteProcess>>;

    /// Render `line` under the runner's safe mode and start it
    async fn execute(&self, line: &CommandLine) -> Result<Box<dyn RemoteProcess>> {
        let rendered = line.render(self.safe_mode())?;
        self.start(&rendered).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status_success() {
        assert!(ExitStatus::Code(0).success());
        assert!(!ExitStatus::Code(2).success());
        assert!(!ExitStatus::Signal {
            name: "KILL".into(),
            core_dumped: false
        }
        .success());
    }

    #[test]
    fn test_exit_status_display() {
        assert_eq!(ExitStatus::Code(3).to_string(), "exit code 3");
        let sig = ExitStatus::Signal {
            name: "SEGV".into(),
            core_dumped: true,
        };
        assert_eq!(sig.to_string(), "signal SEGV (core dumped)");
    }
}
