//! sshharness - launch paired remote processes over one SSH session
//!
//! Opens a single SSH session, starts each configured command as a
//! background task (a log server, then its test client once the server is
//! ready), reports status and liveness, joins them, and collects output.
//! The binary is in `main.rs`.

pub mod backoff;
pub mod command;
pub mod config;
pub mod error;
pub mod exec;
pub mod harness;
pub mod paths;
pub mod readiness;
pub mod report;
pub mod session;
pub mod task;

pub use error::{HarnessError, Result};
