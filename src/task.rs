//! Remote tasks
//!
//! A [`RemoteTask`] owns one remote command running on the tokio runtime.
//! Status and readiness are published on watch channels so the launcher can
//! poll them while the task runs; the captured output only becomes available
//! through the [`TaskReport`] returned by [`RemoteTask::join`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::CommandLine;
use crate::error::{HarnessError, Result};
use crate::exec::{CommandRunner, ExitStatus, ProcessEvent, RemoteProcess};
use crate::readiness::{PatternScanner, ReadinessProbe};

/// Lifecycle of a remote task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskStatus {
    /// Spawned, remote command not started yet
    Pending,
    Running,
    Exited { code: u32 },
    Signaled { signal: String, core_dumped: bool },
    /// Channel closed before an exit status arrived
    ConnectionDropped,
    TimedOut,
    Cancelled,
    /// Never started, or the task itself blew up
    Failed { error: String },
    /// Not launched because a task it waits for never became ready
    Skipped { reason: String },
}

impl TaskStatus {
    pub fn is_alive(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Exited { code: 0 })
    }

    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Exited { .. } => "exited",
            TaskStatus::Signaled { .. } => "signaled",
            TaskStatus::ConnectionDropped => "connection dropped",
            TaskStatus::TimedOut => "timed out",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Failed { .. } => "failed",
            TaskStatus::Skipped { .. } => "skipped",
        }
    }
}

impl From<ExitStatus> for TaskStatus {
    fn from(status: ExitStatus) -> Self {
        match status {
            ExitStatus::Code(code) => TaskStatus::Exited { code },
            ExitStatus::Signal { name, core_dumped } => TaskStatus::Signaled {
                signal: name,
                core_dumped,
            },
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Exited { code } => write!(f, "exited with code {}", code),
            TaskStatus::Signaled {
                signal,
                core_dumped,
            } => {
                write!(f, "killed by signal {}", signal)?;
                if *core_dumped {
                    write!(f, " (core dumped)")?;
                }
                Ok(())
            }
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
            TaskStatus::Skipped { reason } => write!(f, "skipped: {}", reason),
            other => f.write_str(other.label()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Readiness {
    Waiting,
    Ready,
    Failed(String),
}

/// Everything known about a task once it is over
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub name: String,
    pub command: String,
    pub status: TaskStatus,
    pub stdout: String,
    pub stderr: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
}

impl TaskReport {
    pub fn skipped(name: &str, command: &str, reason: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            status: TaskStatus::Skipped {
                reason: reason.into(),
            },
            stdout: String::new(),
            stderr: String::new(),
            started_at: None,
            finished_at: Utc::now(),
        }
    }

    pub fn success(&self) -> bool {
        self.status.is_success()
    }

    /// Stdout followed by stderr
    pub fn output(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.started_at.map(|start| self.finished_at - start)
    }
}

/// Per-task launch settings
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    pub readiness: ReadinessProbe,
    pub ready_timeout: Option<Duration>,
    /// Terminate the remote process after this long
    pub timeout: Option<Duration>,
}

/// Handle to a remote command running in the background
pub struct RemoteTask {
    name: String,
    command: String,
    status_rx: watch::Receiver<TaskStatus>,
    ready_rx: watch::Receiver<Readiness>,
    cancel: CancellationToken,
    join: JoinHandle<TaskReport>,
}

impl RemoteTask {
    /// Spawn the task; the remote command starts on the runtime right away
    pub fn spawn(
        name: impl Into<String>,
        runner: Arc<dyn CommandRunner>,
        line: CommandLine,
        options: TaskOptions,
        cancel: CancellationToken,
    ) -> Self {
        let name = name.into();
        let command = line.to_string();
        let (status_tx, status_rx) = watch::channel(TaskStatus::Pending);
        let (ready_tx, ready_rx) = watch::channel(Readiness::Waiting);

        let driver = TaskDriver {
            name: name.clone(),
            command: command.clone(),
            status_tx,
            ready_tx,
            cancel: cancel.clone(),
        };
        let join = tokio::spawn(driver.run(runner, line, options));

        Self {
            name,
            command,
            status_rx,
            ready_rx,
            cancel,
            join,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn status(&self) -> TaskStatus {
        self.status_rx.borrow().clone()
    }

    pub fn is_alive(&self) -> bool {
        self.status().is_alive()
    }

    /// Wait until the readiness probe fires
    ///
    /// Fails if the task ends, or its readiness timeout passes, first.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.ready_rx.clone();
        let state = rx
            .wait_for(|r| *r != Readiness::Waiting)
            .await
            .map(|r| r.clone());

        match state {
            Ok(Readiness::Ready) => Ok(()),
            Ok(Readiness::Failed(reason)) => Err(HarnessError::NotReady {
                task: self.name.clone(),
                reason,
            }),
            Ok(Readiness::Waiting) | Err(_) => Err(HarnessError::NotReady {
                task: self.name.clone(),
                reason: "task went away".to_string(),
            }),
        }
    }

    /// Terminate the remote process if it is still running
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the task to finish and collect its report
    pub async fn join(self) -> TaskReport {
        match self.join.await {
            Ok(report) => report,
            Err(e) => {
                let error = if e.is_panic() {
                    format!("task panicked: {}", panic_message(e.into_panic()))
                } else {
                    format!("task aborted: {}", e)
                };
                warn!(task = %self.name, "{}", error);
                TaskReport {
                    name: self.name,
                    command: self.command,
                    status: TaskStatus::Failed { error },
                    stdout: String::new(),
                    stderr: String::new(),
                    started_at: None,
                    finished_at: Utc::now(),
                }
            }
        }
    }
}

/// Why the supervisor loop woke up
enum Wake {
    Event(Option<ProcessEvent>),
    Cancelled,
    TimedOut,
}

/// Background side of a task
struct TaskDriver {
    name: String,
    command: String,
    status_tx: watch::Sender<TaskStatus>,
    ready_tx: watch::Sender<Readiness>,
    cancel: CancellationToken,
}

impl TaskDriver {
    async fn run(
        self,
        runner: Arc<dyn CommandRunner>,
        line: CommandLine,
        options: TaskOptions,
    ) -> TaskReport {
        info!(task = %self.name, command = %self.command, "starting remote command");

        let started = tokio::select! {
            started = runner.execute(&line) => started,
            _ = self.cancel.cancelled() => {
                return self.finish(TaskStatus::Cancelled, None, Vec::new(), Vec::new());
            }
        };

        match started {
            Ok(process) => self.supervise(process, options).await,
            Err(e) => {
                warn!(task = %self.name, "failed to start: {}", e);
                let status = TaskStatus::Failed {
                    error: e.to_string(),
                };
                self.finish(status, None, Vec::new(), Vec::new())
            }
        }
    }

    async fn supervise(&self, mut process: Box<dyn RemoteProcess>, options: TaskOptions) -> TaskReport {
        let started_at = Utc::now();
        let start = Instant::now();
        self.status_tx.send_replace(TaskStatus::Running);

        let mut settled = false;
        let mut scanner = None;
        let mut ready_at = None;
        match &options.readiness {
            ReadinessProbe::Immediate => settled = self.mark_ready(),
            ReadinessProbe::Delay(delay) => ready_at = Some(start + *delay),
            ReadinessProbe::Pattern(pattern) => scanner = Some(PatternScanner::new(pattern.clone())),
        }
        let ready_deadline = options.ready_timeout.map(|t| start + t);
        let kill_at = options.timeout.map(|t| start + t);

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit: Option<ExitStatus> = None;

        let status = loop {
            // The pending read survives timer wakeups; it is only dropped on
            // cancel or run timeout, right before the process is terminated.
            let wake = {
                let mut next = process.next_event();
                loop {
                    tokio::select! {
                        event = &mut next => break Wake::Event(event),
                        _ = self.cancel.cancelled() => break Wake::Cancelled,
                        _ = sleep_until(kill_at) => break Wake::TimedOut,
                        _ = sleep_until(ready_at), if !settled => {
                            settled = self.mark_ready();
                        }
                        _ = sleep_until(ready_deadline), if !settled => {
                            let reason = format!(
                                "not ready within {}ms",
                                options.ready_timeout.unwrap_or_default().as_millis()
                            );
                            self.ready_tx.send_replace(Readiness::Failed(reason));
                            settled = true;
                        }
                    }
                }
            };

            match wake {
                Wake::Cancelled => {
                    self.terminate(process.as_mut()).await;
                    break TaskStatus::Cancelled;
                }
                Wake::TimedOut => {
                    warn!(task = %self.name, "run timeout reached, terminating");
                    self.terminate(process.as_mut()).await;
                    break TaskStatus::TimedOut;
                }
                Wake::Event(Some(ProcessEvent::Stdout(chunk))) => {
                    log_lines(&self.name, "stdout", &chunk);
                    if !settled && scanner.as_mut().is_some_and(|s| s.feed(&chunk)) {
                        settled = self.mark_ready();
                    }
                    stdout.extend_from_slice(&chunk);
                }
                Wake::Event(Some(ProcessEvent::Stderr(chunk))) => {
                    log_lines(&self.name, "stderr", &chunk);
                    if !settled && scanner.as_mut().is_some_and(|s| s.feed(&chunk)) {
                        settled = self.mark_ready();
                    }
                    stderr.extend_from_slice(&chunk);
                }
                Wake::Event(Some(ProcessEvent::Exit(status))) => {
                    debug!(task = %self.name, %status, "exit reported");
                    exit = Some(status);
                }
                Wake::Event(None) => {
                    break match exit.take() {
                        Some(status) => TaskStatus::from(status),
                        None => TaskStatus::ConnectionDropped,
                    }
                }
            }
        };

        if !settled {
            self.ready_tx
                .send_replace(Readiness::Failed(format!("{} before becoming ready", status)));
        }

        self.finish(status, Some(started_at), stdout, stderr)
    }

    fn mark_ready(&self) -> bool {
        debug!(task = %self.name, "ready");
        self.ready_tx.send_replace(Readiness::Ready);
        true
    }

    async fn terminate(&self, process: &mut dyn RemoteProcess) {
        if let Err(e) = process.terminate().await {
            warn!(task = %self.name, "failed to terminate remote process: {}", e);
        }
    }

    fn finish(
        &self,
        status: TaskStatus,
        started_at: Option<DateTime<Utc>>,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    ) -> TaskReport {
        info!(task = %self.name, %status, "task finished");
        if *self.ready_tx.borrow() == Readiness::Waiting {
            self.ready_tx
                .send_replace(Readiness::Failed(status.to_string()));
        }
        self.status_tx.send_replace(status.clone());

        TaskReport {
            name: self.name.clone(),
            command: self.command.clone(),
            status,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            started_at,
            finished_at: Utc::now(),
        }
    }
}

impl Drop for TaskDriver {
    // Runs on unwind too, so a panicking driver never leaves a live status behind
    fn drop(&mut self) {
        if self.status_tx.borrow().is_alive() {
            self.status_tx.send_replace(TaskStatus::Failed {
                error: "task panicked".to_string(),
            });
        }
        if *self.ready_tx.borrow() == Readiness::Waiting {
            self.ready_tx
                .send_replace(Readiness::Failed("task panicked".to_string()));
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn log_lines(task: &str, stream: &str, chunk: &[u8]) {
    for line in String::from_utf8_lossy(chunk).lines() {
        debug!(task, stream, "{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Replays a fixed list of events, each after an optional pause
    struct Replay {
        events: VecDeque<(Duration, Option<ProcessEvent>)>,
    }

    #[async_trait]
    impl RemoteProcess for Replay {
        async fn next_event(&mut self) -> Option<ProcessEvent> {
            match self.events.pop_front() {
                Some((pause, event)) => {
                    tokio::time::sleep(pause).await;
                    match event {
                        Some(event) => Some(event),
                        // A `None` entry parks the process until cancelled
                        None => std::future::pending().await,
                    }
                }
                None => None,
            }
        }

        async fn terminate(&mut self) -> Result<()> {
            self.events.clear();
            Ok(())
        }
    }

    struct OneShot {
        events: std::sync::Mutex<Option<Vec<(Duration, Option<ProcessEvent>)>>>,
    }

    impl OneShot {
        fn new(events: Vec<(Duration, Option<ProcessEvent>)>) -> Arc<Self> {
            Arc::new(Self {
                events: std::sync::Mutex::new(Some(events)),
            })
        }
    }

    #[async_trait]
    impl CommandRunner for OneShot {
        async fn start(&self, _command: &str) -> Result<Box<dyn RemoteProcess>> {
            let events = self.events.lock().unwrap().take().unwrap_or_default();
            Ok(Box::new(Replay {
                events: events.into(),
            }))
        }
    }

    fn out(text: &str) -> Option<ProcessEvent> {
        Some(ProcessEvent::Stdout(text.as_bytes().to_vec()))
    }

    fn exit(code: u32) -> Option<ProcessEvent> {
        Some(ProcessEvent::Exit(ExitStatus::Code(code)))
    }

    fn spawn(runner: Arc<OneShot>, options: TaskOptions) -> RemoteTask {
        RemoteTask::spawn(
            "t",
            runner,
            CommandLine::new("/bin/thing"),
            options,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_output_captured_on_exit() {
        let runner = OneShot::new(vec![
            (Duration::ZERO, out("hello\n")),
            (Duration::ZERO, Some(ProcessEvent::Stderr(b"warn\n".to_vec()))),
            (Duration::ZERO, exit(0)),
        ]);
        let report = spawn(runner, TaskOptions::default()).join().await;
        assert_eq!(report.status, TaskStatus::Exited { code: 0 });
        assert_eq!(report.stdout, "hello\n");
        assert_eq!(report.stderr, "warn\n");
        assert_eq!(report.output(), "hello\nwarn\n");
        assert!(report.started_at.is_some());
        assert!(report.success());
    }

    #[tokio::test]
    async fn test_missing_exit_status_is_connection_drop() {
        let runner = OneShot::new(vec![(Duration::ZERO, out("partial"))]);
        let report = spawn(runner, TaskOptions::default()).join().await;
        assert_eq!(report.status, TaskStatus::ConnectionDropped);
        assert_eq!(report.stdout, "partial");
    }

    #[tokio::test]
    async fn test_signal_exit() {
        let runner = OneShot::new(vec![(
            Duration::ZERO,
            Some(ProcessEvent::Exit(ExitStatus::Signal {
                name: "SEGV".into(),
                core_dumped: true,
            })),
        )]);
        let report = spawn(runner, TaskOptions::default()).join().await;
        assert_eq!(
            report.status,
            TaskStatus::Signaled {
                signal: "SEGV".into(),
                core_dumped: true
            }
        );
        assert!(!report.success());
    }

    #[tokio::test]
    async fn test_pattern_readiness() {
        let runner = OneShot::new(vec![
            (Duration::from_millis(10), out("booting\n")),
            (Duration::from_millis(10), out("listen")),
            (Duration::from_millis(10), out("ing on 5000\n")),
            (Duration::from_millis(50), exit(0)),
        ]);
        let task = spawn(
            runner,
            TaskOptions {
                readiness: ReadinessProbe::Pattern("listening".into()),
                ..Default::default()
            },
        );
        task.wait_ready().await.unwrap();
        assert!(task.is_alive());
        let report = task.join().await;
        assert!(report.success());
    }

    #[tokio::test]
    async fn test_exit_before_ready_fails_readiness() {
        let runner = OneShot::new(vec![(Duration::ZERO, out("nope\n")), (Duration::ZERO, exit(3))]);
        let task = spawn(
            runner,
            TaskOptions {
                readiness: ReadinessProbe::Pattern("listening".into()),
                ..Default::default()
            },
        );
        let err = task.wait_ready().await.unwrap_err();
        assert!(matches!(err, HarnessError::NotReady { .. }));
        assert_eq!(task.join().await.status, TaskStatus::Exited { code: 3 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_readiness() {
        let runner = OneShot::new(vec![(Duration::from_secs(5), exit(0))]);
        let task = spawn(
            runner,
            TaskOptions {
                readiness: ReadinessProbe::Delay(Duration::from_secs(1)),
                ..Default::default()
            },
        );
        let begin = Instant::now();
        task.wait_ready().await.unwrap();
        let waited = begin.elapsed();
        assert!(waited >= Duration::from_secs(1) && waited < Duration::from_secs(5));
        assert!(task.join().await.success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_timeout() {
        let runner = OneShot::new(vec![(Duration::from_secs(10), exit(0))]);
        let task = spawn(
            runner,
            TaskOptions {
                readiness: ReadinessProbe::Pattern("never".into()),
                ready_timeout: Some(Duration::from_secs(2)),
                ..Default::default()
            },
        );
        assert!(task.wait_ready().await.is_err());
        // The process itself keeps running to completion
        assert!(task.join().await.success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_timeout_terminates() {
        let runner = OneShot::new(vec![(Duration::ZERO, out("working\n")), (Duration::ZERO, None)]);
        let task = spawn(
            runner,
            TaskOptions {
                timeout: Some(Duration::from_secs(3)),
                ..Default::default()
            },
        );
        let report = task.join().await;
        assert_eq!(report.status, TaskStatus::TimedOut);
        assert_eq!(report.stdout, "working\n");
    }

    #[tokio::test]
    async fn test_cancel_terminates() {
        let runner = OneShot::new(vec![(Duration::ZERO, None)]);
        let task = spawn(runner, TaskOptions::default());
        task.wait_ready().await.unwrap();
        task.cancel();
        assert_eq!(task.join().await.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_start_failure_is_reported() {
        struct Refuses;

        #[async_trait]
        impl CommandRunner for Refuses {
            async fn start(&self, _command: &str) -> Result<Box<dyn RemoteProcess>> {
                Err(HarnessError::Config("no channel".into()))
            }
        }

        let task = RemoteTask::spawn(
            "t",
            Arc::new(Refuses),
            CommandLine::new("/bin/thing"),
            TaskOptions::default(),
            CancellationToken::new(),
        );
        assert!(task.wait_ready().await.is_err());
        let report = task.join().await;
        assert!(matches!(report.status, TaskStatus::Failed { .. }));
        assert!(report.started_at.is_none());
    }

    #[tokio::test]
    async fn test_panic_is_surfaced_on_join() {
        struct Explodes;

        #[async_trait]
        impl RemoteProcess for Explodes {
            async fn next_event(&mut self) -> Option<ProcessEvent> {
                panic!("boom");
            }

            async fn terminate(&mut self) -> Result<()> {
                Ok(())
            }
        }

        struct ExplodingRunner;

        #[async_trait]
        impl CommandRunner for ExplodingRunner {
            async fn start(&self, _command: &str) -> Result<Box<dyn RemoteProcess>> {
                Ok(Box::new(Explodes))
            }
        }

        let task = RemoteTask::spawn(
            "boom",
            Arc::new(ExplodingRunner),
            CommandLine::new("/bin/thing"),
            TaskOptions::default(),
            CancellationToken::new(),
        );
        let report = task.join().await;
        assert_eq!(
            report.status,
            TaskStatus::Failed {
                error: "task panicked: boom".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_panic_is_visible_before_join() {
        struct ExplodesLater;

        #[async_trait]
        impl RemoteProcess for ExplodesLater {
            async fn next_event(&mut self) -> Option<ProcessEvent> {
                tokio::time::sleep(Duration::from_millis(10)).await;
                panic!("lost the channel");
            }

            async fn terminate(&mut self) -> Result<()> {
                Ok(())
            }
        }

        struct Runner;

        #[async_trait]
        impl CommandRunner for Runner {
            async fn start(&self, _command: &str) -> Result<Box<dyn RemoteProcess>> {
                Ok(Box::new(ExplodesLater))
            }
        }

        let task = RemoteTask::spawn(
            "late",
            Arc::new(Runner),
            CommandLine::new("/bin/thing"),
            TaskOptions {
                readiness: ReadinessProbe::Pattern("never".into()),
                ..Default::default()
            },
            CancellationToken::new(),
        );
        assert!(task.wait_ready().await.is_err());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!task.is_alive());
        assert!(matches!(task.status(), TaskStatus::Failed { .. }));

        let report = task.join().await;
        assert_eq!(
            report.status,
            TaskStatus::Failed {
                error: "task panicked: lost the channel".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_output_survives_readiness_timers() {
        // Both timers fire while the exit is still in flight
        let runner = OneShot::new(vec![
            (Duration::from_millis(100), out("up\n")),
            (Duration::from_secs(4), exit(0)),
        ]);
        let task = spawn(
            runner,
            TaskOptions {
                readiness: ReadinessProbe::Delay(Duration::from_secs(1)),
                ready_timeout: Some(Duration::from_secs(2)),
                ..Default::default()
            },
        );
        let report = task.join().await;
        assert_eq!(report.status, TaskStatus::Exited { code: 0 });
        assert_eq!(report.stdout, "up\n");
    }

    #[test]
    fn test_status_display() {
        assert_eq!(TaskStatus::Exited { code: 1 }.to_string(), "exited with code 1");
        assert_eq!(TaskStatus::Running.to_string(), "running");
        assert!(TaskStatus::Pending.is_alive());
        assert!(!TaskStatus::Cancelled.is_alive());
    }
}
