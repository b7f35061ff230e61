//! Task orchestration
//!
//! Launches the configured tasks in order over one shared runner. A task
//! that names `wait_for` starts only once that task reports ready; if it
//! never does, the dependent is skipped rather than started blind.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{HarnessConfig, TaskSpec};
use crate::error::Result;
use crate::exec::CommandRunner;
use crate::task::{RemoteTask, TaskOptions, TaskReport, TaskStatus};

/// Launches tasks from a validated configuration
pub struct Harness {
    runner: Arc<dyn CommandRunner>,
    tasks: Vec<TaskSpec>,
    cwd: PathBuf,
    cancel: CancellationToken,
}

impl Harness {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &HarnessConfig, cwd: PathBuf) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            runner,
            tasks: config.tasks.clone(),
            cwd,
            cancel: CancellationToken::new(),
        })
    }

    /// Token that cancels every task launched by this harness
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start every task, honouring readiness dependencies
    ///
    /// Returns once each task has been started or skipped. Tasks keep
    /// running in the background.
    pub async fn launch(&self) -> TaskSet {
        let mut handles: Vec<TaskHandle> = Vec::with_capacity(self.tasks.len());

        for spec in &self.tasks {
            let line = spec.command_line(&self.cwd);

            if let Some(dep) = &spec.wait_for {
                if let Err(reason) = self.wait_for_dependency(&handles, dep).await {
                    warn!(task = %spec.name, dependency = %dep, "not launching: {}", reason);
                    handles.push(TaskHandle::Skipped {
                        name: spec.name.clone(),
                        command: line.to_string(),
                        reason,
                    });
                    continue;
                }
            }

            let options = TaskOptions {
                readiness: spec.readiness(),
                ready_timeout: spec.ready_timeout(),
                timeout: spec.timeout(),
            };
            let task = RemoteTask::spawn(
                spec.name.clone(),
                self.runner.clone(),
                line,
                options,
                self.cancel.child_token(),
            );
            handles.push(TaskHandle::Launched(task));
        }

        TaskSet {
            tasks: handles,
            cancel: self.cancel.clone(),
        }
    }

    async fn wait_for_dependency(&self, handles: &[TaskHandle], dep: &str) -> Result<(), String> {
        let Some(gate) = handles.iter().find(|h| h.name() == dep) else {
            return Err(format!("unknown task {}", dep));
        };

        match gate {
            TaskHandle::Skipped { .. } => Err(format!("{} was skipped", dep)),
            TaskHandle::Launched(task) => {
                info!(dependency = %dep, "waiting for readiness");
                tokio::select! {
                    ready = task.wait_ready() => ready.map_err(|e| e.to_string()),
                    _ = self.cancel.cancelled() => Err("cancelled".to_string()),
                }
            }
        }
    }
}

/// A launched or skipped task
pub enum TaskHandle {
    Launched(RemoteTask),
    Skipped {
        name: String,
        command: String,
        reason: String,
    },
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        match self {
            TaskHandle::Launched(task) => task.name(),
            TaskHandle::Skipped { name, .. } => name,
        }
    }

    pub fn status(&self) -> TaskStatus {
        match self {
            TaskHandle::Launched(task) => task.status(),
            TaskHandle::Skipped { reason, .. } => TaskStatus::Skipped {
                reason: reason.clone(),
            },
        }
    }

    pub fn is_alive(&self) -> bool {
        match self {
            TaskHandle::Launched(task) => task.is_alive(),
            TaskHandle::Skipped { .. } => false,
        }
    }

    pub async fn join(self) -> TaskReport {
        match self {
            TaskHandle::Launched(task) => task.join().await,
            TaskHandle::Skipped {
                name,
                command,
                reason,
            } => TaskReport::skipped(&name, &command, reason),
        }
    }
}

/// Tasks started by [`Harness::launch`], in configuration order
pub struct TaskSet {
    tasks: Vec<TaskHandle>,
    cancel: CancellationToken,
}

impl TaskSet {
    pub fn statuses(&self) -> Vec<(&str, TaskStatus)> {
        self.tasks.iter().map(|t| (t.name(), t.status())).collect()
    }

    pub fn liveness(&self) -> Vec<(&str, bool)> {
        self.tasks.iter().map(|t| (t.name(), t.is_alive())).collect()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn into_tasks(self) -> Vec<TaskHandle> {
        self.tasks
    }

    /// Join every task in order
    pub async fn join_all(self) -> HarnessReport {
        self.join_each(|_| {}).await
    }

    /// Join every task in order, reporting progress through `on_join`
    pub async fn join_each<F>(self, mut on_join: F) -> HarnessReport
    where
        F: FnMut(JoinProgress<'_>),
    {
        let mut reports = Vec::with_capacity(self.tasks.len());
        for handle in self.tasks {
            info!(task = %handle.name(), "joining task");
            on_join(JoinProgress::Joining(handle.name()));
            let report = handle.join().await;
            on_join(JoinProgress::Done(&report));
            reports.push(report);
        }
        HarnessReport::new(reports)
    }
}

/// Progress of [`TaskSet::join_each`]
#[derive(Debug, Clone, Copy)]
pub enum JoinProgress<'a> {
    /// About to wait on the named task
    Joining(&'a str),
    Done(&'a TaskReport),
}

/// Outcome of a whole run
#[derive(Debug, Clone, Serialize)]
pub struct HarnessReport {
    pub tasks: Vec<TaskReport>,
}

impl HarnessReport {
    pub fn new(tasks: Vec<TaskReport>) -> Self {
        Self { tasks }
    }

    /// True iff every task exited with code 0
    pub fn success(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.iter().all(TaskReport::success)
    }

    pub fn task(&self, name: &str) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn failed(&self) -> impl Iterator<Item = &TaskReport> {
        self.tasks.iter().filter(|t| !t.success())
    }
}
