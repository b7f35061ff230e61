//! Text and JSON rendering of task status and results

use std::fmt::Write as _;

use crate::harness::{HarnessReport, TaskSet};

/// `task NAME status   = STATUS` per task
pub fn render_statuses(set: &TaskSet) -> String {
    let mut out = String::new();
    for (name, status) in set.statuses() {
        let _ = writeln!(out, "task {} status   = {}", name, status);
    }
    out
}

/// `task NAME is alive = BOOL` per task
pub fn render_liveness(set: &TaskSet) -> String {
    let mut out = String::new();
    for (name, alive) in set.liveness() {
        let _ = writeln!(out, "task {} is alive = {}", name, alive);
    }
    out
}

/// Captured output of every task, followed by a one-line summary each
pub fn render_outputs(report: &HarnessReport) -> String {
    let mut out = String::new();
    for task in &report.tasks {
        let _ = writeln!(out, "\ntask {} output =", task.name);
        let output = task.output();
        out.push_str(&output);
        if !output.is_empty() && !output.ends_with('\n') {
            out.push('\n');
        }
    }

    out.push('\n');
    for task in &report.tasks {
        let elapsed = task
            .duration()
            .map(|d| format!(" in {}ms", d.num_milliseconds()))
            .unwrap_or_default();
        let _ = writeln!(out, "task {} result = {}{}", task.name, task.status, elapsed);
    }
    out
}

pub fn to_json(report: &HarnessReport) -> serde_json::Result<String> {
    serde_json::to_string_pretty(report)
}
