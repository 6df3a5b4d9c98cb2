//! Run and task summaries.
//!
//! One `TaskSummary` per node, appended exactly once inside the lock as a
//! task reaches a terminal status. The dry-run JSON is the stable external
//! contract: camelCase keys, maps ordered, no execution data.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

use crate::cache::CacheState;
use crate::config::TaskDefinition;
use crate::ui::Ui;

/// Terminal status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Built,
    Cached,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Built => "built",
            TaskStatus::Cached => "cached",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecutionSummary {
    pub status: TaskStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVarSummary {
    /// `NAME=<sha256 of value>` for the task's declared variables
    pub configured: Vec<String>,
    pub inferred: Vec<String>,
    /// `NAME=<sha256 of value>` for the run-global variables
    pub global: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub task_id: String,
    pub task: String,
    pub package: String,
    pub hash: String,
    pub cache_state: CacheState,
    pub command: String,
    pub outputs: Vec<String>,
    pub excluded_outputs: Vec<String>,
    pub log_file: String,
    pub directory: String,
    pub dependencies: Vec<String>,
    pub dependents: Vec<String>,
    pub resolved_task_definition: TaskDefinition,
    pub expanded_inputs: BTreeMap<String, String>,
    pub expanded_outputs: Vec<String>,
    pub framework: String,
    pub environment_variables: EnvVarSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<TaskExecutionSummary>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSummary {
    pub global_file_hash_map: BTreeMap<String, String>,
    pub root_external_deps_hash: String,
    pub global_cache_key: String,
    pub pipeline: BTreeMap<String, TaskDefinition>,
}

/// The dry-run JSON document.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DryRunSummary {
    pub turbo_version: String,
    pub global_hash_summary: GlobalSummary,
    pub tasks: Vec<TaskSummary>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StatusCounts {
    pub built: usize,
    pub cached: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.built + self.cached + self.failed + self.skipped
    }
}

/// Accumulates per-task summaries during a run.
#[derive(Debug)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    tasks: Mutex<Vec<TaskSummary>>,
}

impl Default for RunSummary {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SavedRunSummary<'a> {
    id: &'a str,
    turbo_version: &'a str,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    tasks: &'a [TaskSummary],
}

impl RunSummary {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Record a task's summary. Exactly one append per task, inside the
    /// lock.
    pub fn track(&self, summary: TaskSummary) {
        self.tasks.lock().unwrap().push(summary);
    }

    /// All recorded summaries, ordered by task id.
    pub fn tasks(&self) -> Vec<TaskSummary> {
        let mut tasks = self.tasks.lock().unwrap().clone();
        tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        tasks
    }

    pub fn counts(&self) -> StatusCounts {
        let tasks = self.tasks.lock().unwrap();
        let mut counts = StatusCounts::default();
        for task in tasks.iter() {
            match task.execution.as_ref().map(|e| e.status) {
                Some(TaskStatus::Built) => counts.built += 1,
                Some(TaskStatus::Cached) => counts.cached += 1,
                Some(TaskStatus::Failed) => counts.failed += 1,
                Some(TaskStatus::Skipped) | None => counts.skipped += 1,
            }
        }
        counts
    }

    /// Print the closing footer.
    pub fn close(&self, ui: &Ui, total_duration_ms: u64) {
        let counts = self.counts();
        ui.output("");
        ui.output(&format!(
            " {}    {} successful, {} total",
            "Tasks:".bold(),
            counts.built + counts.cached,
            counts.total()
        ));
        ui.output(&format!(
            " {}   {} cached, {} total",
            "Cached:".bold(),
            counts.cached,
            counts.total()
        ));
        if counts.failed > 0 {
            ui.output(&format!(
                " {}   {}",
                "Failed:".bold(),
                counts.failed.to_string().red()
            ));
        }
        if counts.skipped > 0 {
            ui.output(&format!(
                " {}  {}",
                "Skipped:".bold(),
                counts.skipped.to_string().yellow()
            ));
        }
        ui.output(&format!(
            " {}     {:.2}s",
            "Time:".bold(),
            total_duration_ms as f64 / 1000.0
        ));
        ui.output("");
    }

    /// Persist the run summary under `.turbo/runs/`.
    pub fn save(&self, repo_root: &Path, version: &str) -> Result<PathBuf> {
        let runs_dir = repo_root.join(".turbo").join("runs");
        fs::create_dir_all(&runs_dir)
            .with_context(|| format!("Failed to create {}", runs_dir.display()))?;

        let tasks = self.tasks();
        let saved = SavedRunSummary {
            id: &self.run_id,
            turbo_version: version,
            started_at: self.started_at,
            ended_at: Utc::now(),
            tasks: &tasks,
        };

        let path = runs_dir.join(format!("{}.json", self.run_id));
        fs::write(&path, serde_json::to_string_pretty(&saved)?)
            .with_context(|| format!("Failed to write run summary: {}", path.display()))?;
        Ok(path)
    }
}
