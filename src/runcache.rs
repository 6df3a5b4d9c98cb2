//! Per-task cache orchestration: restore, log replay, capture, save.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::{Cache, CacheSource, CacheState};
use crate::config::OutputMode;
use crate::task::PackageTask;
use crate::ui::PrefixedUi;

/// Run-wide cache behavior knobs.
#[derive(Debug, Clone, Default)]
pub struct RunCacheOpts {
    /// Never consult the cache (force execution)
    pub skip_reads: bool,
    /// Never write to the cache
    pub skip_writes: bool,
    /// Overrides every task's own output mode
    pub output_mode_override: Option<OutputMode>,
}

/// Hands out a [`TaskCache`] per node, bound to the node's hash.
pub struct RunCache {
    cache: Arc<dyn Cache>,
    repo_root: PathBuf,
    opts: RunCacheOpts,
}

impl RunCache {
    pub fn new(cache: Arc<dyn Cache>, repo_root: PathBuf, opts: RunCacheOpts) -> Self {
        Self {
            cache,
            repo_root,
            opts,
        }
    }

    pub fn cache_state(&self, hash: &str) -> CacheState {
        self.cache.exists(hash).unwrap_or_default()
    }

    pub fn task_cache(self: &Arc<Self>, task: &PackageTask, hash: &str) -> TaskCache {
        let output_mode = self
            .opts
            .output_mode_override
            .unwrap_or(task.definition.output_mode);
        TaskCache {
            run_cache: Arc::clone(self),
            task: task.clone(),
            hash: hash.to_string(),
            caching_disabled: !task.definition.cache,
            output_mode,
            expanded_outputs: Vec::new(),
        }
    }

    pub fn shutdown(&self) {
        self.cache.shutdown();
    }
}

/// One node's view of the cache: restore before the command runs, capture
/// after it exits cleanly.
pub struct TaskCache {
    run_cache: Arc<RunCache>,
    task: PackageTask,
    hash: String,
    caching_disabled: bool,
    output_mode: OutputMode,
    expanded_outputs: Vec<String>,
}

impl TaskCache {
    pub fn output_mode(&self) -> OutputMode {
        self.output_mode
    }

    pub fn expanded_outputs(&self) -> Vec<String> {
        self.expanded_outputs.clone()
    }

    fn log_file_abs(&self) -> PathBuf {
        self.run_cache.repo_root.join(self.task.log_file())
    }

    /// Restore this node's artifact if present. A restore error is a miss
    /// with a warning. Returns the hit tier and the recorded duration.
    pub fn restore_outputs(&mut self, ui: &PrefixedUi) -> Option<(CacheSource, u64)> {
        if self.caching_disabled || self.run_cache.opts.skip_reads {
            if matches!(self.output_mode, OutputMode::HashOnly | OutputMode::NewOnly) {
                ui.output(&format!("cache bypass, force executing {}", self.hash));
            }
            return None;
        }

        let restored = match self
            .run_cache
            .cache
            .restore(&self.run_cache.repo_root, &self.hash)
        {
            Ok(restored) => restored,
            Err(err) => {
                ui.warn(&format!("error fetching from cache: {err}"));
                return None;
            }
        };

        let Some(restored) = restored else {
            if matches!(self.output_mode, OutputMode::HashOnly | OutputMode::NewOnly) {
                ui.output(&format!("cache miss, executing {}", self.hash));
            }
            return None;
        };

        self.expanded_outputs = restored.files.clone();

        match self.output_mode {
            OutputMode::Full => {
                ui.output(&format!("cache hit, replaying logs {}", self.hash));
                for line in String::from_utf8_lossy(&restored.log).lines() {
                    ui.output(line);
                }
            }
            OutputMode::HashOnly | OutputMode::NewOnly => {
                ui.output(&format!("cache hit, suppressing logs {}", self.hash));
            }
            OutputMode::ErrorsOnly | OutputMode::None => {}
        }

        Some((restored.source, restored.duration_ms))
    }

    /// Open the log file and return the line sink the command's output is
    /// multiplexed into.
    pub fn output_writer(&self, ui: PrefixedUi) -> Result<TaskOutput> {
        let log_path = self.log_file_abs();
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&log_path)
            .with_context(|| format!("Failed to create log file: {}", log_path.display()))?;
        let stream = matches!(self.output_mode, OutputMode::Full | OutputMode::NewOnly);
        Ok(TaskOutput { file, ui, stream })
    }

    /// In `errors-only` mode the buffered log is emitted now that the task
    /// has failed.
    pub fn on_error(&self, ui: &PrefixedUi) {
        if self.output_mode != OutputMode::ErrorsOnly {
            return;
        }
        if let Ok(log) = std::fs::read_to_string(self.log_file_abs()) {
            for line in log.lines() {
                ui.output(line);
            }
        }
    }

    /// Capture the declared outputs plus the log. Called only after a clean
    /// exit.
    pub fn save_outputs(&mut self, duration_ms: u64) -> Result<()> {
        if self.caching_disabled || self.run_cache.opts.skip_writes {
            return Ok(());
        }

        let (inclusions, exclusions) = partition_outputs(&self.task.definition.outputs);
        let package_dir = self.run_cache.repo_root.join(&self.task.dir);

        let mut files = std::collections::BTreeSet::new();
        for pattern in &inclusions {
            let full_pattern = package_dir.join(pattern);
            for entry in glob::glob(&full_pattern.to_string_lossy())? {
                let Ok(path) = entry else { continue };
                if !path.is_file() {
                    continue;
                }
                let pkg_rel = path.strip_prefix(&package_dir).unwrap_or(&path);
                if exclusions
                    .iter()
                    .filter_map(|p| glob::Pattern::new(p).ok())
                    .any(|p| p.matches_path(pkg_rel))
                {
                    continue;
                }
                let rel = path
                    .strip_prefix(&self.run_cache.repo_root)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .replace('\\', "/");
                files.insert(rel);
            }
        }

        // The captured log is part of the artifact
        let log_rel = self.task.log_file().to_string_lossy().replace('\\', "/");
        files.insert(log_rel);

        let files: Vec<String> = files.into_iter().collect();
        let log = std::fs::read(self.log_file_abs()).unwrap_or_default();

        self.run_cache.cache.save(
            &self.run_cache.repo_root,
            &self.hash,
            &files,
            &log,
            duration_ms,
            0,
        )?;

        self.expanded_outputs = files;
        Ok(())
    }
}

/// Split declared outputs into inclusion globs and `!`-prefixed exclusions.
pub fn partition_outputs(outputs: &[String]) -> (Vec<String>, Vec<String>) {
    let mut inclusions = Vec::new();
    let mut exclusions = Vec::new();
    for output in outputs {
        match output.strip_prefix('!') {
            Some(stripped) => exclusions.push(stripped.to_string()),
            None => inclusions.push(output.to_string()),
        }
    }
    (inclusions, exclusions)
}

/// Line sink for a running command: always the log file, and the console
/// when the output mode streams.
pub struct TaskOutput {
    file: File,
    ui: PrefixedUi,
    stream: bool,
}

impl TaskOutput {
    pub fn write_line(&mut self, line: &str) {
        let _ = writeln!(self.file, "{line}");
        if self.stream {
            self.ui.output(line);
        }
    }
}
