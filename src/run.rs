//! Run orchestration.
//!
//! Prepares the engine, finalizes every task hash in dependency order, then
//! either emits the dry-run summary or drives the per-node executor: consult
//! the run cache, spawn the command on a miss, capture outputs on success.

use anyhow::{anyhow, Result};
use colored::Colorize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::watch;

use crate::cache::{
    Cache, CacheSource, CacheState, FsCache, NoopCache, RemoteCache, RemoteClient, TieredCache,
};
use crate::config::{Config, OutputMode};
use crate::engine::{Engine, EngineBuilder, ExecutionOptions, DEFAULT_CONCURRENCY};
use crate::error::ProcessError;
use crate::hash::{env_pair_list, env_pairs, GlobalHashSummary, HashTracker};
use crate::process::ProcessManager;
use crate::runcache::{partition_outputs, RunCache, RunCacheOpts, TaskOutput};
use crate::summary::{
    DryRunSummary, EnvVarSummary, GlobalSummary, RunSummary, TaskExecutionSummary, TaskStatus,
    TaskSummary,
};
use crate::task::PackageTask;
use crate::ui::{ColorCache, PrefixedUi, Ui};
use crate::workspace::{PackageGraph, PackageManager};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DryRunMode {
    #[default]
    Off,
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogPrefix {
    None,
    #[default]
    Auto,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub targets: Vec<String>,
    /// Package names restricting the run; empty means every package
    pub filters: Vec<String>,
    pub parallel: bool,
    pub concurrency: usize,
    pub continue_on_error: bool,
    pub log_prefix: LogPrefix,
    pub output_mode: Option<OutputMode>,
    pub summarize: bool,
    pub dry: DryRunMode,
    pub cache_enabled: bool,
    pub pass_through_args: Vec<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            filters: Vec::new(),
            parallel: false,
            concurrency: DEFAULT_CONCURRENCY,
            continue_on_error: false,
            log_prefix: LogPrefix::default(),
            output_mode: None,
            summarize: false,
            dry: DryRunMode::Off,
            cache_enabled: true,
            pass_through_args: Vec::new(),
        }
    }
}

/// One invocation over a workspace.
pub struct Run {
    repo_root: PathBuf,
    config: Config,
    package_graph: PackageGraph,
    package_manager: PackageManager,
    opts: RunOptions,
    ui: Arc<Ui>,
    remote: Option<Box<dyn RemoteClient>>,
}

impl Run {
    pub fn new(
        repo_root: PathBuf,
        config: Config,
        package_graph: PackageGraph,
        opts: RunOptions,
    ) -> Self {
        Self {
            repo_root,
            config,
            package_graph,
            package_manager: PackageManager::default(),
            opts,
            ui: Arc::new(Ui::new()),
            remote: None,
        }
    }

    pub fn with_package_manager(mut self, package_manager: PackageManager) -> Self {
        self.package_manager = package_manager;
        self
    }

    /// Attach a remote cache transport.
    pub fn with_remote(mut self, client: Box<dyn RemoteClient>) -> Self {
        self.remote = Some(client);
        self
    }

    /// Execute the run; the result is the process exit code.
    pub async fn run(mut self) -> Result<i32> {
        let packages_in_scope = self.packages_in_scope()?;

        self.ui.info(&format!(
            "• Packages in scope: {}",
            packages_in_scope.join(", ")
        ));
        self.ui.info(&format!(
            "• Running {} in {} packages",
            self.opts.targets.join(", "),
            packages_in_scope.len()
        ));
        if self.remote.is_some() {
            self.ui.info("• Remote caching enabled");
        } else {
            self.ui.info("• Remote caching disabled");
        }

        let engine = EngineBuilder::new(
            &self.config,
            &self.package_graph,
            &self.opts.targets,
            packages_in_scope,
        )
        .build()
        .map_err(|err| anyhow!("error preparing engine: {err}"))?;

        let global = GlobalHashSummary::compute(
            &self.repo_root,
            &self.config.global.root_files,
            &self.config.global.lockfile,
            &self.config.global.cache_key,
            &self.config.global.env,
        )?;

        let tracker = Arc::new(HashTracker::new());
        let hash_errors = self.finalize_hashes(&engine, &tracker, &global)?;

        let cache = self.open_cache()?;
        let run_cache = Arc::new(RunCache::new(
            cache,
            self.repo_root.clone(),
            RunCacheOpts {
                skip_reads: false,
                skip_writes: false,
                output_mode_override: self.opts.output_mode,
            },
        ));

        if self.opts.dry != DryRunMode::Off {
            if let Some((task_id, err)) = hash_errors.into_iter().next() {
                return Err(err.context(format!("error hashing inputs of {task_id}")));
            }
            let summary = self.dry_run_summary(&engine, &tracker, &global, &run_cache);
            match self.opts.dry {
                DryRunMode::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
                _ => self.print_dry_run_text(&summary),
            }
            return Ok(0);
        }

        let run_summary = Arc::new(RunSummary::new());
        let manager = Arc::new(ProcessManager::new());
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let mut graph_links = HashMap::new();
        for idx in 0..engine.graph().len() {
            let node = engine.graph().node(idx);
            graph_links.insert(
                node.task_id.clone(),
                (
                    engine.graph().dependency_task_ids(idx),
                    engine.graph().dependent_task_ids(idx),
                ),
            );
        }

        let ctx = Arc::new(ExecContext {
            repo_root: self.repo_root.clone(),
            ui: self.ui.clone(),
            color_cache: ColorCache::new(),
            run_cache: run_cache.clone(),
            tracker: tracker.clone(),
            summary: run_summary.clone(),
            manager: manager.clone(),
            package_manager: self.package_manager.clone(),
            continue_on_error: self.opts.continue_on_error,
            log_prefix: self.opts.log_prefix,
            cancel: Arc::new(cancel_tx),
            graph_links,
            global_env: env_pair_list(&global.env),
            targets: self.opts.targets.clone(),
            pass_through_args: self.opts.pass_through_args.clone(),
            hash_errors: Mutex::new(hash_errors),
        });

        let started = Instant::now();
        let exec_opts = ExecutionOptions {
            parallel: self.opts.parallel,
            concurrency: self.opts.concurrency,
        };
        let visitor_ctx = ctx.clone();
        let execution = engine
            .execute(
                move |task| {
                    let ctx = visitor_ctx.clone();
                    async move { ctx.exec(task).await }
                },
                exec_opts,
                cancel_rx,
            )
            .await;

        // Nodes the engine never visited get their terminal entry here
        for task_id in &execution.skipped {
            if let Some(idx) = engine.graph().index_of(task_id) {
                let node = engine.graph().node(idx);
                let hash = tracker.hash_for(task_id).unwrap_or_default();
                run_summary.track(ctx.summarize(
                    node,
                    &hash,
                    CacheState::default(),
                    Some(TaskExecutionSummary {
                        status: TaskStatus::Skipped,
                        duration_ms: 0,
                        exit_code: None,
                    }),
                ));
            }
        }

        let mut exit_code = 0;
        for err in &execution.errors {
            match err.downcast_ref::<ProcessError>() {
                Some(ProcessError::ChildExit { exit_code: code }) => {
                    if *code > exit_code {
                        exit_code = *code;
                    }
                }
                _ => {
                    if exit_code == 0 {
                        exit_code = 1;
                    }
                }
            }
            self.ui.error(&err.to_string());
        }

        run_summary.close(&self.ui, started.elapsed().as_millis() as u64);

        if self.opts.summarize {
            match run_summary.save(&self.repo_root, VERSION) {
                Ok(path) => self
                    .ui
                    .info(&format!("• Run summary written to {}", path.display())),
                Err(err) => self.ui.warn(&format!("failed to write run summary: {err}")),
            }
        }

        self.ui.info("• Writing to cache");
        run_cache.shutdown();

        Ok(exit_code)
    }

    fn packages_in_scope(&self) -> Result<Vec<String>> {
        if self.opts.filters.is_empty() {
            return Ok(self
                .package_graph
                .package_names()
                .into_iter()
                .map(|s| s.to_string())
                .collect());
        }
        let mut scope = Vec::new();
        for filter in &self.opts.filters {
            if !self.package_graph.contains(filter) {
                anyhow::bail!("No package found with name '{filter}' in workspace");
            }
            scope.push(filter.clone());
        }
        scope.sort();
        scope.dedup();
        Ok(scope)
    }

    /// Finalize every task hash in topological order. A node whose inputs
    /// cannot be hashed is recorded here and fails at visit time; its
    /// dependents are left hashless and get skipped.
    fn finalize_hashes(
        &self,
        engine: &Engine,
        tracker: &HashTracker,
        global: &GlobalHashSummary,
    ) -> Result<HashMap<String, anyhow::Error>> {
        let mut errors = HashMap::new();
        for idx in engine.graph().topological_order() {
            let node = engine.graph().node(idx);

            let mut dependency_hashes = Vec::new();
            let mut blocked = false;
            for &dep in engine.graph().dependencies(idx) {
                match tracker.hash_for(&engine.graph().node(dep).task_id) {
                    Some(hash) => dependency_hashes.push(hash),
                    None => {
                        blocked = true;
                        break;
                    }
                }
            }
            if blocked {
                continue;
            }

            let package = self
                .package_graph
                .package(&node.package)
                .ok_or_else(|| anyhow!("unknown package: {}", node.package))?;

            if let Err(err) = tracker.calculate_task_hash(
                &self.repo_root,
                package,
                node,
                dependency_hashes,
                &self.args_for_task(&node.task),
                global,
            ) {
                errors.insert(node.task_id.clone(), err);
            }
        }
        Ok(errors)
    }

    /// Passthrough args apply to the named target tasks only.
    fn args_for_task(&self, task: &str) -> Vec<String> {
        if self.opts.targets.iter().any(|t| t == task) {
            self.opts.pass_through_args.clone()
        } else {
            Vec::new()
        }
    }

    fn open_cache(&mut self) -> Result<Arc<dyn Cache>> {
        if !self.opts.cache_enabled || !self.config.cache.enabled {
            return Ok(Arc::new(NoopCache));
        }
        let dir = self.repo_root.join(self.config.cache.dir());
        let local = FsCache::new(dir)?;
        let remote = self.remote.take().map(|client| RemoteCache::new(client));
        Ok(Arc::new(TieredCache::new(local, remote)))
    }

    fn dry_run_summary(
        &self,
        engine: &Engine,
        tracker: &HashTracker,
        global: &GlobalHashSummary,
        run_cache: &RunCache,
    ) -> DryRunSummary {
        let global_env = env_pair_list(&global.env);
        let mut tasks = Vec::new();

        for idx in 0..engine.graph().len() {
            let node = engine.graph().node(idx);
            let hash = tracker.hash_for(&node.task_id).unwrap_or_default();
            let (outputs, excluded_outputs) = partition_outputs(&node.definition.outputs);
            tasks.push(TaskSummary {
                task_id: node.task_id.clone(),
                task: node.task.clone(),
                package: node.package.clone(),
                hash: hash.clone(),
                cache_state: run_cache.cache_state(&hash),
                command: node.command.clone(),
                outputs,
                excluded_outputs,
                log_file: node.log_file().to_string_lossy().replace('\\', "/"),
                directory: node.dir.to_string_lossy().replace('\\', "/"),
                dependencies: engine.graph().dependency_task_ids(idx),
                dependents: engine.graph().dependent_task_ids(idx),
                resolved_task_definition: node.definition.clone(),
                expanded_inputs: tracker.expanded_inputs(&node.task_id),
                expanded_outputs: tracker.expanded_outputs(&node.task_id),
                framework: String::new(),
                environment_variables: EnvVarSummary {
                    configured: env_pair_list(&env_pairs(&node.definition.env)),
                    inferred: Vec::new(),
                    global: global_env.clone(),
                },
                execution: None,
            });
        }

        DryRunSummary {
            turbo_version: VERSION.to_string(),
            global_hash_summary: GlobalSummary {
                global_file_hash_map: global.global_file_hash_map.clone(),
                root_external_deps_hash: global.root_external_deps_hash.clone(),
                global_cache_key: global.global_cache_key.clone(),
                pipeline: self.config.pipeline.clone(),
            },
            tasks,
        }
    }

    fn print_dry_run_text(&self, summary: &DryRunSummary) {
        self.ui.output("");
        self.ui.output(&"Tasks to Run".bold().to_string());
        for task in &summary.tasks {
            self.ui.output(&format!("{}", task.task_id.bold().cyan()));
            self.ui.output(&format!("  Task          = {}", task.task));
            self.ui.output(&format!("  Package       = {}", task.package));
            self.ui.output(&format!("  Hash          = {}", task.hash));
            self.ui.output(&format!(
                "  Cached (Local) = {}, Cached (Remote) = {}",
                task.cache_state.local, task.cache_state.remote
            ));
            self.ui.output(&format!("  Command       = {}", task.command));
            self.ui.output(&format!("  Directory     = {}", task.directory));
            self.ui.output(&format!("  Log File      = {}", task.log_file));
            self.ui.output(&format!(
                "  Dependencies  = {}",
                task.dependencies.join(", ")
            ));
            self.ui.output(&format!(
                "  Dependents    = {}",
                task.dependents.join(", ")
            ));
        }
    }
}

/// Everything the per-node executor needs, shared across visitor
/// invocations.
struct ExecContext {
    repo_root: PathBuf,
    ui: Arc<Ui>,
    color_cache: ColorCache,
    run_cache: Arc<RunCache>,
    tracker: Arc<HashTracker>,
    summary: Arc<RunSummary>,
    manager: Arc<ProcessManager>,
    package_manager: PackageManager,
    continue_on_error: bool,
    log_prefix: LogPrefix,
    cancel: Arc<watch::Sender<bool>>,
    graph_links: HashMap<String, (Vec<String>, Vec<String>)>,
    global_env: Vec<String>,
    targets: Vec<String>,
    pass_through_args: Vec<String>,
    hash_errors: Mutex<HashMap<String, anyhow::Error>>,
}

impl ExecContext {
    fn prefixed_ui(&self, task: &PackageTask) -> PrefixedUi {
        let prefix = match self.log_prefix {
            LogPrefix::None => String::new(),
            LogPrefix::Auto => self
                .color_cache
                .prefix_with_color(&task.package, &task.output_prefix()),
        };
        PrefixedUi::new(self.ui.clone(), prefix)
    }

    fn args_for_task(&self, task: &str) -> Vec<String> {
        if self.targets.iter().any(|t| t == task) {
            self.pass_through_args.clone()
        } else {
            Vec::new()
        }
    }

    fn summarize(
        &self,
        task: &PackageTask,
        hash: &str,
        cache_state: CacheState,
        execution: Option<TaskExecutionSummary>,
    ) -> TaskSummary {
        let (outputs, excluded_outputs) = partition_outputs(&task.definition.outputs);
        let (dependencies, dependents) = self
            .graph_links
            .get(&task.task_id)
            .cloned()
            .unwrap_or_default();
        TaskSummary {
            task_id: task.task_id.clone(),
            task: task.task.clone(),
            package: task.package.clone(),
            hash: hash.to_string(),
            cache_state,
            command: task.command.clone(),
            outputs,
            excluded_outputs,
            log_file: task.log_file().to_string_lossy().replace('\\', "/"),
            directory: task.dir.to_string_lossy().replace('\\', "/"),
            dependencies,
            dependents,
            resolved_task_definition: task.definition.clone(),
            expanded_inputs: self.tracker.expanded_inputs(&task.task_id),
            expanded_outputs: self.tracker.expanded_outputs(&task.task_id),
            framework: String::new(),
            environment_variables: EnvVarSummary {
                configured: env_pair_list(&env_pairs(&task.definition.env)),
                inferred: Vec::new(),
                global: self.global_env.clone(),
            },
            execution,
        }
    }

    fn record(
        &self,
        task: &PackageTask,
        hash: &str,
        cache_state: CacheState,
        status: TaskStatus,
        duration_ms: u64,
        exit_code: Option<i32>,
    ) {
        self.summary.track(self.summarize(
            task,
            hash,
            cache_state,
            Some(TaskExecutionSummary {
                status,
                duration_ms,
                exit_code,
            }),
        ));
    }

    /// The per-node workflow: hash gate, cache restore, spawn, capture,
    /// save.
    async fn exec(&self, task: PackageTask) -> Result<()> {
        // A node whose inputs failed to hash fails here; its dependents are
        // skipped by the engine
        if let Some(err) = self.hash_errors.lock().unwrap().remove(&task.task_id) {
            let prefixed = self.prefixed_ui(&task);
            prefixed.error(&format!("error hashing inputs: {err:#}"));
            self.record(&task, "", CacheState::default(), TaskStatus::Failed, 0, None);
            return Err(err);
        }

        let Some(hash) = self.tracker.hash_for(&task.task_id) else {
            // Only reachable in parallel mode, where an upstream hashing
            // failure does not gate scheduling
            self.record(&task, "", CacheState::default(), TaskStatus::Skipped, 0, None);
            return Ok(());
        };

        // No command in this package: a zero-work barrier
        if task.command.is_empty() {
            self.record(
                &task,
                &hash,
                CacheState::default(),
                TaskStatus::Skipped,
                0,
                None,
            );
            return Ok(());
        }

        let prefixed = self.prefixed_ui(&task);
        let mut cache_state = self.run_cache.cache_state(&hash);
        let mut task_cache = self.run_cache.task_cache(&task, &hash);

        if let Some((source, duration_ms)) = task_cache.restore_outputs(&prefixed) {
            match source {
                CacheSource::Local => cache_state.local = true,
                CacheSource::Remote => cache_state.remote = true,
            }
            self.tracker
                .set_expanded_outputs(&task.task_id, task_cache.expanded_outputs());
            self.record(
                &task,
                &hash,
                cache_state,
                TaskStatus::Cached,
                duration_ms,
                Some(0),
            );
            return Ok(());
        }

        let mut command = tokio::process::Command::new(&self.package_manager.command);
        command
            .args(
                self.package_manager
                    .task_args(&task.task, &self.args_for_task(&task.task)),
            )
            .current_dir(self.repo_root.join(&task.dir))
            .env("TURBO_HASH", &hash);

        let started = Instant::now();
        let mut child = match self.manager.spawn(&mut command) {
            Ok(child) => child,
            Err(ProcessError::Closing) => {
                // Already tearing down; not a failure of this task
                self.record(&task, &hash, cache_state, TaskStatus::Skipped, 0, None);
                return Ok(());
            }
            Err(err) => {
                prefixed.error(&format!("ERROR: command finished with error: {err}"));
                self.record(&task, &hash, cache_state, TaskStatus::Failed, 0, None);
                if !self.continue_on_error {
                    self.manager.close();
                    let _ = self.cancel.send(true);
                }
                return Err(anyhow::Error::new(err));
            }
        };

        let output = match task_cache.output_writer(prefixed.clone()) {
            Ok(output) => output,
            Err(err) => {
                prefixed.error(&format!("{err:#}"));
                self.record(&task, &hash, cache_state, TaskStatus::Failed, 0, None);
                if !self.continue_on_error {
                    self.manager.close();
                    let _ = self.cancel.send(true);
                }
                return Err(err);
            }
        };
        let output = Arc::new(Mutex::new(output));

        let stdout = child.take_stdout();
        let stderr = child.take_stderr();
        futures::future::join(
            stream_lines(stdout, output.clone()),
            stream_lines(stderr, output.clone()),
        )
        .await;
        drop(output);

        let duration_ms = started.elapsed().as_millis() as u64;
        match child.wait().await {
            Ok(()) => {
                if let Err(err) = task_cache.save_outputs(duration_ms) {
                    prefixed.warn(&format!("error caching output: {err}"));
                }
                self.tracker
                    .set_expanded_outputs(&task.task_id, task_cache.expanded_outputs());
                self.record(
                    &task,
                    &hash,
                    cache_state,
                    TaskStatus::Built,
                    duration_ms,
                    Some(0),
                );
                Ok(())
            }
            Err(ProcessError::Closing) => {
                self.record(&task, &hash, cache_state, TaskStatus::Skipped, 0, None);
                Ok(())
            }
            Err(err) => {
                task_cache.on_error(&prefixed);
                self.record(
                    &task,
                    &hash,
                    cache_state,
                    TaskStatus::Failed,
                    duration_ms,
                    err.exit_code(),
                );
                if !self.continue_on_error {
                    prefixed.error(&format!("ERROR: command finished with error: {err}"));
                    self.manager.close();
                    let _ = self.cancel.send(true);
                } else {
                    prefixed.warn("command finished with error, but continuing...");
                }
                Err(anyhow::Error::new(err))
            }
        }
    }
}

async fn stream_lines<R>(reader: Option<R>, output: Arc<Mutex<TaskOutput>>)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        output.lock().unwrap().write_line(&line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::TempDir;

    fn write_workspace(scripts: &[(&str, &[(&str, &str)])]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (name, tasks) in scripts {
            let pkg_dir = dir.path().join("packages").join(name);
            fs::create_dir_all(&pkg_dir).unwrap();
            let scripts: BTreeMap<String, String> = tasks
                .iter()
                .map(|(t, c)| (t.to_string(), c.to_string()))
                .collect();
            let manifest = serde_json::json!({ "name": name, "scripts": scripts });
            fs::write(pkg_dir.join("package.json"), manifest.to_string()).unwrap();
        }
        dir
    }

    fn load_graph(dir: &TempDir) -> PackageGraph {
        PackageGraph::discover(dir.path(), &["packages/*".to_string()]).unwrap()
    }

    fn echo_manager() -> PackageManager {
        // `echo run <task>` exits zero and produces a line of output
        PackageManager {
            command: "echo".to_string(),
            arg_separator: vec!["--".to_string()],
        }
    }

    fn base_config() -> Config {
        toml::from_str(
            r#"
[pipeline.build]
dependsOn = ["^build"]
outputs = ["dist/**"]
env = ["MONOX_RUN_TEST_ENV"]
"#,
        )
        .unwrap()
    }

    fn make_run(dir: &TempDir, opts: RunOptions) -> Run {
        Run::new(
            dir.path().to_path_buf(),
            base_config(),
            load_graph(dir),
            opts,
        )
        .with_package_manager(echo_manager())
    }

    fn saved_statuses(dir: &TempDir) -> Vec<Vec<String>> {
        let runs = dir.path().join(".turbo/runs");
        let mut all = Vec::new();
        for entry in fs::read_dir(runs).unwrap() {
            let path = entry.unwrap().path();
            let value: serde_json::Value =
                serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
            let statuses: Vec<String> = value["tasks"]
                .as_array()
                .unwrap()
                .iter()
                .map(|t| t["execution"]["status"].as_str().unwrap().to_string())
                .collect();
            all.push(statuses);
        }
        all
    }

    #[tokio::test]
    async fn test_second_run_is_fully_cached() {
        let dir = write_workspace(&[
            ("util", &[("build", "echo util")]),
            ("my-app", &[("build", "echo app")]),
        ]);
        let opts = RunOptions {
            targets: vec!["build".to_string()],
            summarize: true,
            ..RunOptions::default()
        };

        let exit = make_run(&dir, opts.clone()).run().await.unwrap();
        assert_eq!(exit, 0);

        let exit = make_run(&dir, opts).run().await.unwrap();
        assert_eq!(exit, 0);

        let runs = saved_statuses(&dir);
        assert_eq!(runs.len(), 2);
        // One run built everything, the other was served entirely from cache
        assert!(runs
            .iter()
            .any(|statuses| statuses.iter().all(|s| s == "built")));
        assert!(runs
            .iter()
            .any(|statuses| statuses.iter().all(|s| s == "cached")));
    }

    #[tokio::test]
    async fn test_missing_target_is_engine_error() {
        let dir = write_workspace(&[("util", &[("build", "echo util")])]);
        let opts = RunOptions {
            targets: vec!["doesnotexist".to_string()],
            dry: DryRunMode::Json,
            ..RunOptions::default()
        };

        let err = make_run(&dir, opts).run().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "error preparing engine: Could not find the following tasks in project: doesnotexist"
        );
    }

    #[tokio::test]
    async fn test_dry_run_shape_and_env_hashing() {
        let dir = write_workspace(&[
            ("util", &[("build", "echo util")]),
            ("my-app", &[("build", "echo app")]),
        ]);
        fs::write(
            dir.path().join("packages/my-app/package.json"),
            serde_json::json!({
                "name": "my-app",
                "dependencies": {"util": "*"},
                "scripts": {"build": "echo app"}
            })
            .to_string(),
        )
        .unwrap();
        let opts = RunOptions {
            targets: vec!["build".to_string()],
            ..RunOptions::default()
        };
        let run = make_run(&dir, opts);

        let engine = EngineBuilder::new(
            &run.config,
            &run.package_graph,
            &run.opts.targets,
            vec!["my-app".to_string(), "util".to_string()],
        )
        .build()
        .unwrap();
        let global = GlobalHashSummary::compute(
            dir.path(),
            &[],
            "package-lock.json",
            "",
            &["MONOX_RUN_TEST_GLOBAL".to_string()],
        )
        .unwrap();
        let tracker = HashTracker::new();
        let errors = run.finalize_hashes(&engine, &tracker, &global).unwrap();
        assert!(errors.is_empty());

        let run_cache = Arc::new(RunCache::new(
            Arc::new(NoopCache),
            dir.path().to_path_buf(),
            RunCacheOpts::default(),
        ));
        let summary = run.dry_run_summary(&engine, &tracker, &global, &run_cache);

        assert_eq!(summary.tasks.len(), 2);
        let ids: Vec<&str> = summary.tasks.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["my-app#build", "util#build"]);

        // An unset variable is fingerprinted as NAME=<sha256 of "">
        let expected = format!(
            "MONOX_RUN_TEST_ENV={}",
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            summary.tasks[0].environment_variables.configured,
            vec![expected]
        );
        assert_eq!(
            summary.tasks[0].environment_variables.global,
            vec![format!(
                "MONOX_RUN_TEST_GLOBAL={}",
                "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
            )]
        );

        // util#build feeds my-app#build
        assert_eq!(summary.tasks[0].dependencies, vec!["util#build"]);
        assert_eq!(summary.tasks[1].dependents, vec!["my-app#build"]);
        assert_eq!(summary.turbo_version, VERSION);

        // Two consecutive dry-runs produce identical JSON
        let tracker2 = HashTracker::new();
        run.finalize_hashes(&engine, &tracker2, &global).unwrap();
        let summary2 = run.dry_run_summary(&engine, &tracker2, &global, &run_cache);
        assert_eq!(
            serde_json::to_string(&summary).unwrap(),
            serde_json::to_string(&summary2).unwrap()
        );
    }

    #[tokio::test]
    async fn test_upstream_change_cascades_downstream() {
        let dir = write_workspace(&[
            ("util", &[("build", "echo util")]),
            ("my-app", &[("build", "echo app")]),
        ]);
        fs::write(
            dir.path().join("packages/my-app/package.json"),
            serde_json::json!({
                "name": "my-app",
                "dependencies": {"util": "*"},
                "scripts": {"build": "echo app"}
            })
            .to_string(),
        )
        .unwrap();
        fs::write(dir.path().join("packages/util/lib.js"), "one").unwrap();

        let run = make_run(
            &dir,
            RunOptions {
                targets: vec!["build".to_string()],
                ..RunOptions::default()
            },
        );
        let engine = EngineBuilder::new(
            &run.config,
            &run.package_graph,
            &run.opts.targets,
            vec!["my-app".to_string(), "util".to_string()],
        )
        .build()
        .unwrap();
        let global =
            GlobalHashSummary::compute(dir.path(), &[], "package-lock.json", "", &[]).unwrap();

        let tracker = HashTracker::new();
        run.finalize_hashes(&engine, &tracker, &global).unwrap();
        let util_before = tracker.hash_for("util#build").unwrap();
        let app_before = tracker.hash_for("my-app#build").unwrap();

        // Changing a util file changes both hashes
        fs::write(dir.path().join("packages/util/lib.js"), "two").unwrap();
        let tracker = HashTracker::new();
        run.finalize_hashes(&engine, &tracker, &global).unwrap();
        assert_ne!(tracker.hash_for("util#build").unwrap(), util_before);
        assert_ne!(tracker.hash_for("my-app#build").unwrap(), app_before);

        // Changing a my-app file changes only my-app's hash
        let util_mid = tracker.hash_for("util#build").unwrap();
        let app_mid = tracker.hash_for("my-app#build").unwrap();
        fs::write(dir.path().join("packages/my-app/local.js"), "x").unwrap();
        let tracker = HashTracker::new();
        run.finalize_hashes(&engine, &tracker, &global).unwrap();
        assert_eq!(tracker.hash_for("util#build").unwrap(), util_mid);
        assert_ne!(tracker.hash_for("my-app#build").unwrap(), app_mid);
    }

    #[tokio::test]
    async fn test_failure_without_continue_stops_dependents() {
        let dir = write_workspace(&[
            ("util", &[("build", "echo util")]),
            ("my-app", &[("build", "echo app")]),
        ]);
        fs::write(
            dir.path().join("packages/my-app/package.json"),
            serde_json::json!({
                "name": "my-app",
                "dependencies": {"util": "*"},
                "scripts": {"build": "echo app"}
            })
            .to_string(),
        )
        .unwrap();

        let opts = RunOptions {
            targets: vec!["build".to_string()],
            summarize: true,
            ..RunOptions::default()
        };
        // `false run build` fails every spawned task
        let run = Run::new(
            dir.path().to_path_buf(),
            base_config(),
            load_graph(&dir),
            opts,
        )
        .with_package_manager(PackageManager {
            command: "false".to_string(),
            arg_separator: vec![],
        });

        let exit = run.run().await.unwrap();
        assert_eq!(exit, 1);

        let runs = saved_statuses(&dir);
        assert_eq!(runs.len(), 1);
        let statuses = &runs[0];
        assert!(statuses.contains(&"failed".to_string()), "{statuses:?}");
        assert!(statuses.contains(&"skipped".to_string()), "{statuses:?}");
    }
}
