//! Bounded-concurrency graph traversal.
//!
//! A node becomes ready when all prerequisites succeeded. Ready nodes are
//! admitted in lexicographic task-id order as pool permits free up, so runs
//! are reproducible. Failure marks every transitive dependent skipped;
//! unrelated branches keep going. A cancel signal stops admission and lets
//! in-flight visitors finish (their children are torn down by the process
//! manager).

use std::collections::{BTreeSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Semaphore};

use super::Engine;

pub const DEFAULT_CONCURRENCY: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct ExecutionOptions {
    /// Ignore dependency edges for scheduling; every node is immediately
    /// ready
    pub parallel: bool,
    /// Worker pool size when not parallel
    pub concurrency: usize,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            parallel: false,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

/// What the traversal observed.
#[derive(Debug, Default)]
pub struct Execution {
    /// Visitor errors, in completion order
    pub errors: Vec<anyhow::Error>,
    /// Task ids never visited: dependents of failures, plus anything
    /// unstarted at cancellation. Sorted.
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl Engine {
    /// Traverse the graph, invoking `visitor` once per visited node.
    pub async fn execute<F, Fut>(
        &self,
        visitor: F,
        opts: ExecutionOptions,
        mut cancel: watch::Receiver<bool>,
    ) -> Execution
    where
        F: Fn(crate::task::PackageTask) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let graph = self.graph();
        let n = graph.len();
        if n == 0 {
            return Execution::default();
        }

        let visitor = Arc::new(visitor);
        let permits = if opts.parallel {
            n
        } else {
            opts.concurrency.max(1)
        };
        let semaphore = Arc::new(Semaphore::new(permits));

        let mut in_degree: Vec<usize> = (0..n)
            .map(|i| {
                if opts.parallel {
                    0
                } else {
                    graph.dependencies(i).len()
                }
            })
            .collect();
        let mut state = vec![NodeState::Pending; n];
        let mut ready: BTreeSet<(String, usize)> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &deg)| deg == 0)
            .map(|(i, _)| (graph.node(i).task_id.clone(), i))
            .collect();

        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, anyhow::Result<()>)>();
        let mut errors = Vec::new();
        let mut outstanding = 0usize;
        let mut halted = *cancel.borrow();
        let mut cancel_closed = false;

        loop {
            if !halted && *cancel.borrow() {
                halted = true;
            }
            if !halted {
                while !ready.is_empty() {
                    let permit = match semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    let (_, idx) = ready.pop_first().unwrap();
                    state[idx] = NodeState::Running;
                    outstanding += 1;

                    let task = graph.node(idx).clone();
                    let visitor = visitor.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let result = visitor(task).await;
                        drop(permit);
                        let _ = tx.send((idx, result));
                    });
                }
            }

            if outstanding == 0 {
                break;
            }

            tokio::select! {
                changed = cancel.changed(), if !cancel_closed => {
                    match changed {
                        Ok(()) => {
                            if *cancel.borrow() {
                                halted = true;
                            }
                        }
                        Err(_) => cancel_closed = true,
                    }
                }
                received = rx.recv() => {
                    let Some((idx, result)) = received else { break };
                    outstanding -= 1;
                    match result {
                        Ok(()) => {
                            state[idx] = NodeState::Succeeded;
                            if !opts.parallel {
                                for &dependent in graph.dependents(idx) {
                                    if state[dependent] != NodeState::Pending {
                                        continue;
                                    }
                                    in_degree[dependent] -= 1;
                                    if in_degree[dependent] == 0 {
                                        ready.insert((
                                            graph.node(dependent).task_id.clone(),
                                            dependent,
                                        ));
                                    }
                                }
                            }
                        }
                        Err(err) => {
                            state[idx] = NodeState::Failed;
                            errors.push(err);
                            if !opts.parallel {
                                // Transitive dependents never become ready
                                let mut queue: VecDeque<usize> =
                                    graph.dependents(idx).iter().copied().collect();
                                while let Some(dependent) = queue.pop_front() {
                                    if state[dependent] == NodeState::Pending {
                                        state[dependent] = NodeState::Skipped;
                                        queue.extend(graph.dependents(dependent));
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }

        let mut skipped: Vec<String> = state
            .iter()
            .enumerate()
            .filter(|(_, &s)| s == NodeState::Skipped || s == NodeState::Pending)
            .map(|(i, _)| graph.node(i).task_id.clone())
            .collect();
        skipped.sort();

        Execution { errors, skipped }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::EngineBuilder;
    use crate::workspace::{Package, PackageGraph};
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::sync::Mutex;

    fn make_package(name: &str, deps: &[&str], scripts: &[&str]) -> Package {
        Package {
            name: name.to_string(),
            dir: PathBuf::from(format!("packages/{name}")),
            scripts: scripts
                .iter()
                .map(|s| (s.to_string(), format!("run {s}")))
                .collect::<BTreeMap<_, _>>(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn chain_engine() -> Engine {
        // c depends on b depends on a, plus an unrelated d
        let config: Config = toml::from_str(
            r#"
[pipeline.build]
dependsOn = ["^build"]
"#,
        )
        .unwrap();
        let packages = PackageGraph::from_packages(vec![
            make_package("a", &[], &["build"]),
            make_package("b", &["a"], &["build"]),
            make_package("c", &["b"], &["build"]),
            make_package("d", &[], &["build"]),
        ]);
        EngineBuilder::new(
            &config,
            &packages,
            &["build".to_string()],
            vec![
                "a".to_string(),
                "b".to_string(),
                "c".to_string(),
                "d".to_string(),
            ],
        )
        .build()
        .unwrap()
    }

    fn recording_visitor(
        log: Arc<Mutex<Vec<String>>>,
        fail: &'static [&'static str],
    ) -> impl Fn(crate::task::PackageTask) -> std::pin::Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
           + Send
           + Sync
           + 'static {
        move |task: crate::task::PackageTask| {
            let log = log.clone();
            Box::pin(async move {
                log.lock().unwrap().push(task.task_id.clone());
                if fail.contains(&task.task_id.as_str()) {
                    anyhow::bail!("boom: {}", task.task_id);
                }
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn test_dependencies_complete_first() {
        let engine = chain_engine();
        let log = Arc::new(Mutex::new(Vec::new()));
        let (_tx, rx) = watch::channel(false);

        let execution = engine
            .execute(
                recording_visitor(log.clone(), &[]),
                ExecutionOptions::default(),
                rx,
            )
            .await;

        assert!(execution.errors.is_empty());
        assert!(execution.skipped.is_empty());

        let order = log.lock().unwrap().clone();
        assert_eq!(order.len(), 4);
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(pos("a#build") < pos("b#build"));
        assert!(pos("b#build") < pos("c#build"));
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_not_siblings() {
        let engine = chain_engine();
        let log = Arc::new(Mutex::new(Vec::new()));
        let (_tx, rx) = watch::channel(false);

        let execution = engine
            .execute(
                recording_visitor(log.clone(), &["b#build"]),
                ExecutionOptions::default(),
                rx,
            )
            .await;

        assert_eq!(execution.errors.len(), 1);
        assert_eq!(execution.skipped, vec!["c#build".to_string()]);

        let order = log.lock().unwrap().clone();
        // The unrelated branch still ran
        assert!(order.contains(&"d#build".to_string()));
        assert!(!order.contains(&"c#build".to_string()));
    }

    #[tokio::test]
    async fn test_concurrency_one_is_sequential_and_deterministic() {
        let engine = chain_engine();
        let log = Arc::new(Mutex::new(Vec::new()));
        let (_tx, rx) = watch::channel(false);

        engine
            .execute(
                recording_visitor(log.clone(), &[]),
                ExecutionOptions {
                    parallel: false,
                    concurrency: 1,
                },
                rx,
            )
            .await;

        // With one permit, admission order is fully lexicographic among
        // ready nodes: a, then d (both ready at the start, a sorts first)
        let order = log.lock().unwrap().clone();
        assert_eq!(order[0], "a#build");
        assert_eq!(order[1], "b#build".to_string());
    }

    #[tokio::test]
    async fn test_parallel_ignores_edges_for_scheduling() {
        let engine = chain_engine();
        let log = Arc::new(Mutex::new(Vec::new()));
        let (_tx, rx) = watch::channel(false);

        let execution = engine
            .execute(
                recording_visitor(log.clone(), &["a#build"]),
                ExecutionOptions {
                    parallel: true,
                    concurrency: 1,
                },
                rx,
            )
            .await;

        // a failed but nothing is skipped: edges do not gate scheduling
        assert_eq!(execution.errors.len(), 1);
        assert!(execution.skipped.is_empty());
        assert_eq!(log.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_cancellation_stops_admission() {
        let engine = chain_engine();
        let (tx, rx) = watch::channel(false);
        let tx = Arc::new(tx);
        let log = Arc::new(Mutex::new(Vec::new()));

        let visitor = {
            let log = log.clone();
            move |task: crate::task::PackageTask| {
                let log = log.clone();
                let tx = tx.clone();
                Box::pin(async move {
                    log.lock().unwrap().push(task.task_id.clone());
                    // First task cancels the run
                    let _ = tx.send(true);
                    Ok(())
                })
                    as std::pin::Pin<
                        Box<dyn Future<Output = anyhow::Result<()>> + Send>,
                    >
            }
        };

        let execution = engine
            .execute(
                visitor,
                ExecutionOptions {
                    parallel: false,
                    concurrency: 1,
                },
                rx,
            )
            .await;

        // Only the first admitted node ran; the rest were never started
        assert_eq!(log.lock().unwrap().len(), 1);
        assert_eq!(execution.skipped.len(), 3);
    }
}
