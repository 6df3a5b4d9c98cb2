//! Task graph construction.
//!
//! The builder expands the requested targets into a DAG of `(package, task)`
//! nodes by following `dependsOn` references across the workspace package
//! graph, then validates it: no cycles, nothing depends on a persistent
//! task, and every target exists in the pipeline.
//!
//! Nodes live in an arena sorted by task id; edges are index pairs kept as
//! adjacency lists in both directions.

mod execute;

pub use execute::{Execution, ExecutionOptions, DEFAULT_CONCURRENCY};

use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::config::Config;
use crate::error::ConfigError;
use crate::task::{task_id, Dependency, PackageTask};
use crate::workspace::PackageGraph;

/// The DAG of package-task nodes. Edges point from a task to its
/// prerequisites.
#[derive(Debug)]
pub struct TaskGraph {
    nodes: Vec<PackageTask>,
    index: HashMap<String, usize>,
    deps: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
}

impl TaskGraph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, idx: usize) -> &PackageTask {
        &self.nodes[idx]
    }

    pub fn index_of(&self, task_id: &str) -> Option<usize> {
        self.index.get(task_id).copied()
    }

    /// Prerequisite indices of a node.
    pub fn dependencies(&self, idx: usize) -> &[usize] {
        &self.deps[idx]
    }

    /// Indices of nodes that depend on a node.
    pub fn dependents(&self, idx: usize) -> &[usize] {
        &self.dependents[idx]
    }

    pub fn dependency_task_ids(&self, idx: usize) -> Vec<String> {
        let mut ids: Vec<String> = self.deps[idx]
            .iter()
            .map(|&d| self.nodes[d].task_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn dependent_task_ids(&self, idx: usize) -> Vec<String> {
        let mut ids: Vec<String> = self.dependents[idx]
            .iter()
            .map(|&d| self.nodes[d].task_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// All task ids, lexicographic.
    pub fn task_ids(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.task_id.as_str()).collect()
    }

    /// Indices in dependency order. Ties break lexicographically by task id
    /// so output order is reproducible.
    pub fn topological_order(&self) -> Vec<usize> {
        let mut in_degree: Vec<usize> = self.deps.iter().map(|d| d.len()).collect();
        let mut ready: BTreeSet<(String, usize)> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &deg)| deg == 0)
            .map(|(i, _)| (self.nodes[i].task_id.clone(), i))
            .collect();

        let mut order = Vec::with_capacity(self.len());
        while let Some((_, idx)) = ready.pop_first() {
            order.push(idx);
            for &dependent in &self.dependents[idx] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert((self.nodes[dependent].task_id.clone(), dependent));
                }
            }
        }
        order
    }
}

/// A validated task graph, ready to execute.
#[derive(Debug)]
pub struct Engine {
    graph: TaskGraph,
}

impl Engine {
    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }
}

/// Expands targets into an [`Engine`] by frontier expansion.
pub struct EngineBuilder<'a> {
    config: &'a Config,
    package_graph: &'a PackageGraph,
    targets: &'a [String],
    packages_in_scope: Vec<String>,
}

impl<'a> EngineBuilder<'a> {
    pub fn new(
        config: &'a Config,
        package_graph: &'a PackageGraph,
        targets: &'a [String],
        packages_in_scope: Vec<String>,
    ) -> Self {
        Self {
            config,
            package_graph,
            targets,
            packages_in_scope,
        }
    }

    pub fn build(self) -> Result<Engine, ConfigError> {
        self.check_targets()?;

        let mut nodes: Vec<PackageTask> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut edges: BTreeSet<(usize, usize)> = BTreeSet::new();

        let mut queue: VecDeque<(String, String)> = VecDeque::new();
        for package in &self.packages_in_scope {
            for target in self.targets {
                queue.push_back((package.clone(), target.clone()));
            }
        }

        let mut expanded: BTreeSet<String> = BTreeSet::new();
        while let Some((package, task)) = queue.pop_front() {
            let id = task_id(&package, &task);
            if !expanded.insert(id.clone()) {
                continue;
            }
            let idx = ensure_node(
                self.config,
                self.package_graph,
                &mut nodes,
                &mut index,
                &package,
                &task,
            );

            let depends_on = nodes[idx].definition.depends_on.clone();
            for reference in &depends_on {
                let dependency = Dependency::parse(reference).map_err(|reason| {
                    ConfigError::InvalidDependency {
                        key: id.clone(),
                        reference: reference.clone(),
                        reason,
                    }
                })?;
                match dependency {
                    Dependency::Task(dep_task) => {
                        let dep_idx = ensure_node(
                            self.config,
                            self.package_graph,
                            &mut nodes,
                            &mut index,
                            &package,
                            &dep_task,
                        );
                        edges.insert((idx, dep_idx));
                        queue.push_back((package.clone(), dep_task));
                    }
                    Dependency::Topological(dep_task) => {
                        for dep_package in self.package_graph.dependencies_of(&package) {
                            let dep_idx = ensure_node(
                                self.config,
                                self.package_graph,
                                &mut nodes,
                                &mut index,
                                &dep_package,
                                &dep_task,
                            );
                            edges.insert((idx, dep_idx));
                            queue.push_back((dep_package, dep_task.clone()));
                        }
                    }
                    Dependency::Package {
                        package: dep_package,
                        task: dep_task,
                    } => {
                        if !self.package_graph.contains(&dep_package) {
                            return Err(ConfigError::UnknownPackage {
                                package: dep_package,
                                reference: reference.clone(),
                            });
                        }
                        let dep_idx = ensure_node(
                            self.config,
                            self.package_graph,
                            &mut nodes,
                            &mut index,
                            &dep_package,
                            &dep_task,
                        );
                        edges.insert((idx, dep_idx));
                        queue.push_back((dep_package, dep_task));
                    }
                }
            }
        }

        // Nothing may depend on a persistent task
        for &(from, to) in &edges {
            if nodes[to].definition.persistent {
                return Err(ConfigError::PersistentDependency {
                    dependent: nodes[from].task_id.clone(),
                    dependency: nodes[to].task_id.clone(),
                });
            }
        }

        // Cycle check over the full expansion
        let deps_by_node = adjacency(nodes.len(), &edges);
        if let Some(cycle) = find_cycle(&nodes, &deps_by_node) {
            return Err(ConfigError::CyclicDependency { path: cycle });
        }

        // Prune no-op leaves: empty command, no prerequisites, and nothing
        // depending on them. Anything with a dependent stays as a zero-work
        // barrier so its hash still reaches downstream nodes.
        let mut has_dependent = vec![false; nodes.len()];
        for &(_, to) in &edges {
            has_dependent[to] = true;
        }
        let keep: Vec<usize> = (0..nodes.len())
            .filter(|&i| {
                !(nodes[i].command.is_empty()
                    && deps_by_node[i].is_empty()
                    && !has_dependent[i])
            })
            .collect();

        // Re-index the arena sorted by task id for deterministic traversal
        let mut keep_sorted = keep;
        keep_sorted.sort_by(|&a, &b| nodes[a].task_id.cmp(&nodes[b].task_id));
        let mut old_to_new: HashMap<usize, usize> = HashMap::new();
        for (new_idx, &old_idx) in keep_sorted.iter().enumerate() {
            old_to_new.insert(old_idx, new_idx);
        }

        let mut final_nodes = Vec::with_capacity(keep_sorted.len());
        let mut final_index = HashMap::new();
        for &old_idx in &keep_sorted {
            let node = nodes[old_idx].clone();
            final_index.insert(node.task_id.clone(), final_nodes.len());
            final_nodes.push(node);
        }

        let mut deps = vec![Vec::new(); final_nodes.len()];
        let mut dependents = vec![Vec::new(); final_nodes.len()];
        for &(from, to) in &edges {
            let (Some(&from), Some(&to)) = (old_to_new.get(&from), old_to_new.get(&to))
            else {
                continue;
            };
            deps[from].push(to);
            dependents[to].push(from);
        }
        for list in deps.iter_mut().chain(dependents.iter_mut()) {
            list.sort_unstable();
            list.dedup();
        }

        Ok(Engine {
            graph: TaskGraph {
                nodes: final_nodes,
                index: final_index,
                deps,
                dependents,
            },
        })
    }

    fn check_targets(&self) -> Result<(), ConfigError> {
        let mut missing: Vec<&str> = self
            .targets
            .iter()
            .filter(|t| !self.config.is_task_defined(t))
            .map(|t| t.as_str())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        missing.sort_unstable();
        Err(ConfigError::MissingTasks(missing.join(", ")))
    }
}

fn ensure_node(
    config: &Config,
    package_graph: &PackageGraph,
    nodes: &mut Vec<PackageTask>,
    index: &mut HashMap<String, usize>,
    package: &str,
    task: &str,
) -> usize {
    let id = task_id(package, task);
    if let Some(&idx) = index.get(&id) {
        return idx;
    }

    let definition = config.resolved_task_definition(package, task);
    let (dir, command) = match package_graph.package(package) {
        Some(pkg) => {
            // A node outside the pipeline is a no-op even when the package
            // has a script for it
            let command = if config.task_definition(package, task).is_some() {
                pkg.scripts.get(task).cloned().unwrap_or_default()
            } else {
                String::new()
            };
            (pkg.dir.clone(), command)
        }
        None => (std::path::PathBuf::new(), String::new()),
    };

    let idx = nodes.len();
    nodes.push(PackageTask::new(
        package.to_string(),
        task.to_string(),
        dir,
        command,
        definition,
    ));
    index.insert(id, idx);
    idx
}

fn adjacency(len: usize, edges: &BTreeSet<(usize, usize)>) -> Vec<Vec<usize>> {
    let mut deps = vec![Vec::new(); len];
    for &(from, to) in edges {
        deps[from].push(to);
    }
    deps
}

/// Depth-first search for a back edge; returns the cycle path when found.
fn find_cycle(nodes: &[PackageTask], deps: &[Vec<usize>]) -> Option<String> {
    const WHITE: u8 = 0;
    const GRAY: u8 = 1;
    const BLACK: u8 = 2;

    fn dfs(
        v: usize,
        deps: &[Vec<usize>],
        marks: &mut [u8],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        marks[v] = GRAY;
        stack.push(v);
        for &next in &deps[v] {
            match marks[next] {
                WHITE => {
                    if let Some(cycle) = dfs(next, deps, marks, stack) {
                        return Some(cycle);
                    }
                }
                GRAY => {
                    // Back edge: the cycle is the stack from the first
                    // occurrence of `next`, closed by `next` itself
                    let start = stack.iter().position(|&x| x == next).unwrap();
                    let mut cycle: Vec<usize> = stack[start..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                _ => {}
            }
        }
        stack.pop();
        marks[v] = BLACK;
        None
    }

    let mut marks = vec![WHITE; nodes.len()];
    let mut roots: Vec<usize> = (0..nodes.len()).collect();
    roots.sort_by(|&a, &b| nodes[a].task_id.cmp(&nodes[b].task_id));

    for root in roots {
        if marks[root] != WHITE {
            continue;
        }
        let mut stack = Vec::new();
        if let Some(cycle) = dfs(root, deps, &mut marks, &mut stack) {
            let path: Vec<&str> = cycle.iter().map(|&i| nodes[i].task_id.as_str()).collect();
            return Some(path.join(" -> "));
        }
    }
    None
}
