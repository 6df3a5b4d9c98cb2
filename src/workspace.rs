//! Workspace packages and their dependency graph.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

/// A package within the workspace.
#[derive(Debug, Clone)]
pub struct Package {
    pub name: String,
    /// Directory, workspace-relative
    pub dir: PathBuf,
    /// Task name to command string
    pub scripts: BTreeMap<String, String>,
    /// Dependency names from the manifest (internal and external)
    pub dependencies: Vec<String>,
}

impl Package {
    /// Manifest path, workspace-relative. Always part of the package's file
    /// set when hashing.
    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join("package.json")
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    name: String,
    #[serde(default)]
    dependencies: BTreeMap<String, String>,
    #[serde(default, rename = "devDependencies")]
    dev_dependencies: BTreeMap<String, String>,
    #[serde(default)]
    scripts: BTreeMap<String, String>,
}

/// The workspace package graph: packages plus their direct
/// workspace-internal dependency edges.
#[derive(Debug, Default)]
pub struct PackageGraph {
    packages: BTreeMap<String, Package>,
    workspace_deps: BTreeMap<String, BTreeSet<String>>,
}

impl PackageGraph {
    /// Discover packages by globbing for `package.json` manifests.
    pub fn discover(root: &Path, patterns: &[String]) -> Result<Self> {
        let mut packages = Vec::new();

        for pattern in patterns {
            let full_pattern = root.join(pattern);
            let full_pattern_str = full_pattern.to_string_lossy();

            for entry in glob::glob(&full_pattern_str)? {
                let path = match entry {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                if !path.is_dir() {
                    continue;
                }
                let manifest_path = path.join("package.json");
                if !manifest_path.exists() {
                    continue;
                }

                let raw = fs::read_to_string(&manifest_path).with_context(|| {
                    format!("Failed to read manifest: {}", manifest_path.display())
                })?;
                let manifest: Manifest = serde_json::from_str(&raw).with_context(|| {
                    format!("Failed to parse manifest: {}", manifest_path.display())
                })?;

                let dir = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
                let mut dependencies: Vec<String> =
                    manifest.dependencies.keys().cloned().collect();
                dependencies.extend(manifest.dev_dependencies.keys().cloned());

                packages.push(Package {
                    name: manifest.name,
                    dir,
                    scripts: manifest.scripts,
                    dependencies,
                });
            }
        }

        Ok(Self::from_packages(packages))
    }

    /// Build the graph from an already-discovered package list. Dependency
    /// edges are the manifest dependencies that name another workspace
    /// package.
    pub fn from_packages(packages: Vec<Package>) -> Self {
        let names: BTreeSet<String> = packages.iter().map(|p| p.name.clone()).collect();

        let mut workspace_deps: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut map = BTreeMap::new();
        for package in packages {
            let deps = package
                .dependencies
                .iter()
                .filter(|d| names.contains(*d) && **d != package.name)
                .cloned()
                .collect();
            workspace_deps.insert(package.name.clone(), deps);
            map.insert(package.name.clone(), package);
        }

        Self {
            packages: map,
            workspace_deps,
        }
    }

    pub fn package(&self, name: &str) -> Option<&Package> {
        self.packages.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.packages.contains_key(name)
    }

    pub fn package_names(&self) -> Vec<&str> {
        self.packages.keys().map(|s| s.as_str()).collect()
    }

    /// Direct workspace dependencies of a package.
    pub fn dependencies_of(&self, name: &str) -> BTreeSet<String> {
        self.workspace_deps.get(name).cloned().unwrap_or_default()
    }

    /// Reject cyclic workspace dependencies (Kahn's algorithm).
    pub fn validate(&self) -> Result<()> {
        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        for (name, deps) in &self.workspace_deps {
            in_degree.insert(name.as_str(), deps.len());
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&name, _)| name)
            .collect();

        let mut seen = 0usize;
        while let Some(current) = queue.pop_front() {
            seen += 1;
            for (name, deps) in &self.workspace_deps {
                if deps.contains(current) {
                    let deg = in_degree.get_mut(name.as_str()).unwrap();
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(name.as_str());
                    }
                }
            }
        }

        if seen != self.packages.len() {
            let cyclic: Vec<&str> = in_degree
                .iter()
                .filter(|(_, &deg)| deg > 0)
                .map(|(&name, _)| name)
                .collect();
            anyhow::bail!(
                "cyclic workspace dependency involving: {}",
                cyclic.join(", ")
            );
        }

        Ok(())
    }
}

/// The binary that runs package scripts, and the separator placed before
/// passthrough args.
#[derive(Debug, Clone)]
pub struct PackageManager {
    pub command: String,
    pub arg_separator: Vec<String>,
}

impl Default for PackageManager {
    fn default() -> Self {
        Self {
            command: "npm".to_string(),
            arg_separator: vec!["--".to_string()],
        }
    }
}

impl PackageManager {
    /// Argument vector for running `task`, with passthrough args after the
    /// separator.
    pub fn task_args(&self, task: &str, pass_through: &[String]) -> Vec<String> {
        let mut args = vec!["run".to_string(), task.to_string()];
        if !pass_through.is_empty() {
            args.extend(self.arg_separator.iter().cloned());
            args.extend(pass_through.iter().cloned());
        }
        args
    }
}
