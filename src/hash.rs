//! The hashing pipeline.
//!
//! Three layers feed each task hash, computed in dependency order:
//! per-package file-set hashes (memoized), the run-global fingerprint, and
//! the canonical encoding of the task's own inputs. Every map is a
//! `BTreeMap` and every list is pre-sorted, so the encoding is stable
//! across runs.

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use crate::config::TaskDefinition;
use crate::task::PackageTask;
use crate::workspace::Package;

/// Directories never included in a package file walk.
const EXCLUDED_DIRS: [&str; 3] = [".git", "node_modules", ".turbo"];

/// Full SHA-256, hex-encoded. Used for file contents and env values.
pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn hash_file(path: &Path) -> Result<String> {
    let bytes =
        fs::read(path).with_context(|| format!("Failed to read input file: {}", path.display()))?;
    Ok(hash_bytes(&bytes))
}

/// Short stable digest over a canonical JSON encoding: the first 8 bytes of
/// SHA-256, hex-encoded. Used for task and global hashes.
pub fn short_hash<T: Serialize>(value: &T) -> Result<String> {
    let encoded = serde_json::to_vec(value).context("Failed to encode hash inputs")?;
    let digest = Sha256::digest(&encoded);
    Ok(hex::encode(&digest[..8]))
}

/// Each variable is hashed individually; a missing variable hashes the empty
/// string. This keeps the fingerprint independent of variable ordering and
/// makes "set to empty" distinct from nothing only by declaration.
pub fn env_pairs(names: &[String]) -> BTreeMap<String, String> {
    names
        .iter()
        .map(|name| {
            let value = std::env::var(name).unwrap_or_default();
            (name.clone(), hash_bytes(value.as_bytes()))
        })
        .collect()
}

/// `NAME=<sha256 of value>` lines for the run summary.
pub fn env_pair_list(pairs: &BTreeMap<String, String>) -> Vec<String> {
    pairs.iter().map(|(k, v)| format!("{k}={v}")).collect()
}

/// The invariant fingerprint of workspace-root state.
#[derive(Debug, Clone, Serialize)]
pub struct GlobalHashSummary {
    pub global_file_hash_map: BTreeMap<String, String>,
    pub root_external_deps_hash: String,
    pub global_cache_key: String,
    pub env: BTreeMap<String, String>,
    #[serde(skip)]
    pub hash: String,
}

impl GlobalHashSummary {
    pub fn compute(
        repo_root: &Path,
        root_files: &[String],
        lockfile: &str,
        cache_key: &str,
        global_env: &[String],
    ) -> Result<Self> {
        let mut global_file_hash_map = BTreeMap::new();
        for file in root_files {
            let path = repo_root.join(file);
            if path.is_file() {
                global_file_hash_map.insert(file.replace('\\', "/"), hash_file(&path)?);
            }
        }

        let lock_path = repo_root.join(lockfile);
        let root_external_deps_hash = if lock_path.is_file() {
            hash_file(&lock_path)?
        } else {
            hash_bytes(b"")
        };

        let mut summary = Self {
            global_file_hash_map,
            root_external_deps_hash,
            global_cache_key: cache_key.to_string(),
            env: env_pairs(global_env),
            hash: String::new(),
        };
        summary.hash = short_hash(&summary)?;
        Ok(summary)
    }
}

/// The six task-hash inputs, in their fixed order.
#[derive(Serialize)]
struct TaskHashInputs<'a> {
    package_files: &'a BTreeMap<String, String>,
    dependency_hashes: &'a [String],
    task_definition: &'a TaskDefinition,
    env: &'a BTreeMap<String, String>,
    pass_through_args: &'a [String],
    global_hash: &'a str,
}

/// Computes and memoizes hashes, and records the expanded input/output file
/// lists each node materialized.
///
/// Task hashes are written exactly once per node, in topological order;
/// readers observe a hash only after it is finalized.
#[derive(Debug, Default)]
pub struct HashTracker {
    package_file_hashes: Mutex<HashMap<String, BTreeMap<String, String>>>,
    task_hashes: Mutex<HashMap<String, String>>,
    expanded_inputs: Mutex<HashMap<String, BTreeMap<String, String>>>,
    expanded_outputs: Mutex<HashMap<String, Vec<String>>>,
}

impl HashTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute the task hash for `node` given the finalized hashes of its
    /// prerequisites, store it, and record the node's expanded inputs.
    pub fn calculate_task_hash(
        &self,
        repo_root: &Path,
        package: &Package,
        node: &PackageTask,
        mut dependency_hashes: Vec<String>,
        pass_through_args: &[String],
        global: &GlobalHashSummary,
    ) -> Result<String> {
        let package_files =
            self.package_files(repo_root, package, &node.definition.inputs)?;
        dependency_hashes.sort();
        let env = env_pairs(&node.definition.env);

        let inputs = TaskHashInputs {
            package_files: &package_files,
            dependency_hashes: &dependency_hashes,
            task_definition: &node.definition,
            env: &env,
            pass_through_args,
            global_hash: &global.hash,
        };
        let hash = short_hash(&inputs)?;

        self.expanded_inputs
            .lock()
            .unwrap()
            .insert(node.task_id.clone(), package_files);
        self.task_hashes
            .lock()
            .unwrap()
            .insert(node.task_id.clone(), hash.clone());
        Ok(hash)
    }

    /// The finalized hash for a node, if it has been computed.
    pub fn hash_for(&self, task_id: &str) -> Option<String> {
        self.task_hashes.lock().unwrap().get(task_id).cloned()
    }

    pub fn expanded_inputs(&self, task_id: &str) -> BTreeMap<String, String> {
        self.expanded_inputs
            .lock()
            .unwrap()
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_expanded_outputs(&self, task_id: &str, outputs: Vec<String>) {
        self.expanded_outputs
            .lock()
            .unwrap()
            .insert(task_id.to_string(), outputs);
    }

    pub fn expanded_outputs(&self, task_id: &str) -> Vec<String> {
        self.expanded_outputs
            .lock()
            .unwrap()
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }

    /// The package file set as `(workspace-relative path, content hash)`,
    /// memoized per (package, inputs) pair. The manifest always
    /// participates.
    fn package_files(
        &self,
        repo_root: &Path,
        package: &Package,
        inputs: &[String],
    ) -> Result<BTreeMap<String, String>> {
        let memo_key = format!("{}\u{0}{}", package.name, inputs.join("\u{0}"));
        if let Some(cached) = self
            .package_file_hashes
            .lock()
            .unwrap()
            .get(&memo_key)
        {
            return Ok(cached.clone());
        }

        let abs_dir = repo_root.join(&package.dir);
        let mut files = Vec::new();

        if inputs.is_empty() {
            collect_files(&abs_dir, &mut files)?;
        } else {
            for pattern in inputs {
                let full_pattern = abs_dir.join(pattern);
                for entry in glob::glob(&full_pattern.to_string_lossy())? {
                    if let Ok(path) = entry {
                        if path.is_file() {
                            files.push(path);
                        }
                    }
                }
            }
        }

        let manifest = repo_root.join(package.manifest_path());
        if manifest.is_file() {
            files.push(manifest);
        }

        let mut hashes = BTreeMap::new();
        for path in files {
            let rel = path
                .strip_prefix(repo_root)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            let hash = hash_file(&path)?;
            hashes.insert(rel, hash);
        }

        self.package_file_hashes
            .lock()
            .unwrap()
            .insert(memo_key, hashes.clone());
        Ok(hashes)
    }
}

fn collect_files(dir: &Path, out: &mut Vec<std::path::PathBuf>) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?
    {
        let path = entry?.path();
        if path.is_dir() {
            let name = path
                .file_name()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            if !EXCLUDED_DIRS.contains(&name.as_str()) {
                collect_files(&path, out)?;
            }
        } else {
            out.push(path);
        }
    }
    Ok(())
}
