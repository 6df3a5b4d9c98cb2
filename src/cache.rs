//! Content-addressed storage for task outputs.
//!
//! Every tier implements the same capability set, and the two-tier
//! composition is itself a tier. The disabled tier is the identity: always
//! a miss, save is a no-op.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Which tier produced a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    Local,
    Remote,
}

/// Per-tier presence of an artifact, as reported by dry-runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheState {
    pub local: bool,
    pub remote: bool,
}

/// A stored artifact: the captured file tree plus the log and metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheArtifact {
    pub hash: String,
    pub files: Vec<ArtifactFile>,
    pub log: Vec<u8>,
    pub duration_ms: u64,
    pub exit_code: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactFile {
    /// Workspace-relative path
    pub path: String,
    pub contents: Vec<u8>,
}

/// What a successful restore materialized.
#[derive(Debug)]
pub struct RestoredOutputs {
    pub files: Vec<String>,
    pub log: Vec<u8>,
    pub duration_ms: u64,
    pub source: CacheSource,
}

/// The cache capability set shared by every tier.
pub trait Cache: Send + Sync {
    fn exists(&self, hash: &str) -> Result<CacheState>;

    /// Materialize the artifact's file tree under `repo_root`. `None` is a
    /// miss.
    fn restore(&self, repo_root: &Path, hash: &str) -> Result<Option<RestoredOutputs>>;

    /// Capture `files` (workspace-relative) and the log under `hash`.
    fn save(
        &self,
        repo_root: &Path,
        hash: &str,
        files: &[String],
        log: &[u8],
        duration_ms: u64,
        exit_code: i32,
    ) -> Result<()>;

    fn shutdown(&self) {}
}

/// Identity tier, selected when caching is off.
pub struct NoopCache;

impl Cache for NoopCache {
    fn exists(&self, _hash: &str) -> Result<CacheState> {
        Ok(CacheState::default())
    }

    fn restore(&self, _repo_root: &Path, _hash: &str) -> Result<Option<RestoredOutputs>> {
        Ok(None)
    }

    fn save(
        &self,
        _repo_root: &Path,
        _hash: &str,
        _files: &[String],
        _log: &[u8],
        _duration_ms: u64,
        _exit_code: i32,
    ) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Metadata {
    hash: String,
    duration_ms: u64,
    exit_code: i32,
    files: Vec<String>,
}

/// Local filesystem tier. Artifacts live under `<dir>/<hash>/` with a
/// `<hash>-meta.json` sidecar and the captured log as `<hash>-log`.
pub struct FsCache {
    dir: PathBuf,
}

impl FsCache {
    pub fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create cache directory: {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn meta_path(&self, hash: &str) -> PathBuf {
        self.dir.join(format!("{hash}-meta.json"))
    }

    fn log_path(&self, hash: &str) -> PathBuf {
        self.dir.join(format!("{hash}-log"))
    }

    fn tree_dir(&self, hash: &str) -> PathBuf {
        self.dir.join(hash)
    }
}

impl Cache for FsCache {
    fn exists(&self, hash: &str) -> Result<CacheState> {
        Ok(CacheState {
            local: self.meta_path(hash).is_file(),
            remote: false,
        })
    }

    fn restore(&self, repo_root: &Path, hash: &str) -> Result<Option<RestoredOutputs>> {
        let meta_path = self.meta_path(hash);
        if !meta_path.is_file() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&meta_path)?;
        let meta: Metadata = serde_json::from_str(&raw)
            .with_context(|| format!("Corrupt cache metadata: {}", meta_path.display()))?;

        let tree = self.tree_dir(hash);
        for file in &meta.files {
            let src = tree.join(file);
            let dest = repo_root.join(file);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&src, &dest)
                .with_context(|| format!("Failed to restore cached file: {file}"))?;
        }

        let log = fs::read(self.log_path(hash)).unwrap_or_default();

        Ok(Some(RestoredOutputs {
            files: meta.files,
            log,
            duration_ms: meta.duration_ms,
            source: CacheSource::Local,
        }))
    }

    fn save(
        &self,
        repo_root: &Path,
        hash: &str,
        files: &[String],
        log: &[u8],
        duration_ms: u64,
        exit_code: i32,
    ) -> Result<()> {
        // Same hash, same bytes: a second write is a no-op
        if self.meta_path(hash).is_file() {
            return Ok(());
        }

        let tree = self.tree_dir(hash);
        let mut captured = Vec::new();
        for file in files {
            let src = repo_root.join(file);
            if !src.is_file() {
                continue;
            }
            let dest = tree.join(file);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&src, &dest)
                .with_context(|| format!("Failed to capture output file: {file}"))?;
            captured.push(file.clone());
        }

        fs::write(self.log_path(hash), log)?;

        let meta = Metadata {
            hash: hash.to_string(),
            duration_ms,
            exit_code,
            files: captured,
        };
        fs::write(self.meta_path(hash), serde_json::to_string_pretty(&meta)?)?;
        Ok(())
    }
}

/// Transport interface for the remote tier. The actual transport lives
/// outside the core; tests use [`InMemoryRemote`].
pub trait RemoteClient: Send + Sync {
    fn exists(&self, hash: &str) -> Result<bool>;
    fn fetch(&self, hash: &str) -> Result<Option<CacheArtifact>>;
    fn store(&self, artifact: &CacheArtifact) -> Result<()>;
}

/// In-process remote client. Uploads are idempotent by hash.
#[derive(Default)]
pub struct InMemoryRemote {
    artifacts: Mutex<HashMap<String, CacheArtifact>>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RemoteClient for InMemoryRemote {
    fn exists(&self, hash: &str) -> Result<bool> {
        Ok(self.artifacts.lock().unwrap().contains_key(hash))
    }

    fn fetch(&self, hash: &str) -> Result<Option<CacheArtifact>> {
        Ok(self.artifacts.lock().unwrap().get(hash).cloned())
    }

    fn store(&self, artifact: &CacheArtifact) -> Result<()> {
        self.artifacts
            .lock()
            .unwrap()
            .insert(artifact.hash.clone(), artifact.clone());
        Ok(())
    }
}

/// Remote tier over a [`RemoteClient`], moving whole artifacts.
pub struct RemoteCache {
    client: Box<dyn RemoteClient>,
}

impl RemoteCache {
    pub fn new(client: Box<dyn RemoteClient>) -> Self {
        Self { client }
    }
}

impl Cache for RemoteCache {
    fn exists(&self, hash: &str) -> Result<CacheState> {
        Ok(CacheState {
            local: false,
            remote: self.client.exists(hash)?,
        })
    }

    fn restore(&self, repo_root: &Path, hash: &str) -> Result<Option<RestoredOutputs>> {
        let Some(artifact) = self.client.fetch(hash)? else {
            return Ok(None);
        };

        let mut files = Vec::new();
        for file in &artifact.files {
            let dest = repo_root.join(&file.path);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&dest, &file.contents)
                .with_context(|| format!("Failed to restore cached file: {}", file.path))?;
            files.push(file.path.clone());
        }

        Ok(Some(RestoredOutputs {
            files,
            log: artifact.log,
            duration_ms: artifact.duration_ms,
            source: CacheSource::Remote,
        }))
    }

    fn save(
        &self,
        repo_root: &Path,
        hash: &str,
        files: &[String],
        log: &[u8],
        duration_ms: u64,
        exit_code: i32,
    ) -> Result<()> {
        let mut artifact_files = Vec::new();
        for file in files {
            let src = repo_root.join(file);
            if !src.is_file() {
                continue;
            }
            artifact_files.push(ArtifactFile {
                path: file.clone(),
                contents: fs::read(&src)?,
            });
        }

        self.client.store(&CacheArtifact {
            hash: hash.to_string(),
            files: artifact_files,
            log: log.to_vec(),
            duration_ms,
            exit_code,
        })
    }
}

/// Local-first composition. A remote hit populates the local tier so the
/// next run is served locally.
pub struct TieredCache {
    local: FsCache,
    remote: Option<RemoteCache>,
}

impl TieredCache {
    pub fn new(local: FsCache, remote: Option<RemoteCache>) -> Self {
        Self { local, remote }
    }
}

impl Cache for TieredCache {
    fn exists(&self, hash: &str) -> Result<CacheState> {
        let mut state = self.local.exists(hash)?;
        if let Some(remote) = &self.remote {
            state.remote = remote.exists(hash)?.remote;
        }
        Ok(state)
    }

    fn restore(&self, repo_root: &Path, hash: &str) -> Result<Option<RestoredOutputs>> {
        if let Some(restored) = self.local.restore(repo_root, hash)? {
            return Ok(Some(restored));
        }
        let Some(remote) = &self.remote else {
            return Ok(None);
        };
        let Some(restored) = remote.restore(repo_root, hash)? else {
            return Ok(None);
        };
        self.local.save(
            repo_root,
            hash,
            &restored.files,
            &restored.log,
            restored.duration_ms,
            0,
        )?;
        Ok(Some(restored))
    }

    fn save(
        &self,
        repo_root: &Path,
        hash: &str,
        files: &[String],
        log: &[u8],
        duration_ms: u64,
        exit_code: i32,
    ) -> Result<()> {
        self.local
            .save(repo_root, hash, files, log, duration_ms, exit_code)?;
        if let Some(remote) = &self.remote {
            remote.save(repo_root, hash, files, log, duration_ms, exit_code)?;
        }
        Ok(())
    }

    fn shutdown(&self) {
        self.local.shutdown();
        if let Some(remote) = &self.remote {
            remote.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_output(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_fs_cache_round_trip() {
        let workspace = tempdir().unwrap();
        let cache_dir = tempdir().unwrap();
        let cache = FsCache::new(cache_dir.path().to_path_buf()).unwrap();

        write_output(workspace.path(), "pkg/dist/app.js", "bundled");
        let files = vec!["pkg/dist/app.js".to_string()];
        cache
            .save(workspace.path(), "abc123", &files, b"build log\n", 42, 0)
            .unwrap();

        assert!(cache.exists("abc123").unwrap().local);
        assert!(!cache.exists("nope").unwrap().local);

        // Restore into a fresh workspace and compare bytes
        let second = tempdir().unwrap();
        let restored = cache.restore(second.path(), "abc123").unwrap().unwrap();
        assert_eq!(restored.files, files);
        assert_eq!(restored.log, b"build log\n");
        assert_eq!(restored.duration_ms, 42);
        assert_eq!(restored.source, CacheSource::Local);
        assert_eq!(
            fs::read_to_string(second.path().join("pkg/dist/app.js")).unwrap(),
            "bundled"
        );
    }

    #[test]
    fn test_fs_cache_second_save_is_noop() {
        let workspace = tempdir().unwrap();
        let cache_dir = tempdir().unwrap();
        let cache = FsCache::new(cache_dir.path().to_path_buf()).unwrap();

        write_output(workspace.path(), "pkg/out.txt", "first");
        let files = vec!["pkg/out.txt".to_string()];
        cache
            .save(workspace.path(), "h1", &files, b"one", 1, 0)
            .unwrap();

        write_output(workspace.path(), "pkg/out.txt", "second");
        cache
            .save(workspace.path(), "h1", &files, b"two", 2, 0)
            .unwrap();

        let restored = cache.restore(workspace.path(), "h1").unwrap().unwrap();
        assert_eq!(restored.log, b"one");
        assert_eq!(
            fs::read_to_string(workspace.path().join("pkg/out.txt")).unwrap(),
            "first"
        );
    }

    #[test]
    fn test_missing_output_files_are_skipped() {
        let workspace = tempdir().unwrap();
        let cache_dir = tempdir().unwrap();
        let cache = FsCache::new(cache_dir.path().to_path_buf()).unwrap();

        write_output(workspace.path(), "pkg/real.txt", "yes");
        let files = vec!["pkg/real.txt".to_string(), "pkg/ghost.txt".to_string()];
        cache
            .save(workspace.path(), "h2", &files, b"", 0, 0)
            .unwrap();

        let restored = cache.restore(workspace.path(), "h2").unwrap().unwrap();
        assert_eq!(restored.files, vec!["pkg/real.txt".to_string()]);
    }

    #[test]
    fn test_noop_cache_is_identity() {
        let workspace = tempdir().unwrap();
        let cache = NoopCache;
        cache
            .save(workspace.path(), "h", &["a".to_string()], b"log", 1, 0)
            .unwrap();
        assert!(cache.restore(workspace.path(), "h").unwrap().is_none());
        assert_eq!(cache.exists("h").unwrap(), CacheState::default());
    }

    #[test]
    fn test_remote_hit_populates_local() {
        let workspace = tempdir().unwrap();
        let cache_dir = tempdir().unwrap();

        let remote_client = InMemoryRemote::new();
        remote_client
            .store(&CacheArtifact {
                hash: "deadbeef".to_string(),
                files: vec![ArtifactFile {
                    path: "pkg/dist/x.js".to_string(),
                    contents: b"remote bytes".to_vec(),
                }],
                log: b"remote log".to_vec(),
                duration_ms: 7,
                exit_code: 0,
            })
            .unwrap();

        let tiered = TieredCache::new(
            FsCache::new(cache_dir.path().to_path_buf()).unwrap(),
            Some(RemoteCache::new(Box::new(remote_client))),
        );

        let state = tiered.exists("deadbeef").unwrap();
        assert!(!state.local);
        assert!(state.remote);

        let restored = tiered.restore(workspace.path(), "deadbeef").unwrap().unwrap();
        assert_eq!(restored.source, CacheSource::Remote);
        assert_eq!(
            fs::read(workspace.path().join("pkg/dist/x.js")).unwrap(),
            b"remote bytes"
        );

        // The hit populated the local tier
        let state = tiered.exists("deadbeef").unwrap();
        assert!(state.local);
        let again = tiered.restore(workspace.path(), "deadbeef").unwrap().unwrap();
        assert_eq!(again.source, CacheSource::Local);
    }

    #[test]
    fn test_tiered_save_writes_both() {
        let workspace = tempdir().unwrap();
        let cache_dir = tempdir().unwrap();

        let tiered = TieredCache::new(
            FsCache::new(cache_dir.path().to_path_buf()).unwrap(),
            Some(RemoteCache::new(Box::new(InMemoryRemote::new()))),
        );

        write_output(workspace.path(), "pkg/out.css", "styles");
        tiered
            .save(
                workspace.path(),
                "feedface",
                &["pkg/out.css".to_string()],
                b"",
                3,
                0,
            )
            .unwrap();

        let state = tiered.exists("feedface").unwrap();
        assert!(state.local);
        assert!(state.remote);
    }
}
