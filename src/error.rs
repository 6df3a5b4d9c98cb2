//! Structured errors surfaced at the engine and process boundaries.
//!
//! Most code propagates `anyhow::Result`; these types exist where callers
//! need to inspect the failure: engine preparation errors abort the run
//! before anything executes, and `ProcessError::ChildExit` carries the exit
//! code that becomes the run's exit code.

use thiserror::Error;

/// Fatal configuration problems detected while preparing the task graph.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not find the following tasks in project: {0}")]
    MissingTasks(String),

    #[error("cyclic task dependency detected: {path}")]
    CyclicDependency { path: String },

    #[error("invalid task reference \"{reference}\" in dependsOn of \"{key}\": {reason}")]
    InvalidDependency {
        key: String,
        reference: String,
        reason: String,
    },

    #[error("\"{dependency}\" is a persistent task, \"{dependent}\" cannot depend on it")]
    PersistentDependency {
        dependent: String,
        dependency: String,
    },

    #[error("unknown package \"{package}\" referenced by \"{reference}\"")]
    UnknownPackage { package: String, reference: String },
}

/// Errors from spawning and waiting on task commands.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The child ran and exited non-zero.
    #[error("command exited ({exit_code})")]
    ChildExit { exit_code: i32 },

    /// The process manager is tearing down; not a task failure.
    #[error("process manager is closing")]
    Closing,

    #[error("failed to spawn command: {0}")]
    Spawn(String),
}

impl ProcessError {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProcessError::ChildExit { exit_code } => Some(*exit_code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_tasks_message() {
        let err = ConfigError::MissingTasks("doesnotexist".to_string());
        assert_eq!(
            err.to_string(),
            "Could not find the following tasks in project: doesnotexist"
        );
    }

    #[test]
    fn test_child_exit_code() {
        let err = ProcessError::ChildExit { exit_code: 3 };
        assert_eq!(err.exit_code(), Some(3));
        assert_eq!(ProcessError::Closing.exit_code(), None);
    }
}
