//! Task identifiers and graph node types.

use std::path::PathBuf;

use crate::config::TaskDefinition;

const TASK_DELIMITER: char = '#';
const TOPOLOGICAL_PREFIX: char = '^';

/// Canonical identifier for a `(package, task)` pair.
pub fn task_id(package: &str, task: &str) -> String {
    format!("{package}{TASK_DELIMITER}{task}")
}

/// Split a canonical task id back into `(package, task)`.
pub fn split_task_id(id: &str) -> Option<(&str, &str)> {
    id.split_once(TASK_DELIMITER)
}

/// A parsed `dependsOn` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dependency {
    /// Same task name within the same package
    Task(String),
    /// `^task`: the task in each direct workspace dependency
    Topological(String),
    /// `pkg#task`: an explicit node
    Package { package: String, task: String },
}

impl Dependency {
    pub fn parse(raw: &str) -> Result<Self, String> {
        if let Some(task) = raw.strip_prefix(TOPOLOGICAL_PREFIX) {
            if task.is_empty() {
                return Err("missing task name after '^'".to_string());
            }
            if task.contains(TASK_DELIMITER) {
                return Err("'^' cannot be combined with a package scope".to_string());
            }
            return Ok(Dependency::Topological(task.to_string()));
        }
        if let Some((package, task)) = raw.split_once(TASK_DELIMITER) {
            if package.is_empty() || task.is_empty() {
                return Err("expected the form 'package#task'".to_string());
            }
            return Ok(Dependency::Package {
                package: package.to_string(),
                task: task.to_string(),
            });
        }
        if raw.is_empty() {
            return Err("empty task reference".to_string());
        }
        Ok(Dependency::Task(raw.to_string()))
    }
}

/// A graph vertex: one task in one package, with its resolved definition.
#[derive(Debug, Clone)]
pub struct PackageTask {
    pub task_id: String,
    pub package: String,
    pub task: String,
    /// Package directory, workspace-relative
    pub dir: PathBuf,
    /// Command from the package's task map; empty when the package does not
    /// define this task
    pub command: String,
    pub definition: TaskDefinition,
}

impl PackageTask {
    pub fn new(
        package: String,
        task: String,
        dir: PathBuf,
        command: String,
        definition: TaskDefinition,
    ) -> Self {
        Self {
            task_id: task_id(&package, &task),
            package,
            task,
            dir,
            command,
            definition,
        }
    }

    /// Where the captured log lives, workspace-relative.
    pub fn log_file(&self) -> PathBuf {
        self.dir.join(".turbo").join(format!("turbo-{}.log", self.task))
    }

    /// Console prefix before coloring.
    pub fn output_prefix(&self) -> String {
        format!("{}:{}", self.package, self.task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_round_trip() {
        let id = task_id("my-app", "build");
        assert_eq!(id, "my-app#build");
        assert_eq!(split_task_id(&id), Some(("my-app", "build")));
        assert_eq!(split_task_id("build"), None);
    }

    #[test]
    fn test_parse_dependency_forms() {
        assert_eq!(
            Dependency::parse("build").unwrap(),
            Dependency::Task("build".to_string())
        );
        assert_eq!(
            Dependency::parse("^build").unwrap(),
            Dependency::Topological("build".to_string())
        );
        assert_eq!(
            Dependency::parse("util#build").unwrap(),
            Dependency::Package {
                package: "util".to_string(),
                task: "build".to_string()
            }
        );
    }

    #[test]
    fn test_parse_dependency_rejects_malformed() {
        assert!(Dependency::parse("").is_err());
        assert!(Dependency::parse("^").is_err());
        assert!(Dependency::parse("#build").is_err());
        assert!(Dependency::parse("pkg#").is_err());
        assert!(Dependency::parse("^pkg#build").is_err());
    }

    #[test]
    fn test_log_file_path() {
        let task = PackageTask::new(
            "my-app".to_string(),
            "build".to_string(),
            PathBuf::from("apps/my-app"),
            "next build".to_string(),
            TaskDefinition::default(),
        );
        assert_eq!(
            task.log_file(),
            PathBuf::from("apps/my-app/.turbo/turbo-build.log")
        );
        assert_eq!(task.output_prefix(), "my-app:build");
    }
}
