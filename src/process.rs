//! Child process lifecycle and group teardown.
//!
//! The manager tracks every spawned child so a failing task (with
//! `continue_on_error` off) or a cancellation can tear the whole group
//! down. Once closing, new spawns are refused with
//! [`ProcessError::Closing`], which callers treat as a non-failure.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::Notify;

use crate::error::ProcessError;

#[derive(Debug, Default)]
pub struct ProcessManager {
    closing: AtomicBool,
    kill_signals: Mutex<Vec<Arc<Notify>>>,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Spawn a command with piped output, registered for teardown.
    pub fn spawn(&self, command: &mut Command) -> Result<ManagedChild, ProcessError> {
        if self.is_closing() {
            return Err(ProcessError::Closing);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let child = command
            .spawn()
            .map_err(|err| ProcessError::Spawn(err.to_string()))?;

        let kill = Arc::new(Notify::new());
        self.kill_signals.lock().unwrap().push(kill.clone());
        Ok(ManagedChild { child, kill })
    }

    /// Refuse further spawns and ask every child to terminate, most recent
    /// first.
    pub fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let signals = self.kill_signals.lock().unwrap();
        for signal in signals.iter().rev() {
            // notify_one stores a permit, so a child that has not yet
            // reached wait() still observes the kill
            signal.notify_one();
        }
    }
}

/// A spawned child plus its kill handle.
#[derive(Debug)]
pub struct ManagedChild {
    child: Child,
    kill: Arc<Notify>,
}

impl ManagedChild {
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Wait for exit. A kill request terminates the child and reports
    /// [`ProcessError::Closing`].
    pub async fn wait(self) -> Result<(), ProcessError> {
        let ManagedChild { mut child, kill } = self;
        tokio::select! {
            status = child.wait() => match status {
                Ok(status) if status.success() => Ok(()),
                Ok(status) => Err(ProcessError::ChildExit {
                    exit_code: status.code().unwrap_or(1),
                }),
                Err(err) => Err(ProcessError::Spawn(err.to_string())),
            },
            _ = kill.notified() => {
                let _ = child.kill().await;
                Err(ProcessError::Closing)
            }
        }
    }
}
