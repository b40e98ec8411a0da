use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::process::ExitStatus;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ChildSpec;

/// Time allowed for the OS to reap a child after a forced kill
pub const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Unique identifier for a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pub u32);

impl From<u32> for ProcessId {
    fn from(pid: u32) -> Self {
        ProcessId(pid)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Process is currently running
    Running,
    /// Process exited normally with the given exit code
    Exited(i32),
    /// Process was terminated by a signal (Unix only)
    Signaled(i32),
    /// Process is gone but the OS reported neither a code nor a signal
    Unknown,
}

impl ProcessStatus {
    /// Exit code to report for this status, `None` while running.
    ///
    /// Signal deaths follow the shell convention of `128 + signal`.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProcessStatus::Running => None,
            ProcessStatus::Exited(code) => Some(*code),
            ProcessStatus::Signaled(signal) => Some(128 + signal),
            ProcessStatus::Unknown => Some(1),
        }
    }
}

impl From<ExitStatus> for ProcessStatus {
    fn from(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ProcessStatus::Exited(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ProcessStatus::Signaled(signal);
            }
        }
        ProcessStatus::Unknown
    }
}

/// Result of a process termination operation
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    /// Process honoured the graceful request (or the signal was delivered)
    Success,
    /// Process had to be forcibly killed
    Killed,
    /// Process had already exited; nothing was sent
    AlreadyExited,
    /// Process was not found (exited between checks)
    ProcessNotFound,
    /// Permission denied (insufficient privileges)
    AccessDenied,
    /// Operation failed with specific error message
    Failed(String),
}

impl TerminationResult {
    /// Whether the process is known to be gone after this result
    pub fn is_gone(&self) -> bool {
        matches!(
            self,
            TerminationResult::Success
                | TerminationResult::Killed
                | TerminationResult::AlreadyExited
                | TerminationResult::ProcessNotFound
        )
    }
}

/// Error types for process operations
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn `{command}`: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl ProcessError {
    pub fn spawn_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        ProcessError::SpawnFailed {
            command: command.into(),
            source,
        }
    }
}

/// Trait representing a handle to a running process
///
/// A handle owns exactly one OS process. Dropping a handle whose process is
/// still running kills it.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// Logical name used in diagnostics
    fn name(&self) -> &str;

    /// Get the process ID (None if process has exited)
    fn get_pid(&self) -> Option<ProcessId>;

    /// Try to get exit status without blocking
    async fn try_wait(&mut self) -> Result<Option<ProcessStatus>>;

    /// Wait for the process to exit
    async fn wait(&mut self) -> Result<ProcessStatus>;

    /// Kill the process and reap it
    async fn kill(&mut self) -> Result<()>;
}

/// Core trait for process lifecycle management
#[async_trait]
pub trait ProcessLifecycle: Send + Sync {
    /// The type of process handle this lifecycle manager produces
    type Handle: ProcessHandle;

    /// Spawn a child described by `spec`.
    ///
    /// `env` is the complete environment of the child; the parent's
    /// environment is not inherited on top of it.
    async fn spawn_process(
        &self,
        spec: &ChildSpec,
        env: &HashMap<String, String>,
    ) -> Result<Self::Handle, ProcessError>;
}

/// Trait for process termination with escalation
#[async_trait]
pub trait ProcessTermination: Send + Sync {
    /// Ask a process to exit (SIGTERM on Unix)
    async fn terminate_gracefully(&self, handle: &mut dyn ProcessHandle) -> TerminationResult;

    /// Force kill a process (SIGKILL on Unix)
    async fn force_kill(&self, handle: &mut dyn ProcessHandle) -> TerminationResult;

    /// Complete termination strategy: graceful request -> bounded wait -> force kill.
    ///
    /// Never fails: every problem is logged and folded into the returned
    /// [`TerminationResult`]. Calling it on an exited process does nothing.
    async fn terminate(&self, handle: &mut dyn ProcessHandle, grace: Duration) -> TerminationResult {
        match handle.try_wait().await {
            Ok(Some(status)) => {
                debug!(name = handle.name(), ?status, "Process already exited");
                return TerminationResult::AlreadyExited;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(name = handle.name(), error = %e, "Could not query process status");
            }
        }

        match self.terminate_gracefully(handle).await {
            TerminationResult::Success => {
                match tokio::time::timeout(grace, handle.wait()).await {
                    Ok(Ok(status)) => {
                        debug!(name = handle.name(), ?status, "Process exited gracefully");
                        return TerminationResult::Success;
                    }
                    Ok(Err(e)) => {
                        warn!(name = handle.name(), error = %e, "Waiting for process exit failed");
                    }
                    Err(_) => {
                        warn!(
                            name = handle.name(),
                            grace = ?grace,
                            "Process ignored termination request, killing"
                        );
                    }
                }
            }
            TerminationResult::ProcessNotFound | TerminationResult::AlreadyExited => {
                let _ = tokio::time::timeout(KILL_REAP_TIMEOUT, handle.wait()).await;
                return TerminationResult::AlreadyExited;
            }
            other => {
                warn!(name = handle.name(), result = ?other, "Graceful termination failed");
            }
        }

        let result = self.force_kill(handle).await;
        if let Err(_elapsed) = tokio::time::timeout(KILL_REAP_TIMEOUT, handle.wait()).await {
            warn!(name = handle.name(), "Process still not reaped after kill");
        }
        result
    }
}

/// Process manager combining lifecycle and termination for one platform
pub trait ProcessManager: ProcessLifecycle + ProcessTermination {
    /// Create a new process manager instance
    fn new() -> Self
    where
        Self: Sized;
}

/// Factory trait for creating platform-specific process managers
pub trait ProcessManagerFactory {
    /// The type of process manager this factory creates
    type Manager: ProcessManager;

    /// Create a process manager for the current platform
    fn create_process_manager() -> Self::Manager;

    /// Get the platform name for logging and debugging
    fn platform_name() -> &'static str;
}
