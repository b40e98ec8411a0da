use anyhow::{Context, Result};
use async_trait::async_trait;
use runway_core::{
    ChildSpec, ProcessError, ProcessHandle, ProcessId, ProcessLifecycle, ProcessManager,
    ProcessStatus, ProcessTermination, StdinMode, TerminationResult,
};
use std::collections::HashMap;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Windows-specific process handle implementation
pub struct WindowsProcessHandle {
    name: String,
    child: Child,
    status: Option<ProcessStatus>,
}

impl WindowsProcessHandle {
    pub fn new(name: String, child: Child) -> Self {
        Self {
            name,
            child,
            status: None,
        }
    }
}

#[async_trait]
impl ProcessHandle for WindowsProcessHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_pid(&self) -> Option<ProcessId> {
        if self.status.is_some() {
            return None;
        }
        self.child.id().map(ProcessId::from)
    }

    async fn try_wait(&mut self) -> Result<Option<ProcessStatus>> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        let exited = self
            .child
            .try_wait()
            .with_context(|| format!("Failed to poll {}", self.name))?;
        self.status = exited.map(ProcessStatus::from);
        Ok(self.status)
    }

    async fn wait(&mut self) -> Result<ProcessStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let status = ProcessStatus::from(
            self.child
                .wait()
                .await
                .with_context(|| format!("Failed to wait for {}", self.name))?,
        );
        self.status = Some(status);
        Ok(status)
    }

    async fn kill(&mut self) -> Result<()> {
        if self.status.is_some() {
            return Ok(());
        }
        self.child
            .kill()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to kill process: {}", e))?;
        self.try_wait().await?;
        Ok(())
    }
}

/// Windows-specific process manager built on `taskkill`
#[derive(Default)]
pub struct WindowsProcessManager;

#[async_trait]
impl ProcessLifecycle for WindowsProcessManager {
    type Handle = WindowsProcessHandle;

    async fn spawn_process(
        &self,
        spec: &ChildSpec,
        env: &HashMap<String, String>,
    ) -> Result<Self::Handle, ProcessError> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args);

        if let Some(dir) = &spec.working_directory {
            cmd.current_dir(dir);
        }

        cmd.env_clear();
        cmd.envs(env);

        cmd.stdin(match spec.stdin {
            StdinMode::Inherit => Stdio::inherit(),
            StdinMode::Piped => Stdio::piped(),
            StdinMode::Null => Stdio::null(),
        });
        cmd.kill_on_drop(true);

        #[cfg(windows)]
        {
            // CREATE_NEW_PROCESS_GROUP: console Ctrl-C goes to the supervisor only
            cmd.creation_flags(0x00000200);
        }

        let child = cmd
            .spawn()
            .map_err(|e| ProcessError::spawn_failed(spec.display_command(), e))?;

        if let Some(pid) = child.id() {
            info!(
                name = %spec.name,
                pid = %pid,
                command = %spec.command,
                args = ?spec.args,
                "Spawned Windows process"
            );
        }

        Ok(WindowsProcessHandle::new(
            spec.name.clone(),
            child,
        ))
    }
}

#[async_trait]
impl ProcessTermination for WindowsProcessManager {
    async fn terminate_gracefully(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
        // taskkill without /F asks the tree to close
        let Some(pid) = handle.get_pid() else {
            return TerminationResult::ProcessNotFound;
        };
        match self.taskkill(pid.0, false).await {
            Ok(true) => {
                info!(pid = %pid, "Sent graceful termination to process tree");
                TerminationResult::Success
            }
            Ok(false) => {
                // Console programs without a window refuse the close request.
                debug!(pid = %pid, "Graceful termination refused");
                TerminationResult::Failed("taskkill refused graceful termination".to_string())
            }
            Err(e) => {
                warn!(pid = %pid, error = %e, "Failed to gracefully terminate process");
                TerminationResult::Failed(format!("Graceful termination failed: {e}"))
            }
        }
    }

    async fn force_kill(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
        let Some(pid) = handle.get_pid() else {
            return TerminationResult::ProcessNotFound;
        };

        let result = match self.taskkill(pid.0, true).await {
            Ok(true) => {
                info!(pid = %pid, "Force killed process tree");
                TerminationResult::Killed
            }
            Ok(false) => {
                info!(pid = %pid, "Process tree not found for force kill");
                TerminationResult::ProcessNotFound
            }
            Err(e) => {
                warn!(pid = %pid, error = %e, "taskkill failed");
                TerminationResult::Failed(format!("Force kill failed: {e}"))
            }
        };

        match handle.kill().await {
            Ok(()) => match result {
                TerminationResult::Failed(_) => TerminationResult::Killed,
                other => other,
            },
            Err(e) => {
                debug!(error = %e, "Handle kill cleanup failed");
                result
            }
        }
    }
}

impl WindowsProcessManager {
    /// Run `taskkill /T` against `pid`, with `/F` when forcing
    async fn taskkill(&self, pid: u32, force: bool) -> Result<bool> {
        let pid_string = pid.to_string();
        let mut args = vec!["/T", "/PID", pid_string.as_str()];
        if force {
            args.push("/F");
        }

        let output = Command::new("taskkill")
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await?;

        Ok(output.status.success())
    }
}

impl ProcessManager for WindowsProcessManager {
    fn new() -> Self {
        debug!("Initializing Windows process manager");
        Self
    }
}
