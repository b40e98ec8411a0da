use anyhow::{Context, Result};
use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid as NixPid;
use runway_core::{
    ChildSpec, ProcessError, ProcessHandle, ProcessId, ProcessLifecycle, ProcessManager,
    ProcessStatus, ProcessTermination, StdinMode, TerminationResult,
};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Mutex;
use sysinfo::System;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Unix-specific process handle implementation
pub struct UnixProcessHandle {
    name: String,
    child: Child,
    status: Option<ProcessStatus>,
}

impl UnixProcessHandle {
    pub fn new(name: String, child: Child) -> Self {
        Self {
            name,
            child,
            status: None,
        }
    }
}

#[async_trait]
impl ProcessHandle for UnixProcessHandle {
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

/// Unix-specific process manager.
///
/// Every child leads its own process group so that termination reaches the
/// helpers it forks (e.g. `npm` -> `node`).
pub struct UnixProcessManager {
    system: Mutex<System>,
}

impl Default for UnixProcessManager {
    fn default() -> Self {
        <Self as ProcessManager>::new()
    }
}

#[async_trait]
impl ProcessLifecycle for UnixProcessManager {
    type Handle = UnixProcessHandle;

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

        // The map is the whole environment, not a delta.
        cmd.env_clear();
        cmd.envs(env);

        cmd.stdin(match spec.stdin {
            StdinMode::Inherit => Stdio::inherit(),
            StdinMode::Piped => Stdio::piped(),
            StdinMode::Null => Stdio::null(),
        });

        // New process group; terminal Ctrl-C reaches only the supervisor.
        cmd.process_group(0);
        cmd.kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| ProcessError::spawn_failed(spec.display_command(), e))?;

        if let Some(pid) = child.id() {
            info!(
                name = %spec.name,
                pid = %pid,
                command = %spec.command,
                args = ?spec.args,
                "Spawned Unix process"
            );
        }

        Ok(UnixProcessHandle::new(
            spec.name.clone(),
            child,
        ))
    }
}

#[async_trait]
impl ProcessTermination for UnixProcessManager {
    async fn terminate_gracefully(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
        match handle.get_pid() {
            Some(pid) => signal_group_or_process(pid, Signal::SIGTERM),
            None => TerminationResult::ProcessNotFound,
        }
    }

    async fn force_kill(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
        let Some(pid) = handle.get_pid() else {
            return TerminationResult::ProcessNotFound;
        };

        // Collect before killing: orphans get reparented once the root dies.
        let descendants = self.find_descendants(pid);

        let result = match signal_group_or_process(pid, Signal::SIGKILL) {
            TerminationResult::Success => TerminationResult::Killed,
            other => other,
        };

        for straggler in descendants {
            match signal::kill(NixPid::from_raw(straggler.0 as i32), Signal::SIGKILL) {
                Ok(()) => debug!(pid = %straggler, "Killed descendant process"),
                Err(nix::errno::Errno::ESRCH) => {}
                Err(e) => warn!(pid = %straggler, error = %e, "Failed to kill descendant process"),
            }
        }

        // Reap through the handle so the exit status is recorded.
        if let Err(e) = handle.kill().await {
            debug!(name = handle.name(), error = %e, "Handle kill cleanup failed");
        }

        result
    }
}

impl UnixProcessManager {
    /// Find all descendants of `root`, deepest first
    pub fn find_descendants(&self, root: ProcessId) -> Vec<ProcessId> {
        let mut system = match self.system.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        system.refresh_processes_specifics(
            sysinfo::ProcessesToUpdate::All,
            true,
            sysinfo::ProcessRefreshKind::nothing(),
        );

        let mut children = Vec::new();
        Self::find_children_recursive(&system, root.0, &mut children);
        children.into_iter().map(ProcessId::from).collect()
    }

    /// Recursively find all child processes
    fn find_children_recursive(system: &System, parent_pid: u32, result: &mut Vec<u32>) {
        for (pid, process) in system.processes() {
            if process.parent().map(|ppid| ppid.as_u32()) == Some(parent_pid) {
                let child_pid = pid.as_u32();
                // Recursively find grandchildren first
                Self::find_children_recursive(system, child_pid, result);
                result.push(child_pid);
            }
        }
    }
}

impl ProcessManager for UnixProcessManager {
    fn new() -> Self {
        debug!("Initializing Unix process manager");
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

/// Signal the process group led by `pid`, falling back to the single process.
fn signal_group_or_process(pid: ProcessId, sig: Signal) -> TerminationResult {
    let nix_pid = NixPid::from_raw(pid.0 as i32);

    match signal::killpg(nix_pid, sig) {
        Ok(()) => {
            info!(pid = %pid, signal = %sig, "Signalled process group");
            return TerminationResult::Success;
        }
        Err(nix::errno::Errno::ESRCH) => {
            debug!(pid = %pid, "Process group not found, signalling process");
        }
        Err(e) => {
            debug!(pid = %pid, error = %e, "Process group signal failed, signalling process");
        }
    }

    match signal::kill(nix_pid, sig) {
        Ok(()) => {
            info!(pid = %pid, signal = %sig, "Signalled process");
            TerminationResult::Success
        }
        Err(nix::errno::Errno::ESRCH) => {
            info!(pid = %pid, "Process not found (already terminated)");
            TerminationResult::ProcessNotFound
        }
        Err(nix::errno::Errno::EPERM) => {
            warn!(pid = %pid, "Permission denied to signal process");
            TerminationResult::AccessDenied
        }
        Err(e) => {
            warn!(pid = %pid, signal = %sig, error = %e, "Failed to signal process");
            TerminationResult::Failed(format!("{sig} failed: {e}"))
        }
    }
}
