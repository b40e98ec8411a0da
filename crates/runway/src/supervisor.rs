use std::collections::HashMap;

use runway_core::{
    ChildSpec, DiagnosticSink, KILL_REAP_TIMEOUT, PORT_ENV, PRIMARY_ROLE, ProcessHandle,
    ProcessManager, ProcessStatus, ProcessTermination, RunwayError, SECONDARY_ROLE,
    SupervisorConfig, find_free_port, is_port_open, wait_for_port,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::browser::{BrowserLauncher, SystemBrowser, browser_url};

/// Lifecycle phases of one supervised run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Configuring,
    PortCheck,
    Spawning,
    AwaitingReady,
    Monitoring,
    ShuttingDown,
    Done,
}

/// Port asked for and port actually handed to the primary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAssignment {
    pub requested: u16,
    pub effective: u16,
}

impl PortAssignment {
    fn unchanged(port: u16) -> Self {
        Self {
            requested: port,
            effective: port,
        }
    }

    /// True when the requested port was taken and another one was picked
    pub fn was_substituted(&self) -> bool {
        self.requested != self.effective
    }
}

/// Why the monitoring phase ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    PrimaryExited(ProcessStatus),
    ReadinessTimeout,
    Interrupted,
}

impl ShutdownReason {
    pub fn exit_code(&self) -> i32 {
        match self {
            ShutdownReason::PrimaryExited(status) => status.exit_code().unwrap_or(1),
            ShutdownReason::ReadinessTimeout => 1,
            ShutdownReason::Interrupted => 0,
        }
    }
}

/// Outcome of a completed run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub exit_code: i32,
    pub port: PortAssignment,
    pub reason: ShutdownReason,
}

struct Children<H> {
    primary: Option<H>,
    secondary: Option<H>,
}

impl<H> Default for Children<H> {
    fn default() -> Self {
        Self {
            primary: None,
            secondary: None,
        }
    }
}

/// Drives one run: port check, spawn, readiness wait, monitoring and shutdown.
///
/// Children are owned by the run and terminated exactly once on every exit
/// path, primary first. Handles dropped without shutdown (panic, aborted
/// future) are killed by the platform manager.
pub struct Supervisor<M: ProcessManager> {
    config: SupervisorConfig,
    manager: M,
    diagnostics: DiagnosticSink,
    browser: Box<dyn BrowserLauncher>,
    force: CancellationToken,
    state: SupervisorState,
}

impl<M: ProcessManager> Supervisor<M> {
    pub fn new(config: SupervisorConfig, manager: M) -> Self {
        Self {
            config,
            manager,
            diagnostics: DiagnosticSink::stderr(),
            browser: Box::new(SystemBrowser),
            force: CancellationToken::new(),
            state: SupervisorState::Configuring,
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: DiagnosticSink) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn with_browser(mut self, browser: Box<dyn BrowserLauncher>) -> Self {
        self.browser = browser;
        self
    }

    /// Token that cuts the shutdown grace period short.
    ///
    /// Once cancelled, children still being stopped are killed right away.
    pub fn with_force_kill(mut self, force: CancellationToken) -> Self {
        self.force = force;
        self
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Run to completion.
    ///
    /// `cancel` is checked at the top of every monitoring iteration and wakes
    /// the monitoring sleep; it does not interrupt spawning or the readiness
    /// wait. Only a failed primary spawn is returned as an error.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<RunReport, RunwayError> {
        self.enter(SupervisorState::PortCheck);
        let port = self.negotiate_port().await;

        let mut children = Children::default();
        let outcome = self.drive(port, &mut children, &cancel).await;

        self.enter(SupervisorState::ShuttingDown);
        self.shutdown(&mut children).await;
        self.enter(SupervisorState::Done);

        let reason = outcome?;
        let report = RunReport {
            exit_code: reason.exit_code(),
            port,
            reason,
        };
        info!(
            exit_code = report.exit_code,
            reason = ?report.reason,
            port = port.effective,
            "Run finished"
        );
        Ok(report)
    }

    fn enter(&mut self, next: SupervisorState) {
        debug!(from = ?self.state, to = ?next, "Supervisor state change");
        self.state = next;
    }

    async fn negotiate_port(&self) -> PortAssignment {
        let host = self.config.host.as_str();
        let requested = self.config.requested_port;

        if !is_port_open(host, requested, self.config.readiness.probe_timeout).await {
            return PortAssignment::unchanged(requested);
        }

        match find_free_port(host) {
            Ok(effective) => {
                info!(requested, effective, "Requested port is busy");
                self.diagnostics
                    .line(&format!(
                        "Port {requested} is already in use; starting on port {effective} instead."
                    ))
                    .await;
                PortAssignment {
                    requested,
                    effective,
                }
            }
            Err(e) => {
                warn!(error = %e, label = e.as_label(), "No free port found, keeping requested port");
                self.diagnostics
                    .line(&format!(
                        "Port {requested} is already in use and no free port could be found: {e}"
                    ))
                    .await;
                PortAssignment::unchanged(requested)
            }
        }
    }

    async fn drive(
        &mut self,
        port: PortAssignment,
        children: &mut Children<M::Handle>,
        cancel: &CancellationToken,
    ) -> Result<ShutdownReason, RunwayError> {
        self.enter(SupervisorState::Spawning);
        let primary = self
            .spawn_child(PRIMARY_ROLE, &self.config.primary, port.effective)
            .await?;
        children.primary = Some(primary);

        if let Some(spec) = &self.config.secondary {
            match self.spawn_child(SECONDARY_ROLE, spec, port.effective).await {
                Ok(handle) => children.secondary = Some(handle),
                Err(e) => {
                    info!(error = %e, fatal = e.is_fatal(), "Continuing without secondary service");
                    self.diagnostics
                        .line(&format!(
                            "Secondary service '{}' could not be started ({e}); continuing without it.",
                            spec.name
                        ))
                        .await;
                }
            }
        }

        self.enter(SupervisorState::AwaitingReady);
        let timeout = self.config.ready_timeout;
        if !wait_for_port(&self.config.host, port.effective, timeout, &self.config.readiness).await
        {
            let err = RunwayError::ReadinessTimeout {
                host: self.config.host.clone(),
                port: port.effective,
                timeout,
            };
            warn!(error = %err, label = err.as_label(), "Giving up on the web server");
            self.diagnostics
                .line(&format!(
                    "Failed to start web server on port {} within {}s.",
                    port.effective,
                    timeout.as_secs_f64()
                ))
                .await;
            return Ok(ShutdownReason::ReadinessTimeout);
        }

        if self.config.open_browser && !cancel.is_cancelled() {
            let url = browser_url(&self.config.host, port.effective);
            match self.browser.open(&url) {
                Ok(()) => info!(url = %url, "Opened browser"),
                Err(e) => debug!(url = %url, error = %e, "Could not open browser"),
            }
        }

        self.enter(SupervisorState::Monitoring);
        Ok(self.monitor(children, cancel).await)
    }

    async fn spawn_child(
        &self,
        role: &str,
        spec: &ChildSpec,
        port: u16,
    ) -> Result<M::Handle, RunwayError> {
        let env = self.child_env(spec, port);
        self.manager
            .spawn_process(spec, &env)
            .await
            .map_err(|source| RunwayError::Spawn {
                role: role.to_string(),
                source,
            })
    }

    /// Environment a child starts with: base environment, its own
    /// overrides, then the effective port.
    pub fn child_env(&self, spec: &ChildSpec, port: u16) -> HashMap<String, String> {
        let mut env = self.config.env.clone();
        env.extend(spec.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env.insert(PORT_ENV.to_string(), port.to_string());
        env
    }

    async fn monitor(
        &self,
        children: &mut Children<M::Handle>,
        cancel: &CancellationToken,
    ) -> ShutdownReason {
        loop {
            if cancel.is_cancelled() {
                info!("Interrupted, shutting down");
                return ShutdownReason::Interrupted;
            }

            let Some(primary) = children.primary.as_mut() else {
                return ShutdownReason::PrimaryExited(ProcessStatus::Unknown);
            };
            match primary.try_wait().await {
                Ok(Some(status)) => {
                    info!(name = primary.name(), status = ?status, "Primary process exited");
                    return ShutdownReason::PrimaryExited(status);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(name = primary.name(), error = %e, "Lost track of primary process");
                    return ShutdownReason::PrimaryExited(ProcessStatus::Unknown);
                }
            }

            if let Some(secondary) = children.secondary.as_mut() {
                let exited = match secondary.try_wait().await {
                    Ok(Some(status)) => Some(status),
                    Ok(None) => None,
                    Err(e) => {
                        warn!(name = secondary.name(), error = %e, "Lost track of secondary process");
                        Some(ProcessStatus::Unknown)
                    }
                };
                if let Some(status) = exited {
                    let message = format!(
                        "Secondary service '{}' exited with code {}; continuing without it.",
                        secondary.name(),
                        status.exit_code().unwrap_or(1)
                    );
                    info!(status = ?status, "Secondary process exited");
                    children.secondary = None;
                    self.diagnostics.line(&message).await;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(self.config.monitor_interval) => {}
            }
        }
    }

    async fn shutdown(&self, children: &mut Children<M::Handle>) {
        let grace = self.config.grace_period;
        for (role, slot) in [
            (PRIMARY_ROLE, &mut children.primary),
            (SECONDARY_ROLE, &mut children.secondary),
        ] {
            let Some(mut handle) = slot.take() else {
                continue;
            };
            let graceful = tokio::select! {
                biased;
                _ = self.force.cancelled() => None,
                result = self.manager.terminate(&mut handle, grace) => Some(result),
            };
            let result = match graceful {
                Some(result) => result,
                None => {
                    info!(role, name = handle.name(), "Forced shutdown, killing");
                    let result = self.manager.force_kill(&mut handle).await;
                    let _ = tokio::time::timeout(KILL_REAP_TIMEOUT, handle.wait()).await;
                    result
                }
            };
            if result.is_gone() {
                debug!(role, name = handle.name(), result = ?result, "Child stopped");
            } else {
                let err = RunwayError::Termination {
                    name: handle.name().to_string(),
                    reason: format!("{result:?}"),
                };
                warn!(role, error = %err, label = err.as_label(), "Child may still be running");
            }
        }
    }
}
