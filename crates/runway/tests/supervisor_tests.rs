use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use runway::{
    BrowserLauncher, ChildSpec, DiagnosticSink, PortAssignment, ProcessError, ProcessHandle,
    ProcessId, ProcessLifecycle, ProcessManager, ProcessStatus, ProcessTermination, RunwayError,
    ShutdownReason, StdinMode, Supervisor, SupervisorConfig, SupervisorConfigBuilder,
    SupervisorState, TerminationResult, find_free_port,
};
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio_util::sync::CancellationToken;

/// How a fake child behaves
#[derive(Clone, Default)]
struct Plan {
    fail_spawn: bool,
    /// Bind the port from `PORT` while running
    listen: bool,
    /// Exit with the code once polled this many times
    exit_after: Option<(u32, i32)>,
    ignore_term: bool,
}

#[derive(Default)]
struct Journal {
    events: Vec<String>,
    envs: HashMap<String, HashMap<String, String>>,
    /// Ports the fake children managed to bind
    bound: Vec<u16>,
}

type SharedJournal = Arc<Mutex<Journal>>;

fn record(journal: &SharedJournal, event: String) {
    journal.lock().unwrap().events.push(event);
}

struct MockHandle {
    name: String,
    plan: Plan,
    polls: u32,
    status: Option<ProcessStatus>,
    listener: Option<std::net::TcpListener>,
}

impl MockHandle {
    fn exit(&mut self, status: ProcessStatus) {
        self.status = Some(status);
        self.listener = None;
    }
}

#[async_trait]
impl ProcessHandle for MockHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_pid(&self) -> Option<ProcessId> {
        self.status.is_none().then_some(ProcessId(4242))
    }

    async fn try_wait(&mut self) -> Result<Option<ProcessStatus>> {
        if self.status.is_some() {
            return Ok(self.status);
        }
        self.polls += 1;
        if let Some((polls, code)) = self.plan.exit_after {
            if self.polls >= polls {
                self.exit(ProcessStatus::Exited(code));
            }
        }
        Ok(self.status)
    }

    async fn wait(&mut self) -> Result<ProcessStatus> {
        loop {
            if let Some(status) = self.try_wait().await? {
                return Ok(status);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn kill(&mut self) -> Result<()> {
        if self.status.is_none() {
            self.exit(ProcessStatus::Signaled(9));
        }
        Ok(())
    }
}

#[derive(Default)]
struct MockManager {
    plans: HashMap<String, Plan>,
    journal: SharedJournal,
}

impl MockManager {
    fn with_plan(mut self, name: &str, plan: Plan) -> Self {
        self.plans.insert(name.to_string(), plan);
        self
    }

    fn plan(&self, name: &str) -> Plan {
        self.plans.get(name).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl ProcessLifecycle for MockManager {
    type Handle = MockHandle;

    async fn spawn_process(
        &self,
        spec: &ChildSpec,
        env: &HashMap<String, String>,
    ) -> Result<Self::Handle, ProcessError> {
        record(&self.journal, format!("spawn:{}", spec.name));
        let plan = self.plan(&spec.name);
        if plan.fail_spawn {
            return Err(ProcessError::spawn_failed(
                spec.display_command(),
                std::io::Error::new(std::io::ErrorKind::NotFound, "no such program"),
            ));
        }
        self.journal
            .lock()
            .unwrap()
            .envs
            .insert(spec.name.clone(), env.clone());

        let listener = if plan.listen {
            let port: u16 = env["PORT"].parse().unwrap();
            let listener = std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
            self.journal.lock().unwrap().bound.push(port);
            Some(listener)
        } else {
            None
        };

        Ok(MockHandle {
            name: spec.name.clone(),
            plan,
            polls: 0,
            status: None,
            listener,
        })
    }
}

#[async_trait]
impl ProcessTermination for MockManager {
    async fn terminate_gracefully(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
        record(&self.journal, format!("term:{}", handle.name()));
        if !self.plan(handle.name()).ignore_term {
            let _ = handle.kill().await;
        }
        TerminationResult::Success
    }

    async fn force_kill(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
        record(&self.journal, format!("kill:{}", handle.name()));
        let _ = handle.kill().await;
        TerminationResult::Killed
    }
}

impl ProcessManager for MockManager {
    fn new() -> Self {
        Self::default()
    }
}

struct RecordingBrowser {
    urls: Arc<Mutex<Vec<String>>>,
    fail: bool,
}

impl BrowserLauncher for RecordingBrowser {
    fn open(&self, url: &str) -> Result<()> {
        self.urls.lock().unwrap().push(url.to_string());
        if self.fail {
            anyhow::bail!("no display available");
        }
        Ok(())
    }
}

fn child(name: &str) -> ChildSpec {
    ChildSpec::builder()
        .name(name)
        .command("node")
        .args([format!("{name}.js")])
        .build()
        .unwrap()
}

fn base_config(port: u16) -> SupervisorConfigBuilder {
    let mut builder = SupervisorConfig::builder();
    builder
        .requested_port(port)
        .ready_timeout(Duration::from_secs(3))
        .grace_period(Duration::from_millis(300))
        .monitor_interval(Duration::from_millis(20))
        .open_browser(false)
        .primary(child("web"))
        .env("BASE_ONLY", "1");
    builder
}

fn with_secondary(builder: &mut SupervisorConfigBuilder) -> &mut SupervisorConfigBuilder {
    let mut mcp = child("mcp");
    mcp.stdin = StdinMode::Piped;
    builder.secondary(mcp)
}

fn capture() -> (DiagnosticSink, DuplexStream) {
    let (writer, reader) = tokio::io::duplex(64 * 1024);
    (DiagnosticSink::new(Box::new(writer)), reader)
}

/// Everything written to the sink. All sink clones must be dropped first.
async fn drain(mut reader: DuplexStream) -> String {
    let mut out = String::new();
    reader.read_to_string(&mut out).await.unwrap();
    out
}

fn events(journal: &SharedJournal) -> Vec<String> {
    journal.lock().unwrap().events.clone()
}

fn env_of(journal: &SharedJournal, name: &str) -> HashMap<String, String> {
    journal.lock().unwrap().envs[name].clone()
}

fn free_port() -> u16 {
    find_free_port("127.0.0.1").unwrap()
}

#[tokio::test]
async fn test_primary_exit_code_becomes_run_result() {
    let port = free_port();
    let manager = MockManager::new().with_plan(
        "web",
        Plan {
            listen: true,
            exit_after: Some((5, 7)),
            ..Default::default()
        },
    );
    let journal = manager.journal.clone();

    let mut supervisor = Supervisor::new(base_config(port).build().unwrap(), manager);
    let report = supervisor.run(CancellationToken::new()).await.unwrap();

    assert_eq!(report.exit_code, 7);
    assert_eq!(
        report.reason,
        ShutdownReason::PrimaryExited(ProcessStatus::Exited(7))
    );
    assert_eq!(
        report.port,
        PortAssignment {
            requested: port,
            effective: port
        }
    );
    assert!(!report.port.was_substituted());
    assert_eq!(supervisor.state(), SupervisorState::Done);

    let env = env_of(&journal, "web");
    assert_eq!(env.get("PORT"), Some(&port.to_string()));
    assert_eq!(env.get("BASE_ONLY").map(String::as_str), Some("1"));

    // An exited primary needs no termination request.
    assert_eq!(events(&journal), vec!["spawn:web".to_string()]);
}

#[tokio::test]
async fn test_busy_port_is_substituted() {
    let taken = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let requested = taken.local_addr().unwrap().port();

    let manager = MockManager::new().with_plan(
        "web",
        Plan {
            listen: true,
            exit_after: Some((3, 0)),
            ..Default::default()
        },
    );
    let journal = manager.journal.clone();
    let (sink, reader) = capture();

    let mut supervisor =
        Supervisor::new(base_config(requested).build().unwrap(), manager).with_diagnostics(sink);
    let report = supervisor.run(CancellationToken::new()).await.unwrap();
    drop(supervisor);

    assert_eq!(report.exit_code, 0);
    assert_eq!(report.port.requested, requested);
    assert_ne!(report.port.effective, requested);
    assert!(report.port.was_substituted());

    let effective = report.port.effective.to_string();
    assert_eq!(env_of(&journal, "web").get("PORT"), Some(&effective));
    // The chosen port was free: the web child could bind it while the
    // requested port was still held.
    assert_eq!(journal.lock().unwrap().bound, vec![report.port.effective]);
    assert!(std::net::TcpListener::bind(("127.0.0.1", report.port.effective)).is_ok());

    let diagnostics = drain(reader).await;
    assert!(diagnostics.contains(&requested.to_string()), "{diagnostics}");
    assert!(diagnostics.contains(&effective), "{diagnostics}");
    drop(taken);
}

#[tokio::test]
async fn test_readiness_timeout_tears_down_with_failure_code() {
    let port = free_port();
    let manager = MockManager::new();
    let journal = manager.journal.clone();
    let urls = Arc::new(Mutex::new(Vec::new()));
    let (sink, reader) = capture();

    let mut builder = base_config(port);
    builder
        .ready_timeout(Duration::from_secs(1))
        .open_browser(true);

    let started = Instant::now();
    let mut supervisor = Supervisor::new(builder.build().unwrap(), manager)
        .with_diagnostics(sink)
        .with_browser(Box::new(RecordingBrowser {
            urls: urls.clone(),
            fail: false,
        }));
    let report = supervisor.run(CancellationToken::new()).await.unwrap();
    let elapsed = started.elapsed();
    drop(supervisor);

    assert_eq!(report.exit_code, 1);
    assert_eq!(report.reason, ShutdownReason::ReadinessTimeout);
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");

    assert_eq!(
        events(&journal),
        vec!["spawn:web".to_string(), "term:web".to_string()]
    );
    assert!(urls.lock().unwrap().is_empty());

    let diagnostics = drain(reader).await;
    assert!(
        diagnostics.contains(&format!(
            "Failed to start web server on port {port} within 1s."
        )),
        "{diagnostics}"
    );
}

#[tokio::test]
async fn test_secondary_spawn_failure_is_not_fatal() {
    let port = free_port();
    let manager = MockManager::new()
        .with_plan(
            "web",
            Plan {
                listen: true,
                exit_after: Some((3, 0)),
                ..Default::default()
            },
        )
        .with_plan(
            "mcp",
            Plan {
                fail_spawn: true,
                ..Default::default()
            },
        );
    let journal = manager.journal.clone();
    let (sink, reader) = capture();

    let mut builder = base_config(port);
    with_secondary(&mut builder);
    let mut supervisor =
        Supervisor::new(builder.build().unwrap(), manager).with_diagnostics(sink);
    let report = supervisor.run(CancellationToken::new()).await.unwrap();
    drop(supervisor);

    assert_eq!(report.exit_code, 0);
    assert_eq!(
        report.reason,
        ShutdownReason::PrimaryExited(ProcessStatus::Exited(0))
    );
    assert!(!events(&journal).contains(&"term:mcp".to_string()));

    let diagnostics = drain(reader).await;
    assert!(diagnostics.contains("could not be started"), "{diagnostics}");
}

#[tokio::test]
async fn test_secondary_exit_is_dropped_and_run_continues() {
    let port = free_port();
    let manager = MockManager::new()
        .with_plan(
            "web",
            Plan {
                listen: true,
                exit_after: Some((6, 2)),
                ..Default::default()
            },
        )
        .with_plan(
            "mcp",
            Plan {
                exit_after: Some((1, 5)),
                ..Default::default()
            },
        );
    let journal = manager.journal.clone();
    let (sink, reader) = capture();

    let mut builder = base_config(port);
    with_secondary(&mut builder);
    let mut supervisor =
        Supervisor::new(builder.build().unwrap(), manager).with_diagnostics(sink);
    let report = supervisor.run(CancellationToken::new()).await.unwrap();
    drop(supervisor);

    assert_eq!(report.exit_code, 2);
    assert_eq!(
        events(&journal),
        vec!["spawn:web".to_string(), "spawn:mcp".to_string()]
    );
    assert_eq!(
        env_of(&journal, "mcp").get("PORT"),
        Some(&port.to_string())
    );

    let diagnostics = drain(reader).await;
    assert!(diagnostics.contains("exited with code 5"), "{diagnostics}");
    assert!(!diagnostics.contains("could not be started"), "{diagnostics}");
}

#[tokio::test]
async fn test_interruption_stops_children_primary_first() {
    let port = free_port();
    let manager = MockManager::new().with_plan(
        "web",
        Plan {
            listen: true,
            ..Default::default()
        },
    );
    let journal = manager.journal.clone();

    let mut builder = base_config(port);
    with_secondary(&mut builder);
    let mut supervisor = Supervisor::new(builder.build().unwrap(), manager);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let report = supervisor.run(cancel).await.unwrap();

    assert_eq!(report.exit_code, 0);
    assert_eq!(report.reason, ShutdownReason::Interrupted);
    assert_eq!(
        events(&journal),
        vec![
            "spawn:web".to_string(),
            "spawn:mcp".to_string(),
            "term:web".to_string(),
            "term:mcp".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_stubborn_child_is_killed_after_grace() {
    let port = free_port();
    let manager = MockManager::new().with_plan(
        "web",
        Plan {
            listen: true,
            ignore_term: true,
            ..Default::default()
        },
    );
    let journal = manager.journal.clone();

    let config = base_config(port).build().unwrap();
    let grace = config.grace_period;
    let mut supervisor = Supervisor::new(config, manager);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let report = supervisor.run(cancel).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(report.exit_code, 0);
    assert_eq!(
        events(&journal),
        vec![
            "spawn:web".to_string(),
            "term:web".to_string(),
            "kill:web".to_string(),
        ]
    );
    assert!(elapsed >= grace, "killed before the grace period: {elapsed:?}");
}

#[tokio::test]
async fn test_force_token_skips_grace_period() {
    let port = free_port();
    let manager = MockManager::new().with_plan(
        "web",
        Plan {
            listen: true,
            ignore_term: true,
            ..Default::default()
        },
    );
    let journal = manager.journal.clone();

    let mut builder = base_config(port);
    builder.grace_period(Duration::from_secs(10));

    let cancel = CancellationToken::new();
    let force = CancellationToken::new();
    let mut supervisor =
        Supervisor::new(builder.build().unwrap(), manager).with_force_kill(force.clone());

    let (first, second) = (cancel.clone(), force.clone());
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        first.cancel();
        tokio::time::sleep(Duration::from_millis(200)).await;
        second.cancel();
    });

    let started = Instant::now();
    let report = supervisor.run(cancel).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(report.reason, ShutdownReason::Interrupted);
    assert!(elapsed < Duration::from_secs(3), "waited out the grace period: {elapsed:?}");
    assert_eq!(
        events(&journal),
        vec![
            "spawn:web".to_string(),
            "term:web".to_string(),
            "kill:web".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_primary_spawn_failure_is_fatal() {
    let port = free_port();
    let manager = MockManager::new().with_plan(
        "web",
        Plan {
            fail_spawn: true,
            ..Default::default()
        },
    );
    let journal = manager.journal.clone();

    let mut builder = base_config(port);
    with_secondary(&mut builder);
    let mut supervisor = Supervisor::new(builder.build().unwrap(), manager);
    let err = supervisor.run(CancellationToken::new()).await.unwrap_err();

    match &err {
        RunwayError::Spawn { role, .. } => assert_eq!(role, "primary"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.is_fatal());
    assert_eq!(err.as_label(), "spawn_error");
    assert!(err.to_string().contains("node web.js"));
    assert_eq!(events(&journal), vec!["spawn:web".to_string()]);
    assert_eq!(supervisor.state(), SupervisorState::Done);
}

#[tokio::test]
async fn test_browser_opened_with_effective_port() {
    let port = free_port();
    let manager = MockManager::new().with_plan(
        "web",
        Plan {
            listen: true,
            exit_after: Some((3, 0)),
            ..Default::default()
        },
    );
    let urls = Arc::new(Mutex::new(Vec::new()));

    let mut builder = base_config(port);
    builder.open_browser(true);
    let mut supervisor =
        Supervisor::new(builder.build().unwrap(), manager).with_browser(Box::new(
            RecordingBrowser {
                urls: urls.clone(),
                fail: false,
            },
        ));
    supervisor.run(CancellationToken::new()).await.unwrap();

    assert_eq!(
        *urls.lock().unwrap(),
        vec![format!("http://127.0.0.1:{port}/index.html")]
    );
}

#[tokio::test]
async fn test_browser_failure_is_ignored() {
    let port = free_port();
    let manager = MockManager::new().with_plan(
        "web",
        Plan {
            listen: true,
            exit_after: Some((3, 4)),
            ..Default::default()
        },
    );
    let urls = Arc::new(Mutex::new(Vec::new()));

    let mut builder = base_config(port);
    builder.open_browser(true);
    let mut supervisor =
        Supervisor::new(builder.build().unwrap(), manager).with_browser(Box::new(
            RecordingBrowser {
                urls: urls.clone(),
                fail: true,
            },
        ));
    let report = supervisor.run(CancellationToken::new()).await.unwrap();

    assert_eq!(report.exit_code, 4);
    assert_eq!(urls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_early_interruption_skips_browser_but_still_starts() {
    let port = free_port();
    let manager = MockManager::new().with_plan(
        "web",
        Plan {
            listen: true,
            ..Default::default()
        },
    );
    let journal = manager.journal.clone();
    let urls = Arc::new(Mutex::new(Vec::new()));

    let mut builder = base_config(port);
    builder.open_browser(true);
    let mut supervisor =
        Supervisor::new(builder.build().unwrap(), manager).with_browser(Box::new(
            RecordingBrowser {
                urls: urls.clone(),
                fail: false,
            },
        ));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = supervisor.run(cancel).await.unwrap();

    assert_eq!(report.reason, ShutdownReason::Interrupted);
    assert_eq!(report.exit_code, 0);
    assert!(urls.lock().unwrap().is_empty());
    assert_eq!(
        events(&journal),
        vec!["spawn:web".to_string(), "term:web".to_string()]
    );
}

#[tokio::test]
async fn test_child_env_layers_overrides_and_port() {
    let mut web = child("web");
    web.env.insert("MODE".to_string(), "child".to_string());
    web.env.insert("PORT".to_string(), "1".to_string());

    let mut builder = SupervisorConfig::builder();
    builder
        .primary(web.clone())
        .env("MODE", "base")
        .env("PATH", "/usr/bin");
    let supervisor = Supervisor::new(builder.build().unwrap(), MockManager::new());

    let env = supervisor.child_env(&web, 4321);
    assert_eq!(env.get("PORT").map(String::as_str), Some("4321"));
    assert_eq!(env.get("MODE").map(String::as_str), Some("child"));
    assert_eq!(env.get("PATH").map(String::as_str), Some("/usr/bin"));
}
