use derive_builder::Builder;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Host the primary is probed and awaited on unless configured otherwise
pub const DEFAULT_HOST: &str = "127.0.0.1";
/// Port requested when neither `PORT` nor `--port` is given
pub const DEFAULT_PORT: u16 = 3000;
/// Environment variable carrying the port to the primary
pub const PORT_ENV: &str = "PORT";
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(6);
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_millis(250);

/// What the child's standard input is connected to
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdinMode {
    /// Share the supervisor's stdin
    #[default]
    Inherit,
    /// Open a pipe that stays open for the lifetime of the handle
    Piped,
    /// Connect to the null device
    Null,
}

/// Description of one child to launch
#[derive(Default, Debug, Clone, PartialEq, Builder)]
#[builder(setter(into, strip_option))]
pub struct ChildSpec {
    /// Logical name used in diagnostics
    pub name: String,
    pub command: String,
    #[builder(default)]
    #[builder(setter(custom))]
    pub args: Vec<String>,
    /// Per-child overrides applied on top of the supervisor environment
    #[builder(default)]
    #[builder(setter(custom))]
    pub env: HashMap<String, String>,
    #[builder(default)]
    pub working_directory: Option<PathBuf>,
    #[builder(default)]
    pub stdin: StdinMode,
}

impl ChildSpec {
    pub fn builder() -> ChildSpecBuilder {
        ChildSpecBuilder::default()
    }

    /// Command line for log output
    pub fn display_command(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl ChildSpecBuilder {
    pub fn args<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        let args: Vec<String> = iter.into_iter().map(|s| s.to_string()).collect();
        self.args = Some(args);
        self
    }

    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.env.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), value.to_string());
        self
    }
}

/// Timing of the TCP probes used for the port check and readiness wait
#[derive(Debug, Clone, PartialEq)]
pub struct ReadinessConfig {
    /// Pause between two readiness attempts
    pub poll_interval: Duration,
    /// Upper bound for a single readiness connect
    pub connect_timeout: Duration,
    /// Connect timeout of the initial "is the port taken" probe
    pub probe_timeout: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(150),
            connect_timeout: Duration::from_millis(800),
            probe_timeout: Duration::from_millis(350),
        }
    }
}

impl ReadinessConfig {
    /// Validate the configuration and return errors if invalid
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval.is_zero() {
            return Err(anyhow::anyhow!("poll_interval must be greater than zero"));
        }
        if self.connect_timeout.is_zero() || self.probe_timeout.is_zero() {
            return Err(anyhow::anyhow!("connect timeouts must be greater than zero"));
        }
        if self.connect_timeout >= Duration::from_secs(1) {
            return Err(anyhow::anyhow!(
                "connect_timeout must stay below one second per attempt"
            ));
        }
        Ok(())
    }
}

/// Resolved parameters of one supervised run
///
/// Built once at startup and never modified afterwards. The port actually
/// used is decided by the supervisor's port check, not stored here.
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(setter(into, strip_option), build_fn(validate = "Self::validate"))]
pub struct SupervisorConfig {
    #[builder(default = "DEFAULT_HOST.to_string()")]
    pub host: String,
    #[builder(default = "DEFAULT_PORT")]
    pub requested_port: u16,
    /// How long the primary may take to accept connections
    #[builder(default = "DEFAULT_READY_TIMEOUT")]
    pub ready_timeout: Duration,
    #[builder(default = "true")]
    pub open_browser: bool,
    pub primary: ChildSpec,
    /// Secondary service; `None` means it is not started
    #[builder(default)]
    pub secondary: Option<ChildSpec>,
    #[builder(default = "DEFAULT_GRACE_PERIOD")]
    pub grace_period: Duration,
    #[builder(default = "DEFAULT_MONITOR_INTERVAL")]
    pub monitor_interval: Duration,
    #[builder(default)]
    pub readiness: ReadinessConfig,
    /// Base environment every child starts from
    #[builder(default)]
    #[builder(setter(custom))]
    pub env: HashMap<String, String>,
}

impl SupervisorConfig {
    pub fn builder() -> SupervisorConfigBuilder {
        SupervisorConfigBuilder::default()
    }

    pub fn start_secondary(&self) -> bool {
        self.secondary.is_some()
    }
}

impl SupervisorConfigBuilder {
    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.env.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), value.to_string());
        self
    }

    pub fn env_multi<T: ToString, I: IntoIterator<Item = (T, T)>>(&mut self, iter: I) -> &mut Self {
        let env = self.env.get_or_insert_with(HashMap::new);
        for (key, value) in iter {
            env.insert(key.to_string(), value.to_string());
        }
        self
    }

    fn validate(&self) -> Result<(), String> {
        if let Some(host) = &self.host {
            if host.trim().is_empty() {
                return Err("host must not be empty".to_string());
            }
        }
        if let Some(timeout) = self.ready_timeout {
            if timeout.is_zero() {
                return Err("ready_timeout must be greater than zero".to_string());
            }
        }
        if let Some(interval) = self.monitor_interval {
            if interval.is_zero() {
                return Err("monitor_interval must be greater than zero".to_string());
            }
        }
        if let Some(readiness) = &self.readiness {
            readiness.validate().map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}
