use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use runway_core::{
    ChildSpec, DEFAULT_HOST, RunwayError, StdinMode, SupervisorConfig, load_env_file,
    merge_environment, requested_port,
};
use tracing::debug;

/// Start the web server (and optionally the MCP server) and open the app.
#[derive(Parser, Debug, Clone)]
#[command(name = "runway")]
#[command(about = "Run the local web server and open the app in a browser", long_about = None)]
pub struct Cli {
    /// Do not open a browser once the server is up
    #[arg(long)]
    pub no_open: bool,

    /// Also start the MCP server
    #[arg(long)]
    pub mcp: bool,

    /// Host to probe and open
    #[arg(long, value_name = "HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    /// Seconds to wait for the web server to accept connections
    #[arg(long, value_name = "SECONDS", default_value_t = 20.0, value_parser = parse_seconds)]
    pub timeout: f64,

    /// Port to request; overrides PORT from the environment
    #[arg(long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Directory the servers run in (defaults to the current directory)
    #[arg(long, value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// Env file to read (defaults to <root>/.env)
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,

    /// Seconds a server gets to stop before it is killed
    #[arg(long, value_name = "SECONDS", default_value_t = 6.0, value_parser = parse_seconds)]
    pub grace: f64,

    /// Web server program
    #[arg(long, value_name = "PROGRAM", default_value = "node")]
    pub server: String,

    /// Web server argument (repeatable)
    #[arg(
        long = "server-arg",
        value_name = "ARG",
        default_values = ["server.js"],
        allow_hyphen_values = true
    )]
    pub server_args: Vec<String>,

    /// MCP server program
    #[arg(long, value_name = "PROGRAM", default_value = "node")]
    pub mcp_server: String,

    /// MCP server argument (repeatable)
    #[arg(
        long = "mcp-arg",
        value_name = "ARG",
        default_values = ["mcp_server.mjs"],
        allow_hyphen_values = true
    )]
    pub mcp_args: Vec<String>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

fn parse_seconds(raw: &str) -> Result<f64, String> {
    let value: f64 = raw
        .trim()
        .parse()
        .map_err(|_| format!("`{raw}` is not a number of seconds"))?;
    if !value.is_finite() || value <= 0.0 {
        return Err(format!("`{raw}` must be a positive number of seconds"));
    }
    Ok(value)
}

fn seconds(flag: &str, value: f64) -> Result<Duration, RunwayError> {
    Duration::try_from_secs_f64(value)
        .ok()
        .filter(|d| !d.is_zero())
        .ok_or_else(|| RunwayError::ConfigurationError(format!("--{flag} {value} is out of range")))
}

fn absolutize(path: PathBuf, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

impl Cli {
    /// Resolve flags, env file and process environment into a run config.
    ///
    /// The real environment wins over the env file; `--port` wins over both.
    pub fn into_config<I>(self, process_env: I, cwd: &Path) -> Result<SupervisorConfig, RunwayError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let root = self
            .root
            .map(|path| absolutize(path, cwd))
            .unwrap_or_else(|| cwd.to_path_buf());
        let env_file = self
            .env_file
            .map(|path| absolutize(path, cwd))
            .unwrap_or_else(|| root.join(".env"));

        let env: HashMap<String, String> = merge_environment(process_env, load_env_file(&env_file));
        let requested = match self.port {
            Some(port) => port,
            None => requested_port(&env)?,
        };
        debug!(root = %root.display(), env_file = %env_file.display(), requested, "Resolved configuration");

        let primary = ChildSpec::builder()
            .name("web")
            .command(self.server)
            .args(self.server_args)
            .working_directory(root.clone())
            .stdin(StdinMode::Inherit)
            .build()
            .map_err(|e| RunwayError::ConfigurationError(e.to_string()))?;

        let mut builder = SupervisorConfig::builder();
        builder
            .host(self.host)
            .requested_port(requested)
            .ready_timeout(seconds("timeout", self.timeout)?)
            .grace_period(seconds("grace", self.grace)?)
            .open_browser(!self.no_open)
            .primary(primary)
            .env_multi(env);

        if self.mcp {
            let secondary = ChildSpec::builder()
                .name("mcp")
                .command(self.mcp_server)
                .args(self.mcp_args)
                .working_directory(root)
                .stdin(StdinMode::Piped)
                .build()
                .map_err(|e| RunwayError::ConfigurationError(e.to_string()))?;
            builder.secondary(secondary);
        }

        builder
            .build()
            .map_err(|e| RunwayError::ConfigurationError(e.to_string()))
    }
}
