//! Runway Core - Platform-independent abstractions and configurations
//!
//! This crate provides the process traits, configuration, error types and the
//! TCP probes shared by the platform crates and the supervisor.

mod config;
mod diagnostics;
mod env_file;
mod error;
mod probe;
mod process;
mod readiness;

pub use config::*;
pub use diagnostics::DiagnosticSink;
pub use env_file::{load_env_file, merge_environment, requested_port};
pub use error::*;
pub use probe::{find_free_port, is_port_open};
pub use process::*;
pub use readiness::wait_for_port;

/// Role name of the web server whose readiness gates the run
pub const PRIMARY_ROLE: &str = "primary";
/// Role name of the optional auxiliary server
pub const SECONDARY_ROLE: &str = "secondary";
