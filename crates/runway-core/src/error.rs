use std::time::Duration;

use thiserror::Error;

use crate::process::ProcessError;

/// Core error types for runway operations
#[derive(Error, Debug)]
pub enum RunwayError {
    #[error("Failed to start {role} process: {source}")]
    Spawn {
        role: String,
        #[source]
        source: ProcessError,
    },

    #[error("Port probe failed on {host}: {source}")]
    PortProbe {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server on {host}:{port} did not become ready within {timeout:?}")]
    ReadinessTimeout {
        host: String,
        port: u16,
        timeout: Duration,
    },

    #[error("Termination of {name} failed: {reason}")]
    Termination { name: String, reason: String },

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

impl RunwayError {
    /// Check if this error ends the whole run
    ///
    /// Only a failed primary spawn, a readiness timeout and bad configuration
    /// abort a run; everything else is isolated to the part that raised it.
    pub fn is_fatal(&self) -> bool {
        match self {
            RunwayError::Spawn { role, .. } => role == crate::PRIMARY_ROLE,
            RunwayError::ReadinessTimeout { .. } | RunwayError::ConfigurationError(_) => true,
            RunwayError::PortProbe { .. } | RunwayError::Termination { .. } => false,
        }
    }

    /// Short stable label for logs
    pub fn as_label(&self) -> &'static str {
        match self {
            RunwayError::Spawn { .. } => "spawn_error",
            RunwayError::PortProbe { .. } => "port_probe_error",
            RunwayError::ReadinessTimeout { .. } => "readiness_timeout",
            RunwayError::Termination { .. } => "termination_error",
            RunwayError::ConfigurationError(_) => "configuration_error",
        }
    }
}
