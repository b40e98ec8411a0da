//! Runway - local development server supervisor
//!
//! Starts the web server (and optionally the MCP server) as child processes,
//! picks a free port when the requested one is taken, waits for the web server
//! to accept connections, opens the browser and keeps watch until the web
//! server exits or the user interrupts. Every child is stopped on the way out.
//!
//! The platform-specific process handling lives in `runway-unix` and
//! `runway-windows`; [`PlatformProcessManagerFactory`] picks the right one.

mod browser;
mod cli;
mod factory;
mod logging;
mod signals;
mod supervisor;

pub use browser::{BrowserLauncher, SystemBrowser, browser_url};
pub use cli::Cli;
pub use factory::{PlatformProcessManager, PlatformProcessManagerFactory};
pub use logging::init_tracing;
pub use runway_core::*;
pub use signals::{cancel_on_shutdown_signal, wait_for_shutdown_signal};
pub use supervisor::{PortAssignment, RunReport, ShutdownReason, Supervisor, SupervisorState};
