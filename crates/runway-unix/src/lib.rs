//! Unix process management: process groups, SIGTERM/SIGKILL escalation and
//! descendant sweeping.

#[cfg(unix)]
mod unix_process_manager;

#[cfg(unix)]
pub use unix_process_manager::{UnixProcessHandle, UnixProcessManager};

#[cfg(unix)]
pub struct UnixProcessManagerFactory;

#[cfg(unix)]
impl runway_core::ProcessManagerFactory for UnixProcessManagerFactory {
    type Manager = UnixProcessManager;

    fn create_process_manager() -> UnixProcessManager {
        use runway_core::ProcessManager;
        UnixProcessManager::new()
    }

    fn platform_name() -> &'static str {
        "Unix"
    }
}
