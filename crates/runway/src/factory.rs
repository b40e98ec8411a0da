use runway_core::ProcessManagerFactory;

/// Platform-independent factory that selects the appropriate implementation at compile time
pub struct PlatformProcessManagerFactory;

impl ProcessManagerFactory for PlatformProcessManagerFactory {
    #[cfg(unix)]
    type Manager = runway_unix::UnixProcessManager;

    #[cfg(windows)]
    type Manager = runway_windows::WindowsProcessManager;

    fn create_process_manager() -> Self::Manager {
        #[cfg(unix)]
        return runway_unix::UnixProcessManagerFactory::create_process_manager();

        #[cfg(windows)]
        return runway_windows::WindowsProcessManagerFactory::create_process_manager();
    }

    fn platform_name() -> &'static str {
        #[cfg(unix)]
        return runway_unix::UnixProcessManagerFactory::platform_name();

        #[cfg(windows)]
        return runway_windows::WindowsProcessManagerFactory::platform_name();
    }
}

/// Process manager used by the `runway` binary on this platform
pub type PlatformProcessManager = <PlatformProcessManagerFactory as ProcessManagerFactory>::Manager;
