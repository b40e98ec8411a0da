//! OS signal handling.
//!
//! On Unix SIGINT, SIGTERM and SIGQUIT request shutdown; elsewhere only
//! Ctrl-C does. The first signal cancels the run's token, which the
//! supervisor notices at its next monitoring step. A second signal skips
//! the remaining grace period and kills the children.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = sigint.recv()  => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Cancel `cancel` on the first shutdown signal and `force` on the second.
///
/// The returned task ends once `force` is cancelled by either side.
pub fn cancel_on_shutdown_signal(
    cancel: CancellationToken,
    force: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        for (token, message) in [
            (&cancel, "Shutdown signal received"),
            (&force, "Second shutdown signal received, killing children"),
        ] {
            tokio::select! {
                result = wait_for_shutdown_signal() => match result {
                    Ok(()) => {
                        info!("{message}");
                        token.cancel();
                    }
                    Err(e) => {
                        warn!(error = %e, "Could not install signal handlers");
                        return;
                    }
                },
                _ = token.cancelled() => {}
            }
        }
    })
}
