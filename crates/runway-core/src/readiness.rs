use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::ReadinessConfig;

const UNBOUNDED_WAIT: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

#[derive(Debug)]
enum Attempt {
    Refused(std::io::Error),
    TimedOut,
    DeadlinePassed,
}

/// Poll `host:port` until it accepts a connection or `timeout` elapses.
///
/// Each attempt is bounded by `config.connect_timeout` and by the time left
/// before the deadline; failed attempts are spaced by `config.poll_interval`.
/// On failure the call returns no later than `timeout` plus one interval.
pub async fn wait_for_port(
    host: &str,
    port: u16,
    timeout: Duration,
    config: &ReadinessConfig,
) -> bool {
    let started = Instant::now();
    // Timeouts past the representable range wait without a deadline.
    let deadline = started
        .checked_add(timeout)
        .unwrap_or_else(|| started + UNBOUNDED_WAIT);
    let connect_timeout = config.connect_timeout;

    let attempt = move || async move {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Attempt::DeadlinePassed);
        }
        match tokio::time::timeout(remaining.min(connect_timeout), TcpStream::connect((host, port)))
            .await
        {
            Ok(Ok(stream)) => {
                drop(stream);
                Ok(())
            }
            Ok(Err(e)) => Err(Attempt::Refused(e)),
            Err(_) => Err(Attempt::TimedOut),
        }
    };

    let backoff = ConstantBuilder::default()
        .with_delay(config.poll_interval)
        .with_max_times(usize::MAX);

    let result = attempt
        .retry(backoff)
        .when(|e: &Attempt| !matches!(e, Attempt::DeadlinePassed) && Instant::now() < deadline)
        .notify(|e: &Attempt, delay: Duration| {
            debug!(host, port, error = ?e, retry_in = ?delay, "Server not ready yet");
        })
        .await;

    match result {
        Ok(()) => {
            info!(host, port, elapsed = ?started.elapsed(), "Server is accepting connections");
            true
        }
        Err(e) => {
            debug!(host, port, last_error = ?e, "Gave up waiting for server");
            false
        }
    }
}
