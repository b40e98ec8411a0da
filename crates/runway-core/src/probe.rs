//! TCP port probing.
//!
//! Probes are side-effect free beyond a transient connection that is closed
//! as soon as it is established.

use std::net::TcpListener;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

use crate::error::RunwayError;

/// Check whether something accepts TCP connections on `host:port`.
///
/// Any connection error, resolution failure or timeout counts as "not open".
pub async fn is_port_open(host: &str, port: u16, connect_timeout: Duration) -> bool {
    match tokio::time::timeout(connect_timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            drop(stream);
            true
        }
        Ok(Err(e)) => {
            debug!(host, port, error = %e, "Port probe refused");
            false
        }
        Err(_) => {
            debug!(host, port, timeout = ?connect_timeout, "Port probe timed out");
            false
        }
    }
}

/// Ask the OS for a currently unused port on `host`.
///
/// The listener is released before returning, so another process may grab
/// the port before the caller binds it.
pub fn find_free_port(host: &str) -> Result<u16, RunwayError> {
    let probe_error = |source| RunwayError::PortProbe {
        host: host.to_string(),
        source,
    };
    let listener = TcpListener::bind((host, 0)).map_err(probe_error)?;
    let port = listener.local_addr().map_err(probe_error)?.port();
    Ok(port)
}
