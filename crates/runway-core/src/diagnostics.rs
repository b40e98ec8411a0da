use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Unpin + Sync + Send>>>;

/// Destination for the human-readable lines printed during a run
/// (port substitution, readiness timeout, secondary service status).
///
/// Defaults to stderr; tests hand in their own writer.
pub struct DiagnosticSink(SharedWriter);

impl Clone for DiagnosticSink {
    fn clone(&self) -> Self {
        DiagnosticSink(self.0.clone())
    }
}

impl Default for DiagnosticSink {
    fn default() -> Self {
        Self::stderr()
    }
}

impl DiagnosticSink {
    pub fn new(t: Box<dyn AsyncWrite + Unpin + Sync + Send>) -> DiagnosticSink {
        DiagnosticSink(Arc::new(Mutex::new(t)))
    }

    pub fn stderr() -> DiagnosticSink {
        Self::new(Box::new(tokio::io::stderr()))
    }

    /// Write one line. Output errors are ignored.
    pub async fn line(&self, message: &str) {
        let mut lock = self.0.lock().await;
        let _ = lock.write_all(message.as_bytes()).await;
        let _ = lock.write_all(b"\n").await;
        let _ = lock.flush().await;
    }
}
