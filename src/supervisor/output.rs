use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use tracing::warn;

use crate::control::{bind_listener, spawn_acceptor};
use crate::errors::{Result, VigilError};
use crate::sink::OutputLine;
use crate::wire::spawn_reader;

/// Accepts `out` connections from managed instances and forwards each
/// decoded [`OutputLine`] into the supervisor's inbox.
pub struct OutputServer {
    path: PathBuf,
    shutdown: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
}

impl OutputServer {
    pub fn bind<M>(path: &Path, tx: Sender<M>, wrap: fn(Result<OutputLine>) -> M) -> Result<Self>
    where
        M: Send + 'static,
    {
        let listener = bind_listener(path)?;
        let shutdown = Arc::new(AtomicBool::new(false));

        let acceptor = spawn_acceptor("output-acceptor", listener, Arc::clone(&shutdown), move |stream| {
            if let Err(e) = spawn_reader("output-reader", stream, tx.clone(), wrap, None) {
                warn!(error = %e, "failed to start output reader");
            }
        })
        .map_err(|e| VigilError::io(path, e))?;

        Ok(Self {
            path: path.to_path_buf(),
            shutdown,
            acceptor: Some(acceptor),
        })
    }

    pub fn close(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.acceptor.take() {
            let _ = handle.join();
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Drop for OutputServer {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{EventSink, OutputPublisher};
    use crossbeam_channel::unbounded;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_lines_are_forwarded() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("out.sock");
        let (tx, rx) = unbounded();
        let _server = OutputServer::bind(&path, tx, |line| line.ok()).expect("Failed to bind");

        let publisher = OutputPublisher::connect(&path).expect("Failed to connect");
        publisher.emit("MAIN", "HELLO");

        let line = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("No line forwarded")
            .expect("Line failed to decode");
        assert_eq!(line.category, "MAIN");
        assert_eq!(line.message, "HELLO");
    }
}
