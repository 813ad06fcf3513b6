//! Unix socket transport for peer calls: `[u32 len][u64 seq][payload]`.

use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{debug, warn};

use super::{Connector, PeerChannel};
use crate::control::{bind_listener, spawn_acceptor};
use crate::errors::{Result, VigilError};
use crate::wire::{read_frame, write_frame};

fn encode(seq: u64, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(8 + payload.len());
    body.extend_from_slice(&seq.to_be_bytes());
    body.extend_from_slice(payload);
    body
}

fn decode(mut body: Vec<u8>) -> Result<(u64, Vec<u8>)> {
    if body.len() < 8 {
        return Err(VigilError::Protocol {
            context: "peer frame",
            details: format!("frame of {} bytes has no sequence number", body.len()),
        });
    }
    let payload = body.split_off(8);
    let mut seq = [0u8; 8];
    seq.copy_from_slice(&body);
    Ok((u64::from_be_bytes(seq), payload))
}

/// Opens a new connection to a peer's socket on every `connect`.
#[derive(Debug, Clone)]
pub struct UnixConnector {
    path: PathBuf,
}

impl UnixConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Connector for UnixConnector {
    type Channel = UnixChannel;

    fn connect(&mut self) -> Result<UnixChannel> {
        let stream = UnixStream::connect(&self.path).map_err(|e| VigilError::io(&self.path, e))?;
        Ok(UnixChannel { stream })
    }
}

#[derive(Debug)]
pub struct UnixChannel {
    stream: UnixStream,
}

impl PeerChannel for UnixChannel {
    fn send(&mut self, seq: u64, payload: &[u8]) -> Result<()> {
        write_frame(&mut self.stream, &encode(seq, payload))
    }

    fn recv(&mut self, deadline: Instant) -> Result<(u64, Vec<u8>)> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(VigilError::Timeout {
                operation: "peer reply",
                timeout_ms: 0,
            });
        }
        self.stream
            .set_read_timeout(Some(remaining))
            .map_err(|source| VigilError::Transport {
                context: "peer read timeout",
                source,
            })?;
        decode(read_frame(&mut self.stream)?)
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

/// Serves peer calls on a Unix socket, one thread per connection.
///
/// Each request is answered with the handler's reply under the request's
/// sequence number.
pub struct PeerServer {
    path: PathBuf,
    shutdown: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
}

impl PeerServer {
    pub fn bind<F>(path: &Path, handler: F) -> Result<Self>
    where
        F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        let listener = bind_listener(path)?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let handler = Arc::new(handler);

        let acceptor = spawn_acceptor("peer-acceptor", listener, Arc::clone(&shutdown), move |stream| {
            let handler = Arc::clone(&handler);
            let spawned = thread::Builder::new()
                .name("peer-connection".to_string())
                .spawn(move || serve_connection(stream, handler.as_ref()));
            if let Err(e) = spawned {
                warn!(error = %e, "failed to start peer connection thread");
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

impl Drop for PeerServer {
    fn drop(&mut self) {
        self.close();
    }
}

fn serve_connection<F>(mut stream: UnixStream, handler: &F)
where
    F: Fn(&[u8]) -> Vec<u8> + ?Sized,
{
    loop {
        let (seq, request) = match read_frame(&mut stream).and_then(decode) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "peer connection closed");
                return;
            }
        };
        let reply = handler(&request);
        if let Err(e) = write_frame(&mut stream, &encode(seq, &reply)) {
            debug!(seq, error = %e, "peer reply not delivered");
            return;
        }
    }
}
