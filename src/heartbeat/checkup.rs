//! Checkup socket: the supervisor probes, the service acknowledges.

use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::control::{bind_listener, spawn_acceptor};
use crate::errors::{Result, VigilError};
use crate::wire::{read_message, spawn_reader, write_message};

/// One heartbeat frame. `{"probe": 3}` out, `{"ack": 3}` back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckupFrame {
    Probe(u64),
    Ack(u64),
}

/// Events raised by a [`CheckupServer`], delivered into the owner's inbox.
#[derive(Debug)]
pub enum CheckupEvent {
    Connected(CheckupLink),
    Frame { link: u64, frame: Result<CheckupFrame> },
    Disconnected { link: u64 },
}

/// Write half of one accepted checkup connection.
#[derive(Debug)]
pub struct CheckupLink {
    id: u64,
    stream: UnixStream,
}

impl CheckupLink {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn send_probe(&mut self, seq: u64) -> Result<()> {
        write_message(&mut self.stream, &CheckupFrame::Probe(seq))
    }

    pub fn close(&self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

/// Listening side of the checkup channel.
///
/// Each accepted connection gets a link id. The write half is handed to the
/// owner as [`CheckupEvent::Connected`]; a reader thread forwards the read
/// half's frames.
pub struct CheckupServer {
    path: PathBuf,
    shutdown: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
}

impl CheckupServer {
    pub fn bind<M>(path: &Path, tx: Sender<M>) -> Result<Self>
    where
        M: From<CheckupEvent> + Send + 'static,
    {
        let listener = bind_listener(path)?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let next_link = AtomicU64::new(1);

        let acceptor = spawn_acceptor("checkup-acceptor", listener, Arc::clone(&shutdown), move |stream| {
            let id = next_link.fetch_add(1, Ordering::Relaxed);
            let writer = match stream.try_clone() {
                Ok(writer) => writer,
                Err(e) => {
                    warn!(error = %e, "failed to clone checkup stream");
                    return;
                }
            };

            debug!(link = id, "checkup link connected");
            if tx
                .send(M::from(CheckupEvent::Connected(CheckupLink { id, stream: writer })))
                .is_err()
            {
                return;
            }

            let spawned = spawn_reader(
                "checkup-reader",
                stream,
                tx.clone(),
                move |frame| M::from(CheckupEvent::Frame { link: id, frame }),
                Some(M::from(CheckupEvent::Disconnected { link: id })),
            );
            if let Err(e) = spawned {
                warn!(error = %e, "failed to start checkup reader");
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

impl Drop for CheckupServer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Service side of the checkup channel: answers every probe with its ack.
pub struct CheckupResponder {
    stream: UnixStream,
}

impl CheckupResponder {
    pub fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).map_err(|e| VigilError::io(path, e))?;
        Ok(Self { stream })
    }

    /// Read one probe and acknowledge it. Returns the sequence answered.
    pub fn answer_one(&mut self) -> Result<u64> {
        match read_message::<CheckupFrame, _>(&mut self.stream)? {
            CheckupFrame::Probe(seq) => {
                self.ack(seq)?;
                Ok(seq)
            }
            CheckupFrame::Ack(seq) => Err(VigilError::Protocol {
                context: "checkup responder",
                details: format!("received ack {seq} where a probe was expected"),
            }),
        }
    }

    /// Acknowledge probe `seq`.
    pub fn ack(&mut self, seq: u64) -> Result<()> {
        write_message(&mut self.stream, &CheckupFrame::Ack(seq))
    }

    /// Forward incoming frames into `tx` from a reader thread, leaving this
    /// handle free to write acks.
    pub fn forward<M, F>(&self, tx: Sender<M>, wrap: F, on_close: Option<M>) -> Result<JoinHandle<()>>
    where
        M: Send + 'static,
        F: Fn(Result<CheckupFrame>) -> M + Send + 'static,
    {
        let reader = self.stream.try_clone().map_err(|source| VigilError::Transport {
            context: "clone checkup stream",
            source,
        })?;
        spawn_reader("checkup-responder", reader, tx, wrap, on_close).map_err(|source| {
            VigilError::Transport {
                context: "spawn checkup reader",
                source,
            }
        })
    }

    pub fn close(&self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}
