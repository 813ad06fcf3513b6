//! Unix socket transport for the command bus.

use std::fs::{self, Permissions};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;
use tracing::{debug, warn};

use super::protocol::{Command, ControlMessage};
use crate::errors::{Result, VigilError};
use crate::wire::{read_message, spawn_reader, write_message};

/// How long the acceptor sleeps when no subscriber is waiting.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A subscriber that cannot take a frame within this long is dropped.
const SUBSCRIBER_WRITE_TIMEOUT: Duration = Duration::from_millis(250);

/// Bind a listener at `path`, replacing a stale socket file, owner-only.
pub(crate) fn bind_listener(path: &Path) -> Result<UnixListener> {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            return Err(VigilError::io(path, e));
        }
    }
    let listener = UnixListener::bind(path).map_err(|e| VigilError::io(path, e))?;
    fs::set_permissions(path, Permissions::from_mode(0o600)).map_err(|e| VigilError::io(path, e))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| VigilError::io(path, e))?;
    Ok(listener)
}

/// Run `on_accept` for every connection until `shutdown` is set.
pub(crate) fn spawn_acceptor<F>(
    name: &str,
    listener: UnixListener,
    shutdown: Arc<AtomicBool>,
    mut on_accept: F,
) -> std::io::Result<JoinHandle<()>>
where
    F: FnMut(UnixStream) + Send + 'static,
{
    thread::Builder::new().name(name.to_string()).spawn(move || {
        while !shutdown.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    if let Err(e) = stream.set_nonblocking(false) {
                        warn!(error = %e, "failed to make accepted stream blocking");
                        continue;
                    }
                    on_accept(stream);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => {
                    warn!(error = %e, "accept failed, listener closing");
                    break;
                }
            }
        }
    })
}

/// Publishing side of the command bus.
///
/// Every connected subscriber receives every published message. Subscribers
/// whose socket fails or stalls a write are dropped from the list.
pub struct CommandPublisher {
    path: PathBuf,
    key: String,
    shutdown: Arc<AtomicBool>,
    subscribers: Arc<Mutex<Vec<UnixStream>>>,
    acceptor: Option<JoinHandle<()>>,
}

impl CommandPublisher {
    pub fn bind(path: &Path, key: impl Into<String>) -> Result<Self> {
        let listener = bind_listener(path)?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let subscribers: Arc<Mutex<Vec<UnixStream>>> = Arc::new(Mutex::new(Vec::new()));

        let accepted = Arc::clone(&subscribers);
        let acceptor = spawn_acceptor("command-acceptor", listener, Arc::clone(&shutdown), move |stream| {
            if let Err(e) = stream.set_write_timeout(Some(SUBSCRIBER_WRITE_TIMEOUT)) {
                warn!(error = %e, "failed to set subscriber write timeout, dropping it");
                return;
            }
            if let Ok(mut subs) = accepted.lock() {
                subs.push(stream);
            }
        })
        .map_err(|e| VigilError::io(path, e))?;

        Ok(Self {
            path: path.to_path_buf(),
            key: key.into(),
            shutdown,
            subscribers,
            acceptor: Some(acceptor),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Publish `command` under this publisher's key. Returns the number of
    /// subscribers it reached.
    pub fn publish(&self, command: Command) -> usize {
        self.publish_message(&ControlMessage::new(self.key.clone(), command))
    }

    /// Publish a prepared message as-is, whatever key it carries.
    pub fn publish_message(&self, message: &ControlMessage) -> usize {
        let Ok(mut subs) = self.subscribers.lock() else {
            return 0;
        };
        subs.retain_mut(|stream| match write_message(stream, message) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "dropping command subscriber");
                let _ = stream.shutdown(std::net::Shutdown::Both);
                false
            }
        });
        debug!(command = message.command.as_str(), reached = subs.len(), "published command");
        subs.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Stop accepting, drop every subscriber, remove the socket file.
    pub fn close(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.acceptor.take() {
            let _ = handle.join();
        }
        if let Ok(mut subs) = self.subscribers.lock() {
            for stream in subs.drain(..) {
                let _ = stream.shutdown(std::net::Shutdown::Both);
            }
        }
        let _ = fs::remove_file(&self.path);
    }
}

impl Drop for CommandPublisher {
    fn drop(&mut self) {
        self.close();
    }
}

/// Subscribing side of the command bus.
pub struct CommandSubscriber {
    stream: UnixStream,
}

impl CommandSubscriber {
    pub fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).map_err(|e| VigilError::io(path, e))?;
        Ok(Self { stream })
    }

    /// A second handle on the same subscription, e.g. to close it after the
    /// original was handed to [`forward`](Self::forward).
    pub fn try_clone(&self) -> Result<Self> {
        let stream = self.stream.try_clone().map_err(|source| VigilError::Transport {
            context: "clone command subscriber",
            source,
        })?;
        Ok(Self { stream })
    }

    /// Block for the next command.
    pub fn recv(&mut self) -> Result<ControlMessage> {
        read_message(&mut self.stream)
    }

    /// Hand the subscription to a reader thread that forwards each decoded
    /// message into `tx`, followed by `on_close` when the publisher goes away.
    pub fn forward<M, F>(self, tx: Sender<M>, wrap: F, on_close: Option<M>) -> Result<JoinHandle<()>>
    where
        M: Send + 'static,
        F: Fn(Result<ControlMessage>) -> M + Send + 'static,
    {
        spawn_reader("command-subscriber", self.stream, tx, wrap, on_close).map_err(|source| {
            VigilError::Transport {
                context: "spawn command reader",
                source,
            }
        })
    }

    pub fn close(&self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}
