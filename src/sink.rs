//! Fire-and-forget `(category, message)` event sinks.
//!
//! Failures to deliver an event are swallowed here; nothing a sink does can
//! propagate into the component that emitted the event.

use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::{Result, VigilError};
use crate::wire::write_message;

/// Category used for authentication failures on the command channel.
pub const SECURITY: &str = "SECURITY";

/// One line published by a service on its `out` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    pub category: String,
    pub message: String,
}

/// Destination for operator-visible events.
pub trait EventSink: Send + Sync {
    fn emit(&self, category: &str, message: &str);
}

/// Writes events into the process log through `tracing`.
#[derive(Debug, Clone, Default)]
pub struct TracingSink {
    source: Option<String>,
}

impl TracingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tag every event with the service it came from.
    pub fn for_source(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
        }
    }
}

impl EventSink for TracingSink {
    fn emit(&self, category: &str, message: &str) {
        let source = self.source.as_deref().unwrap_or("-");
        if category == SECURITY {
            warn!(source, category, "{message}");
        } else {
            info!(source, category, "{message}");
        }
    }
}

/// Publishes events to a supervisor's `out` socket.
///
/// If the socket cannot be reached, or a write fails, the publisher falls back
/// to the local log and keeps going.
pub struct OutputPublisher {
    stream: Mutex<Option<UnixStream>>,
    fallback: TracingSink,
}

impl OutputPublisher {
    pub fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).map_err(|e| VigilError::io(path, e))?;
        Ok(Self {
            stream: Mutex::new(Some(stream)),
            fallback: TracingSink::new(),
        })
    }

    /// A publisher with no socket that only logs locally.
    pub fn detached() -> Self {
        Self {
            stream: Mutex::new(None),
            fallback: TracingSink::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.lock().map(|s| s.is_some()).unwrap_or(false)
    }
}

impl EventSink for OutputPublisher {
    fn emit(&self, category: &str, message: &str) {
        let line = OutputLine {
            category: category.to_string(),
            message: message.to_string(),
        };

        let delivered = match self.stream.lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(stream) => {
                    if write_message(stream, &line).is_ok() {
                        true
                    } else {
                        // Peer went away; stop trying.
                        *guard = None;
                        false
                    }
                }
                None => false,
            },
            Err(_) => false,
        };

        if !delivered {
            self.fallback.emit(category, message);
        }
    }
}

/// Collects events in memory. Useful for asserting on emitted events.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<(String, String)>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, String)> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Events whose category equals `category`.
    pub fn in_category(&self, category: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|(c, _)| c == category)
            .map(|(_, m)| m)
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, category: &str, message: &str) {
        if let Ok(mut events) = self.events.lock() {
            events.push((category.to_string(), message.to_string()));
        }
    }
}
