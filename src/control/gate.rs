use std::sync::Arc;

use tracing::warn;

use super::latch::ShutdownLatch;
use super::protocol::{Command, ControlMessage};
use crate::errors::VigilError;
use crate::sink::{EventSink, SECURITY};

/// What happened to a command offered to a [`CommandGate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Key matched and the handler ran.
    Executed,
    /// Key matched but the command was a repeated `die`.
    Duplicate,
    /// Key did not match; nothing ran.
    Rejected,
}

/// Receiving side of the command bus: validates the key, then dispatches.
///
/// A wrong key is reported to the sink under `SECURITY` and otherwise ignored.
/// `die` passes through the shutdown latch so the handler sees it once.
pub struct CommandGate {
    secret: String,
    latch: ShutdownLatch,
    sink: Arc<dyn EventSink>,
}

impl CommandGate {
    pub fn new(secret: impl Into<String>, sink: Arc<dyn EventSink>) -> Self {
        Self::with_latch(secret, sink, ShutdownLatch::new())
    }

    pub fn with_latch(
        secret: impl Into<String>,
        sink: Arc<dyn EventSink>,
        latch: ShutdownLatch,
    ) -> Self {
        Self {
            secret: secret.into(),
            latch,
            sink,
        }
    }

    pub fn latch(&self) -> &ShutdownLatch {
        &self.latch
    }

    /// Check `message`'s key against this gate's secret.
    pub fn authorize(&self, message: &ControlMessage) -> Result<(), VigilError> {
        if message.authorize(&self.secret) {
            Ok(())
        } else {
            Err(VigilError::AuthRejected { channel: "command" })
        }
    }

    pub fn handle<F>(&self, message: &ControlMessage, mut on_command: F) -> Delivery
    where
        F: FnMut(Command),
    {
        if let Err(e) = self.authorize(message) {
            warn!(code = e.code(), error = %e, command = message.command.as_str(), "rejected command");
            self.sink.emit(SECURITY, "WRONG_KEY");
            return Delivery::Rejected;
        }

        match message.command {
            Command::Die => {
                if !self.latch.trip() {
                    return Delivery::Duplicate;
                }
                on_command(Command::Die);
            }
            Command::StatusProbe => on_command(Command::StatusProbe),
        }
        Delivery::Executed
    }
}
