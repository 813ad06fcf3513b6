//! Liveness probing for managed processes.

mod checkup;
mod monitor;

pub use checkup::{CheckupEvent, CheckupFrame, CheckupLink, CheckupResponder, CheckupServer};
pub use monitor::{HeartbeatMonitor, Liveness, ReplyOutcome, TimeoutOutcome};
