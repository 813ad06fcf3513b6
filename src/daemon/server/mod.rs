//! Control plane daemon: admin socket, supervisor fleet, lifecycle.

mod client;
mod core;
mod fleet;
mod lifecycle;


pub use core::{DaemonServer, DaemonStatus};
pub use fleet::{Fleet, SUPERVISOR_GRACE};
