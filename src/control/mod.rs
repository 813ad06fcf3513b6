//! Authenticated command bus.
//!
//! A [`CommandPublisher`] fans keyed [`ControlMessage`]s out to every
//! connected [`CommandSubscriber`]. Receivers run each message through a
//! [`CommandGate`], which drops anything carrying the wrong key and makes
//! `die` take effect exactly once.

mod bus;
mod gate;
mod latch;
mod protocol;

pub(crate) use bus::{bind_listener, spawn_acceptor};
pub use bus::{CommandPublisher, CommandSubscriber};
pub use gate::{CommandGate, Delivery};
pub use latch::ShutdownLatch;
pub use protocol::{Command, ControlMessage};

/// Fresh random key for one run of a supervisor or control plane.
pub fn generate_key() -> String {
    uuid::Uuid::new_v4().to_string()
}
