//! Process supervision: one loop, one managed instance.
//!
//! The lifecycle lives in [`state`] as a pure transition function; the
//! [`Supervisor`] runtime turns its effects into process and socket actions
//! and feeds the results back as events.

mod output;
mod runtime;
pub mod state;

pub use output::OutputServer;
pub use runtime::{Inbound, Supervisor, Tick};
pub use state::{RestartCause, SupervisorState};
