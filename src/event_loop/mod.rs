//! Single-threaded cooperative event loop.
//!
//! The loop waits on exactly one inbound queue with a deadline equal to the
//! next due timer. Socket readers run on their own threads and only forward
//! decoded frames into that queue; every handler runs on the loop thread, one
//! at a time, to completion.

mod driver;
mod scheduler;

pub use driver::{run, Flow, LoopHandler};
pub use scheduler::{Scheduler, TimerId};
