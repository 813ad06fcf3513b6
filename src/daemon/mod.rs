mod protocol;
mod server;

pub use protocol::{Request, Response, ServiceStatus};
pub use server::{DaemonServer, DaemonStatus, Fleet, SUPERVISOR_GRACE};
