use serde::{Deserialize, Serialize};

/// Admin request to the control plane daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Ping to check if daemon is alive
    Ping,
    /// Report every supervised service
    Status,
    /// Stop all supervisors and exit
    Stop,
}

/// Daemon response to an admin client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Pong,
    Error { message: String },
    Status { services: Vec<ServiceStatus> },
}

/// One supervisor as seen by the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub pid: Option<u32>,
    pub running: bool,
}
