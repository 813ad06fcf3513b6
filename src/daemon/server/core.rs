//! Core DaemonServer struct and status checks.

use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::ControlPlaneConfig;

/// Maximum number of concurrent admin connections allowed.
pub(super) const MAX_CONNECTIONS: usize = 100;

/// Daemon status indicating process and socket state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    /// Daemon process not found
    NotRunning,
    /// Daemon process running and socket responsive
    Running,
    /// Daemon process exists but socket unreachable (hung or still starting)
    ProcessOnly,
}

/// Control plane daemon listening on `run/vigil.sock`.
pub struct DaemonServer {
    pub(super) config: ControlPlaneConfig,
    pub(super) socket_path: PathBuf,
    pub(super) pid_path: PathBuf,
    pub(super) log_path: PathBuf,
    pub(super) shutdown_flag: Arc<AtomicBool>,
    pub(super) connection_count: Arc<AtomicUsize>,
}

impl DaemonServer {
    pub fn new(config: ControlPlaneConfig) -> Self {
        Self {
            socket_path: config.socket_path(),
            pid_path: config.pid_path(),
            log_path: config.log_path(),
            config,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            connection_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Check daemon status with a socket connectivity test. Stale pid and
    /// socket files are removed along the way.
    pub fn check_status(config: &ControlPlaneConfig) -> DaemonStatus {
        let pid_path = config.pid_path();
        let socket_path = config.socket_path();

        if !socket_path.exists() {
            if let Some(pid) = Self::read_pid(config) {
                if crate::process::is_process_alive(pid) {
                    return DaemonStatus::ProcessOnly;
                }
                let _ = std::fs::remove_file(&pid_path);
            }
            return DaemonStatus::NotRunning;
        }

        let Some(pid) = Self::read_pid(config) else {
            let _ = std::fs::remove_file(&socket_path);
            return DaemonStatus::NotRunning;
        };

        if !crate::process::is_process_alive(pid) {
            let _ = std::fs::remove_file(&pid_path);
            let _ = std::fs::remove_file(&socket_path);
            return DaemonStatus::NotRunning;
        }

        // Connecting is the whole check.
        match UnixStream::connect(&socket_path) {
            Ok(_) => DaemonStatus::Running,
            Err(_) => DaemonStatus::ProcessOnly,
        }
    }

    /// `true` if a daemon is running, responsive or not.
    pub fn is_running(config: &ControlPlaneConfig) -> bool {
        matches!(
            Self::check_status(config),
            DaemonStatus::Running | DaemonStatus::ProcessOnly
        )
    }

    pub fn read_pid(config: &ControlPlaneConfig) -> Option<u32> {
        std::fs::read_to_string(config.pid_path())
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
    }

    /// Request graceful shutdown of the daemon.
    pub fn shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
    }
}
