//! Run command - supervises one service in the foreground

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use colored::Colorize;
use tracing::warn;

use crate::config::{
    ControlPlaneConfig, ServiceConfig, CONTROL_PLANE_FILE, ENV_CONTROL_KEY, ENV_CONTROL_SOCKET,
};
use crate::process::SystemLauncher;
use crate::supervisor::{Inbound, Supervisor};

/// Find `service` in `vigil.toml` and load its service file.
pub fn resolve_service(root: &Path, service: &str) -> Result<ServiceConfig> {
    let control = ControlPlaneConfig::load(root)
        .with_context(|| format!("Failed to load {}", root.join(CONTROL_PLANE_FILE).display()))?;
    let entry = control
        .services
        .iter()
        .find(|entry| entry.name == service)
        .with_context(|| format!("Service `{service}` is not listed in {CONTROL_PLANE_FILE}"))?;
    ServiceConfig::load(&entry.config)
        .with_context(|| format!("Failed to load {}", entry.config.display()))
}

/// Supervise `service` until it is stopped by SIGINT/SIGTERM or by the
/// control plane.
pub fn execute(root: &Path, service: &str) -> Result<()> {
    let config = resolve_service(root, service)?;
    ControlPlaneConfig::at(root)
        .ensure_dirs()
        .context("Failed to create runtime directories")?;

    let mut supervisor =
        Supervisor::new(config, SystemLauncher).context("Failed to set up supervisor")?;

    // Set by the daemon; absent when run by hand.
    if let Ok(key) = std::env::var(ENV_CONTROL_KEY) {
        let socket = std::env::var(ENV_CONTROL_SOCKET)
            .map(PathBuf::from)
            .unwrap_or_else(|_| ControlPlaneConfig::at(root).control_socket_path());
        supervisor = supervisor.with_control_key(key);
        if let Err(e) = supervisor.connect_control(&socket) {
            warn!(error = %e, socket = %socket.display(), "control plane unreachable");
        }
    }

    let tx = supervisor.sender();
    ctrlc::set_handler(move || {
        let _ = tx.send(Inbound::Signal);
    })
    .context("Failed to install signal handler")?;

    println!("{} Supervising {}", "→".cyan().bold(), service.bold());
    supervisor.run();
    println!("{} {} stopped", "✓".green().bold(), service);
    Ok(())
}
