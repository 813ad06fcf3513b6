//! Status command - reports the daemon and its supervisors

use std::path::Path;

use anyhow::{bail, Context, Result};
use colored::Colorize;

use crate::config::ControlPlaneConfig;
use crate::daemon::{DaemonServer, DaemonStatus};

/// Print daemon and per-service state. Fails when the daemon is down, so
/// scripts can rely on the exit code.
pub fn execute(root: &Path) -> Result<()> {
    let config = ControlPlaneConfig::at(root);

    match DaemonServer::check_status(&config) {
        DaemonStatus::NotRunning => {
            println!("{} Daemon is not running", "─".dimmed());
            bail!("vigil is not running");
        }
        DaemonStatus::ProcessOnly => {
            let pid = DaemonServer::read_pid(&config).unwrap_or_default();
            println!(
                "{} Daemon process {} exists but its socket is unreachable",
                "!".yellow().bold(),
                pid
            );
            bail!("vigil is not responding");
        }
        DaemonStatus::Running => {}
    }

    let pid = DaemonServer::read_pid(&config).unwrap_or_default();
    println!("{} Daemon running (pid {})", "✓".green().bold(), pid);

    let services = DaemonServer::query_status(&config).context("Failed to query daemon")?;
    if services.is_empty() {
        println!("  {}", "no services configured".dimmed());
    }
    for service in services {
        let marker = if service.running {
            "●".green()
        } else {
            "○".red()
        };
        let pid = service
            .pid
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("  {marker} {:<20} pid {}", service.name.bold(), pid.dimmed());
    }
    Ok(())
}
