//! Stop command - gracefully shuts down the control plane daemon

use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;

use crate::config::ControlPlaneConfig;
use crate::daemon::DaemonServer;

/// Stop the daemon rooted at `root`. Not running is not an error.
pub fn execute(root: &Path) -> Result<()> {
    let config = ControlPlaneConfig::at(root);

    if !DaemonServer::is_running(&config) {
        println!("{} Daemon is not running", "─".dimmed());
        return Ok(());
    }

    println!("{} Stopping daemon...", "→".cyan().bold());
    DaemonServer::stop(&config).context("Failed to stop daemon")?;

    println!("{} Daemon stopped", "✓".green().bold());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_stop_when_daemon_not_running() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        fs::create_dir(temp_dir.path().join("run")).expect("Failed to create run dir");

        assert!(execute(temp_dir.path()).is_ok());
    }

    #[test]
    fn test_stop_succeeds_when_root_is_bare() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        assert!(execute(temp_dir.path()).is_ok());
    }
}
