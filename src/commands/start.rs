//! Start command - launches the control plane daemon

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use colored::Colorize;

use crate::config::{ControlPlaneConfig, CONTROL_PLANE_FILE};
use crate::daemon::{DaemonServer, SUPERVISOR_GRACE};

/// Start the daemon for `root`, replacing one that is already running.
///
/// In the background case only the daemonized process returns from here.
pub fn execute(root: &Path, foreground: bool) -> Result<()> {
    let config = ControlPlaneConfig::load(root)
        .with_context(|| format!("Failed to load {}", root.join(CONTROL_PLANE_FILE).display()))?;
    config
        .ensure_dirs()
        .context("Failed to create runtime directories")?;

    if DaemonServer::is_running(&config) {
        println!("{} Stopping running daemon...", "→".cyan().bold());
        DaemonServer::stop(&config).context("Failed to stop running daemon")?;
        wait_until_stopped(&config, SUPERVISOR_GRACE * 2)?;
    }

    if config.services.is_empty() {
        println!(
            "{} No services listed in {}",
            "!".yellow().bold(),
            CONTROL_PLANE_FILE
        );
    }
    println!(
        "{} Starting control plane with {} service(s)",
        "→".cyan().bold(),
        config.services.len()
    );
    if !foreground {
        println!("  Logs: {}", config.log_path().display().to_string().dimmed());
    }

    let server = DaemonServer::new(config);
    if foreground {
        server.run_foreground()
    } else {
        server.start()
    }
}

fn wait_until_stopped(config: &ControlPlaneConfig, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while DaemonServer::is_running(config) {
        if Instant::now() >= deadline {
            bail!("Previous daemon did not exit within {}s", timeout.as_secs());
        }
        thread::sleep(Duration::from_millis(100));
    }
    Ok(())
}
