//! Daemon server lifecycle methods: start, stop, serve.

use std::fs::{self, File, OpenOptions, Permissions};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use nix::sys::signal::Signal;
use nix::unistd::{fork, setsid, ForkResult};
use tracing::{error, info, warn};

use super::super::protocol::{Request, Response, ServiceStatus};
use super::client::handle_client_connection;
use super::core::{DaemonServer, DaemonStatus, MAX_CONNECTIONS};
use super::fleet::{Fleet, SUPERVISOR_GRACE};
use crate::config::ControlPlaneConfig;
use crate::process::{self, Launcher, SystemLauncher};
use crate::wire::{read_message, write_message};

/// Open an admin connection and exchange one request.
fn request(config: &ControlPlaneConfig, request: &Request) -> Result<Response> {
    let socket_path = config.socket_path();
    let mut stream =
        UnixStream::connect(&socket_path).context("Failed to connect to daemon socket")?;
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .context("Failed to set read timeout")?;

    write_message(&mut stream, request).context("Failed to send request")?;

    match read_message(&mut stream) {
        Ok(response) => Ok(response),
        Err(e) if e.is_timeout() => bail!(
            "Daemon did not respond within 5 seconds. \
             It may be frozen. Try: kill $(cat {})",
            config.pid_path().display()
        ),
        Err(e) => Err(e).context("Failed to read daemon response"),
    }
}

impl DaemonServer {
    /// Stop a running daemon.
    ///
    /// Goes through the admin socket; a daemon whose socket is gone gets
    /// SIGTERM by pid instead.
    pub fn stop(config: &ControlPlaneConfig) -> Result<()> {
        match Self::check_status(config) {
            DaemonStatus::NotRunning => bail!("Daemon is not running"),
            DaemonStatus::ProcessOnly => {
                let pid = Self::read_pid(config).context("Daemon pid file disappeared")?;
                warn!(pid, "admin socket unreachable, sending SIGTERM");
                process::signal_pid(pid, Signal::SIGTERM).context("Failed to signal daemon")?;
                if !process::wait_for_pid_exit(pid, SUPERVISOR_GRACE * 2) {
                    bail!("Daemon (pid {pid}) did not exit after SIGTERM");
                }
                let _ = fs::remove_file(config.pid_path());
                Ok(())
            }
            DaemonStatus::Running => match request(config, &Request::Stop)? {
                Response::Ok => Ok(()),
                Response::Error { message } => bail!("Daemon returned error: {message}"),
                _ => bail!("Unexpected response from daemon"),
            },
        }
    }

    /// Ask a running daemon for the state of its supervisors.
    pub fn query_status(config: &ControlPlaneConfig) -> Result<Vec<ServiceStatus>> {
        match request(config, &Request::Status)? {
            Response::Status { services } => Ok(services),
            Response::Error { message } => bail!("Daemon returned error: {message}"),
            _ => bail!("Unexpected response from daemon"),
        }
    }

    /// Daemonize and serve. Only the daemon grandchild returns.
    pub fn start(&self) -> Result<()> {
        self.config.ensure_dirs()?;

        // Held across both forks; the daemon keeps it until it exits.
        let lock = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.config.lock_path())
            .context("Failed to open lock file")?;
        lock.try_lock_exclusive()
            .context("Another vigil daemon holds the lock")?;

        match unsafe { fork() }.context("First fork failed")? {
            ForkResult::Parent { .. } => std::process::exit(0),
            ForkResult::Child => {}
        }

        setsid().context("setsid failed")?;

        match unsafe { fork() }.context("Second fork failed")? {
            ForkResult::Parent { .. } => std::process::exit(0),
            ForkResult::Child => {}
        }

        let log_file = File::create(&self.log_path).context("Failed to create log file")?;
        let log_fd = log_file.as_raw_fd();

        unsafe {
            libc::close(0);
            if libc::dup2(log_fd, 1) < 0 {
                bail!("Failed to redirect stdout");
            }
            if libc::dup2(log_fd, 2) < 0 {
                bail!("Failed to redirect stderr");
            }
        }

        let result = self.run_foreground();
        drop(lock);
        result
    }

    /// Run the daemon in the current process, launching `vigil run` for
    /// every configured service.
    pub fn run_foreground(&self) -> Result<()> {
        let program = std::env::current_exe().context("Failed to locate vigil executable")?;
        self.serve(SystemLauncher, &program)
    }

    /// Write the pid file, start the fleet, and serve admin requests until
    /// asked to stop.
    pub fn serve<L: Launcher + 'static>(&self, launcher: L, program: &Path) -> Result<()> {
        self.config.ensure_dirs()?;
        fs::write(&self.pid_path, format!("{}", std::process::id()))
            .context("Failed to write PID file")?;

        if let Err(e) = fs::remove_file(&self.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e).context("Failed to remove stale socket file");
            }
        }

        let mut fleet = Fleet::bind(&self.config.control_socket_path(), launcher, SUPERVISOR_GRACE)
            .context("Failed to bind control bus")?;
        let started = fleet.start_all(program, &self.config);
        info!(started, configured = self.config.services.len(), "control plane up");

        let fleet = Arc::new(Mutex::new(fleet));
        let result = self.accept_loop(&fleet);

        match fleet.lock() {
            Ok(mut fleet) => fleet.shutdown(),
            Err(_) => error!("fleet lock poisoned, supervisors left running"),
        }

        self.cleanup()?;
        result
    }

    fn accept_loop<L: Launcher + 'static>(&self, fleet: &Arc<Mutex<Fleet<L>>>) -> Result<()> {
        let listener =
            UnixListener::bind(&self.socket_path).context("Failed to bind Unix socket")?;
        fs::set_permissions(&self.socket_path, Permissions::from_mode(0o600))
            .context("Failed to set socket permissions")?;
        listener
            .set_nonblocking(true)
            .context("Failed to set socket to non-blocking")?;

        while !self.shutdown_flag.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    let current = self.connection_count.load(Ordering::Relaxed);
                    if current >= MAX_CONNECTIONS {
                        warn!(limit = MAX_CONNECTIONS, "connection limit reached, rejecting");
                        drop(stream);
                        continue;
                    }
                    if let Err(e) = stream.set_nonblocking(false) {
                        warn!(error = %e, "failed to make admin connection blocking");
                        continue;
                    }

                    self.connection_count.fetch_add(1, Ordering::Relaxed);

                    let shutdown_flag = Arc::clone(&self.shutdown_flag);
                    let connection_count = Arc::clone(&self.connection_count);
                    let fleet = Arc::clone(fleet);

                    thread::spawn(move || {
                        let result = handle_client_connection(stream, shutdown_flag, fleet);
                        connection_count.fetch_sub(1, Ordering::Relaxed);
                        if let Err(e) = result {
                            warn!(error = %e, "admin client handler error");
                        }
                    });
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(100));
                }
                Err(e) => {
                    error!(error = %e, "accept error");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Remove socket and pid files.
    pub(super) fn cleanup(&self) -> Result<()> {
        for (path, what) in [(&self.socket_path, "socket"), (&self.pid_path, "PID")] {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(e).with_context(|| format!("Failed to remove {what} file"));
                }
            }
        }
        Ok(())
    }
}

impl Drop for DaemonServer {
    fn drop(&mut self) {
        // Files written by another daemon are left alone.
        if Self::read_pid(&self.config) == Some(std::process::id()) {
            let _ = self.cleanup();
        }
    }
}
