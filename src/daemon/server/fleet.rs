//! The set of per-service supervisors owned by the daemon.

use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use super::super::protocol::ServiceStatus;
use crate::config::{ControlPlaneConfig, ENV_CONTROL_KEY, ENV_CONTROL_SOCKET};
use crate::control::{generate_key, Command, CommandPublisher};
use crate::errors::Result;
use crate::process::{self, LaunchSpec, Launcher, ProcessHandle};

/// How long a supervisor gets to wind down its service after `die`.
pub const SUPERVISOR_GRACE: Duration = Duration::from_secs(5);

struct Member<H> {
    name: String,
    handle: Option<H>,
}

/// Supervisors launched by the daemon, plus the control bus they listen on.
pub struct Fleet<L: Launcher> {
    launcher: L,
    publisher: CommandPublisher,
    members: Vec<Member<L::Handle>>,
    grace: Duration,
}

impl<L: Launcher> Fleet<L> {
    /// Bind the control bus with a fresh key. Nothing is launched yet.
    pub fn bind(control_socket: &Path, launcher: L, grace: Duration) -> Result<Self> {
        Ok(Self {
            launcher,
            publisher: CommandPublisher::bind(control_socket, generate_key())?,
            members: Vec::new(),
            grace,
        })
    }

    /// Command line for the supervisor of `name`: `<program> run <name> --root <root>`,
    /// with the control bus handed over through the environment.
    pub fn supervisor_spec(&self, program: &Path, config: &ControlPlaneConfig, name: &str) -> LaunchSpec {
        let command = [
            program.to_string_lossy().into_owned(),
            "run".to_string(),
            name.to_string(),
            "--root".to_string(),
            config.root.to_string_lossy().into_owned(),
        ];
        LaunchSpec::new(&command, &config.root)
            .env(ENV_CONTROL_KEY, self.publisher.key())
            .env(ENV_CONTROL_SOCKET, self.publisher.path().to_string_lossy())
    }

    /// Launch one supervisor per configured service. A service that fails to
    /// launch is recorded as not running; the rest still start.
    pub fn start_all(&mut self, program: &Path, config: &ControlPlaneConfig) -> usize {
        for entry in &config.services {
            let spec = self.supervisor_spec(program, config, &entry.name);
            let handle = match self.launcher.launch(&spec) {
                Ok(handle) => {
                    info!(service = %entry.name, pid = handle.pid(), "supervisor started");
                    Some(handle)
                }
                Err(e) => {
                    warn!(service = %entry.name, code = e.code(), error = %e, "supervisor failed to start");
                    None
                }
            };
            self.members.push(Member {
                name: entry.name.clone(),
                handle,
            });
        }
        self.members.iter().filter(|m| m.handle.is_some()).count()
    }

    pub fn status(&mut self) -> Vec<ServiceStatus> {
        self.members
            .iter_mut()
            .map(|member| match member.handle.as_mut() {
                Some(handle) => ServiceStatus {
                    name: member.name.clone(),
                    pid: Some(handle.pid()),
                    running: handle.try_exited().is_none(),
                },
                None => ServiceStatus {
                    name: member.name.clone(),
                    pid: None,
                    running: false,
                },
            })
            .collect()
    }

    /// Broadcast `die`, then give each supervisor the grace window before
    /// escalating to SIGTERM and SIGKILL.
    pub fn shutdown(&mut self) {
        let reached = self.publisher.publish(Command::Die);
        info!(reached, "shutdown broadcast to supervisors");

        for member in &mut self.members {
            let Some(handle) = member.handle.as_mut() else {
                continue;
            };
            match process::shutdown(handle, self.grace) {
                Ok(outcome) => info!(service = %member.name, ?outcome, "supervisor stopped"),
                Err(e) => warn!(service = %member.name, error = %e, "supervisor did not stop cleanly"),
            }
        }
        self.publisher.close();
    }
}
