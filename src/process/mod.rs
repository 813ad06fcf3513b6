//! Launching, probing and terminating managed processes.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

use crate::errors::{Result, VigilError};

/// Check if a process with the given PID is alive
///
/// Uses `nix::sys::signal::kill` with signal `None` (signal 0). A process we
/// lack permission to signal (`EPERM`) still exists and counts as alive.
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Send `signal` to `pid`. Returns `false` if the process no longer exists.
pub fn signal_pid(pid: u32, signal: Signal) -> Result<bool> {
    let raw = i32::try_from(pid).map_err(|_| VigilError::Protocol {
        context: "signal_pid",
        details: format!("pid {pid} out of range"),
    })?;
    match kill(Pid::from_raw(raw), signal) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(errno) => Err(VigilError::Transport {
            context: "signal_pid",
            source: std::io::Error::from(errno),
        }),
    }
}

/// Poll until `pid` is gone or `timeout` elapses. Returns whether it exited.
pub fn wait_for_pid_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !is_process_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(50));
    }
}

/// How to start one instance of a managed program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl LaunchSpec {
    /// Build from a `[program, args...]` command line. An empty command
    /// becomes an empty program name, which fails at launch.
    pub fn new(command: &[String], working_dir: impl Into<PathBuf>) -> Self {
        let (program, args) = match command.split_first() {
            Some((program, args)) => (program.clone(), args.to_vec()),
            None => (String::new(), Vec::new()),
        };
        Self {
            program,
            args,
            working_dir: working_dir.into(),
            env: BTreeMap::new(),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }
}

impl fmt::Display for LaunchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// A running (or recently exited) managed instance.
pub trait ProcessHandle: Send {
    fn pid(&self) -> u32;

    /// Non-blocking exit check. Once an exit is observed it is remembered.
    fn try_exited(&mut self) -> Option<ExitStatus>;

    /// Ask the process to stop (SIGTERM).
    fn request_stop(&mut self) -> Result<()>;

    /// Block up to `grace` for the process to exit. Returns whether it did.
    fn wait_for_exit(&mut self, grace: Duration) -> bool;

    /// Force-kill by pid (SIGKILL). Returns without waiting; the exit shows
    /// up through [`try_exited`](Self::try_exited).
    fn kill(&mut self) -> Result<()>;
}

/// Starts managed instances.
pub trait Launcher: Send {
    type Handle: ProcessHandle;

    fn launch(&mut self, spec: &LaunchSpec) -> Result<Self::Handle>;
}

/// Launches real child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLauncher;

impl Launcher for SystemLauncher {
    type Handle = ChildProcess;

    fn launch(&mut self, spec: &LaunchSpec) -> Result<ChildProcess> {
        let child = Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(&spec.working_dir)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| VigilError::ProcessLaunch {
                command: spec.to_string(),
                source,
            })?;
        debug!(pid = child.id(), command = %spec, "launched process");
        Ok(ChildProcess::new(child))
    }
}

/// [`ProcessHandle`] over a `std::process::Child`.
#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
    exited: Option<ExitStatus>,
}

impl ChildProcess {
    pub fn new(child: Child) -> Self {
        Self {
            child,
            exited: None,
        }
    }
}

impl ProcessHandle for ChildProcess {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn try_exited(&mut self) -> Option<ExitStatus> {
        if self.exited.is_none() {
            self.exited = self.child.try_wait().ok().flatten();
        }
        self.exited
    }

    fn request_stop(&mut self) -> Result<()> {
        if self.try_exited().is_some() {
            return Ok(());
        }
        signal_pid(self.pid(), Signal::SIGTERM).map(|_| ())
    }

    fn wait_for_exit(&mut self, grace: Duration) -> bool {
        if self.try_exited().is_some() {
            return true;
        }
        match self.child.wait_timeout(grace) {
            Ok(Some(status)) => {
                self.exited = Some(status);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(pid = self.pid(), error = %e, "wait on child failed");
                false
            }
        }
    }

    fn kill(&mut self) -> Result<()> {
        if self.try_exited().is_some() {
            return Ok(());
        }
        signal_pid(self.pid(), Signal::SIGKILL).map(|_| ())
    }
}

/// How long [`reap`] waits for a SIGKILLed process to be collected.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// How an instance ended up stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited on its own within the grace window.
    Graceful,
    /// Had to be killed.
    Forced,
}

/// Wait up to `grace` for `handle` to exit, then kill it.
pub fn reap<H: ProcessHandle + ?Sized>(handle: &mut H, grace: Duration) -> Result<Termination> {
    if handle.wait_for_exit(grace) {
        return Ok(Termination::Graceful);
    }
    warn!(pid = handle.pid(), "process still running after grace period, killing");
    handle.kill()?;
    if !handle.wait_for_exit(KILL_REAP_TIMEOUT) {
        warn!(pid = handle.pid(), "killed process was not reaped");
    }
    Ok(Termination::Forced)
}

/// SIGTERM `handle`, then [`reap`] it.
pub fn terminate<H: ProcessHandle + ?Sized>(handle: &mut H, grace: Duration) -> Result<Termination> {
    handle.request_stop()?;
    reap(handle, grace)
}

/// Give an instance that was already told to exit one grace window, then
/// escalate through [`terminate`].
pub fn shutdown<H: ProcessHandle + ?Sized>(handle: &mut H, grace: Duration) -> Result<Termination> {
    if handle.wait_for_exit(grace) {
        return Ok(Termination::Graceful);
    }
    terminate(handle, grace)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec::new(
            &["sh".to_string(), "-c".to_string(), script.to_string()],
            std::env::temp_dir(),
        )
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn test_nonexistent_process_is_not_alive() {
        assert!(!is_process_alive(999999999));
    }

    #[test]
    fn test_u32_max_overflow_returns_false() {
        assert!(!is_process_alive(u32::MAX));
    }

    #[test]
    fn test_launch_spec_display_and_env() {
        let spec = LaunchSpec::new(&["python".to_string(), "service.py".to_string()], "/srv")
            .env("VIGIL_KEY", "abc");
        assert_eq!(spec.to_string(), "python service.py");
        assert_eq!(spec.env.get("VIGIL_KEY").map(String::as_str), Some("abc"));
    }

    #[test]
    fn test_launch_missing_program_fails() {
        let spec = LaunchSpec::new(&["/nonexistent/vigil-test-binary".to_string()], "/");
        let err = SystemLauncher.launch(&spec).unwrap_err();
        assert_eq!(err.code(), "VGL-3001");
    }

    #[test]
    fn test_terminate_stops_cooperative_child() {
        let mut child = SystemLauncher.launch(&sh("sleep 30")).expect("Failed to launch");
        let pid = child.pid();
        assert!(child.try_exited().is_none());

        let outcome = terminate(&mut child, Duration::from_secs(5)).unwrap();
        assert_eq!(outcome, Termination::Graceful);
        assert!(child.try_exited().is_some());
        assert!(!is_process_alive(pid));
    }

    #[test]
    fn test_reap_kills_after_grace() {
        let mut child = SystemLauncher
            .launch(&sh("trap '' TERM; sleep 30"))
            .expect("Failed to launch");
        thread::sleep(Duration::from_millis(100));

        let outcome = terminate(&mut child, Duration::from_millis(200)).unwrap();
        assert_eq!(outcome, Termination::Forced);
        assert!(child.try_exited().is_some());
    }

    #[test]
    fn test_kill_returns_before_exit_is_collected() {
        let mut child = SystemLauncher
            .launch(&sh("trap '' TERM; sleep 30"))
            .expect("Failed to launch");
        let pid = child.pid();

        child.kill().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while child.try_exited().is_none() {
            assert!(Instant::now() < deadline, "killed child never exited");
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!is_process_alive(pid));
    }

    #[test]
    fn test_environment_reaches_child() {
        let spec = sh("test \"$VIGIL_KEY\" = expected").env("VIGIL_KEY", "expected");
        let mut child = SystemLauncher.launch(&spec).expect("Failed to launch");
        assert!(child.wait_for_exit(Duration::from_secs(5)));
        assert!(child.try_exited().unwrap().success());
    }
}
