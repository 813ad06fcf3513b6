//! TOML configuration for supervised services and the control plane.
//!
//! A service file describes one managed program:
//!
//! ```toml
//! name = "hello"
//! command = ["python", "service.py"]
//! watch = [".py", ".html"]
//!
//! [env]
//! VAR1 = "abc"
//!
//! [timing]
//! heartbeat_interval_ms = 2000
//! heartbeat_timeout_ms = 1000
//! ```
//!
//! The control plane file (`vigil.toml`) lists the services the daemon starts.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, VigilError};
use crate::fingerprint::ScanOptions;

/// Name of the control plane configuration file.
pub const CONTROL_PLANE_FILE: &str = "vigil.toml";

/// Runtime directories created under the control plane root.
pub const RUN_DIR: &str = "run";
pub const LOGS_DIR: &str = "logs";
pub const TMP_DIR: &str = "tmp";

/// Environment handed to every managed instance.
pub const ENV_KEY: &str = "VIGIL_KEY";
pub const ENV_COMMAND_SOCKET: &str = "VIGIL_COMMAND_SOCKET";
pub const ENV_CHECKUP_SOCKET: &str = "VIGIL_CHECKUP_SOCKET";
pub const ENV_OUT_SOCKET: &str = "VIGIL_OUT_SOCKET";

/// Environment handed by the control plane daemon to each supervisor.
pub const ENV_CONTROL_KEY: &str = "VIGIL_CONTROL_KEY";
pub const ENV_CONTROL_SOCKET: &str = "VIGIL_CONTROL_SOCKET";

const DEFAULT_MAX_FILE_SIZE: u64 = 500 * 1024;
const DEFAULT_MAX_DEPTH: usize = 32;

fn default_watch() -> Vec<String> {
    [".py", ".js", ".php", ".rb", ".rs"]
        .iter()
        .map(|ext| (*ext).to_string())
        .collect()
}

fn default_exclude() -> Vec<String> {
    [".git", "target", "node_modules"]
        .iter()
        .map(|dir| (*dir).to_string())
        .collect()
}

fn default_max_file_size() -> u64 {
    DEFAULT_MAX_FILE_SIZE
}

fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

/// Timer settings for one supervisor, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub check_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub restart_debounce_ms: u64,
    pub kill_grace_ms: u64,
    pub max_launch_attempts: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 1000,
            heartbeat_interval_ms: 2000,
            heartbeat_timeout_ms: 1000,
            restart_debounce_ms: 800,
            kill_grace_ms: 500,
            max_launch_attempts: 3,
        }
    }
}

impl TimingConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn restart_debounce(&self) -> Duration {
        Duration::from_millis(self.restart_debounce_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    /// Check the invariants the heartbeat monitor depends on.
    ///
    /// The timeout must be strictly shorter than the probe interval so that at
    /// most one probe is ever outstanding.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 || self.check_interval_ms == 0 {
            return Err(VigilError::InvalidConfig {
                details: "timer intervals must be greater than zero".to_string(),
            });
        }
        if self.heartbeat_timeout_ms >= self.heartbeat_interval_ms {
            return Err(VigilError::InvalidConfig {
                details: format!(
                    "heartbeat_timeout_ms ({}) must be less than heartbeat_interval_ms ({})",
                    self.heartbeat_timeout_ms, self.heartbeat_interval_ms
                ),
            });
        }
        if self.max_launch_attempts == 0 {
            return Err(VigilError::InvalidConfig {
                details: "max_launch_attempts must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Socket paths a managed service connects to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    /// Command bus (supervisor publishes, service subscribes).
    pub command: PathBuf,
    /// Heartbeat channel (supervisor probes, service acknowledges).
    pub checkup: PathBuf,
    /// Output channel (service publishes log lines, supervisor relays them).
    pub out: PathBuf,
}

impl Endpoints {
    /// Conventional endpoint layout for a service inside a runtime directory.
    pub fn in_dir(run_dir: &Path, name: &str) -> Self {
        Self {
            command: run_dir.join(format!("{name}-command.sock")),
            checkup: run_dir.join(format!("{name}-checkup.sock")),
            out: run_dir.join(format!("{name}-out.sock")),
        }
    }

    fn resolve(self, base: &Path) -> Self {
        Self {
            command: resolve_path(base, self.command),
            checkup: resolve_path(base, self.checkup),
            out: resolve_path(base, self.out),
        }
    }
}

/// On-disk shape of a service file, before defaults are resolved.
#[derive(Debug, Deserialize)]
struct RawServiceConfig {
    name: String,
    command: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    working_dir: Option<PathBuf>,
    #[serde(default)]
    endpoints: Option<Endpoints>,
    #[serde(default = "default_watch")]
    watch: Vec<String>,
    #[serde(default = "default_exclude")]
    exclude: Vec<String>,
    #[serde(default = "default_max_file_size")]
    max_file_size: u64,
    #[serde(default = "default_max_depth")]
    max_depth: usize,
    #[serde(default)]
    timing: TimingConfig,
}

/// Fully resolved configuration for one supervised service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub name: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: PathBuf,
    pub endpoints: Endpoints,
    pub watch: Vec<String>,
    pub exclude: Vec<String>,
    pub max_file_size: u64,
    pub max_depth: usize,
    pub timing: TimingConfig,
}

impl ServiceConfig {
    /// Load a service file. Relative paths resolve against the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| VigilError::io(path, e))?;
        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        Self::from_toml(&content, base)
    }

    /// Parse a service definition, resolving relative paths against `base`.
    pub fn from_toml(content: &str, base: &Path) -> Result<Self> {
        let raw: RawServiceConfig = toml::from_str(content)?;

        if raw.name.trim().is_empty() {
            return Err(VigilError::InvalidConfig {
                details: "service name must not be empty".to_string(),
            });
        }
        if raw.command.is_empty() || raw.command[0].trim().is_empty() {
            return Err(VigilError::InvalidConfig {
                details: format!("service `{}` has an empty command", raw.name),
            });
        }
        raw.timing.validate()?;

        let working_dir = resolve_path(base, raw.working_dir.unwrap_or_else(|| PathBuf::from(".")));
        let endpoints = match raw.endpoints {
            Some(endpoints) => endpoints.resolve(base),
            None => Endpoints::in_dir(&base.join(RUN_DIR), &raw.name),
        };

        Ok(Self {
            name: raw.name,
            command: raw.command,
            env: raw.env,
            working_dir,
            endpoints,
            watch: raw.watch,
            exclude: raw.exclude,
            max_file_size: raw.max_file_size,
            max_depth: raw.max_depth,
            timing: raw.timing,
        })
    }

    /// Scan settings used by the change detector for this service.
    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            excluded_dirs: self.exclude.iter().cloned().collect(),
            allowed_extensions: self.watch.iter().cloned().collect(),
            max_file_size: self.max_file_size,
            max_depth: self.max_depth,
        }
    }
}

/// One `[[service]]` entry in `vigil.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub name: String,
    pub config: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
struct RawControlPlaneConfig {
    #[serde(default, rename = "service")]
    services: Vec<ServiceEntry>,
}

/// Control plane layout rooted at the directory holding `vigil.toml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPlaneConfig {
    pub root: PathBuf,
    pub services: Vec<ServiceEntry>,
}

impl ControlPlaneConfig {
    /// Layout rooted at `root` with no services, for commands that only need
    /// the runtime paths.
    pub fn at(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            services: Vec::new(),
        }
    }

    /// Load `vigil.toml` from `root`. A missing file means no services.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(CONTROL_PLANE_FILE);
        let raw = match fs::read_to_string(&path) {
            Ok(content) => toml::from_str::<RawControlPlaneConfig>(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RawControlPlaneConfig::default(),
            Err(e) => return Err(VigilError::io(&path, e)),
        };

        let mut seen = std::collections::HashSet::new();
        for entry in &raw.services {
            if !seen.insert(entry.name.as_str()) {
                return Err(VigilError::InvalidConfig {
                    details: format!("service `{}` is listed twice", entry.name),
                });
            }
        }

        let services = raw
            .services
            .into_iter()
            .map(|entry| ServiceEntry {
                config: resolve_path(root, entry.config),
                name: entry.name,
            })
            .collect();

        Ok(Self {
            root: root.to_path_buf(),
            services,
        })
    }

    pub fn run_dir(&self) -> PathBuf {
        self.root.join(RUN_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(LOGS_DIR)
    }

    pub fn pid_path(&self) -> PathBuf {
        self.run_dir().join("vigil.pid")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.run_dir().join("vigil.sock")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.run_dir().join("vigil.lock")
    }

    pub fn control_socket_path(&self) -> PathBuf {
        self.run_dir().join("control.sock")
    }

    pub fn log_path(&self) -> PathBuf {
        self.logs_dir().join("vigil.log")
    }

    /// Create the runtime directories if they are missing.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [RUN_DIR, LOGS_DIR, TMP_DIR] {
            let path = self.root.join(dir);
            fs::create_dir_all(&path).map_err(|e| VigilError::io(&path, e))?;
        }
        Ok(())
    }
}

fn resolve_path(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}
