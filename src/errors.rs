//! Error taxonomy shared by the supervision components.
//!
//! Every variant carries a stable `VGL-xxxx` code so log lines can be grepped
//! without depending on message wording.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for library code.
pub type Result<T> = std::result::Result<T, VigilError>;

/// Top-level error type for vigil components.
#[derive(Debug, Error)]
pub enum VigilError {
    #[error("[VGL-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[VGL-1002] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[VGL-2001] command rejected: key mismatch on {channel}")]
    AuthRejected { channel: &'static str },

    #[error("[VGL-2002] {operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("[VGL-2003] channel desynchronised on {channel}: {details}")]
    ChannelDesync {
        channel: &'static str,
        details: String,
    },

    #[error("[VGL-2004] a heartbeat probe (seq {seq}) is already outstanding")]
    ProbeOutstanding { seq: u64 },

    #[error("[VGL-3001] failed to launch `{command}`: {source}")]
    ProcessLaunch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("[VGL-3002] scan of {path} failed: {source}")]
    ScanFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[VGL-3003] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[VGL-3004] protocol violation in {context}: {details}")]
    Protocol {
        context: &'static str,
        details: String,
    },

    #[error("[VGL-3005] transport failure in {context}: {source}")]
    Transport {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl VigilError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "VGL-1001",
            Self::ConfigParse { .. } => "VGL-1002",
            Self::AuthRejected { .. } => "VGL-2001",
            Self::Timeout { .. } => "VGL-2002",
            Self::ChannelDesync { .. } => "VGL-2003",
            Self::ProbeOutstanding { .. } => "VGL-2004",
            Self::ProcessLaunch { .. } => "VGL-3001",
            Self::ScanFailure { .. } => "VGL-3002",
            Self::Io { .. } => "VGL-3003",
            Self::Protocol { .. } => "VGL-3004",
            Self::Transport { .. } => "VGL-3005",
        }
    }

    /// Whether this is a transport read or write that hit its deadline.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Transport { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl From<serde_json::Error> for VigilError {
    fn from(value: serde_json::Error) -> Self {
        Self::Protocol {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for VigilError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}
