//! Error types for kexboot.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using kexboot's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading or booting a target.
#[derive(Error, Debug)]
pub enum Error {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Placement errors
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    // Boot protocol errors
    #[error("boot protocol error: {0}")]
    Protocol(String),

    #[error("memory map error: {0}")]
    MemoryMap(String),

    #[error("hardware info unavailable: {0}")]
    HardwareInfoUnavailable(String),

    // Hand-off errors
    #[error("image switch failed: {0}")]
    ImageSwitch(#[source] std::io::Error),

    #[error("reboot request failed after the image was staged: {0}")]
    ExternalProcess(String),

    // Command and target errors
    #[error("invalid boot command: {0}")]
    InvalidCommand(String),

    #[error("unsupported target type: {0}")]
    UnsupportedTarget(String),

    #[error("failed to mount {device}: {reason}")]
    Mount { device: String, reason: String },

    #[error("target not in expected state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Whether the new kernel image may already be resident in memory.
    ///
    /// Only a failure after a successful image switch leaves the machine
    /// in a different state than before the boot attempt.
    pub fn image_staged(&self) -> bool {
        matches!(self, Error::ExternalProcess(_))
    }

    pub(crate) fn open(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Open {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn mount(device: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Mount {
            device: device.into(),
            reason: reason.into(),
        }
    }
}
