//! Boot targets.
//!
//! A boot command's first word selects the kind of target; the rest is
//! interpreted by that kind. Every target follows the same life cycle:
//!
//! ```text
//! load() ──> Loading ──progress() == 1000──> Ready ──boot()──> Committed
//!               │                               │
//!               └────────── any error ──────────┴──> Failed
//! ```

pub mod arena;
pub mod command;
pub mod linux;
pub mod screen;
pub mod x86_64;

use std::fmt;
use std::os::fd::RawFd;

use crate::config::BootConfig;
use crate::error::{Error, Result};
use crate::kexec::SystemController;
use crate::mount::MountProvider;

pub use linux::{LinuxCommand, LinuxTarget};

/// Value reported by [`BootTarget::progress`] once everything is loaded.
pub const PROGRESS_SCALE: u32 = 1000;

/// Kinds of boot target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// A Linux bzImage with optional initrd
    Linux,
}

impl TargetKind {
    pub const ALL: [TargetKind; 1] = [TargetKind::Linux];

    /// The command word selecting this kind.
    pub fn name(&self) -> &'static str {
        match self {
            TargetKind::Linux => "linux",
        }
    }

    pub fn from_word(word: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == word)
    }

    /// Kind selected by a boot command.
    pub fn of_command(command: &str) -> Result<Self> {
        let (word, _) = command::split_word(command)
            .ok_or_else(|| Error::InvalidCommand("empty boot command".into()))?;
        Self::from_word(word).ok_or_else(|| Error::UnsupportedTarget(word.to_owned()))
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Life-cycle state of a loaded target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    /// Files are being read.
    Loading,
    /// Everything is in memory.
    Ready,
    /// The image was staged; the machine is rebooting.
    Committed,
    /// A step failed; the target can only be dropped.
    Failed,
}

impl TargetState {
    pub(crate) fn mismatch(self, actual: TargetState) -> Error {
        Error::InvalidState {
            expected: self.to_string(),
            actual: actual.to_string(),
        }
    }
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetState::Loading => write!(f, "loading"),
            TargetState::Ready => write!(f, "ready"),
            TargetState::Committed => write!(f, "committed"),
            TargetState::Failed => write!(f, "failed"),
        }
    }
}

/// A target being loaded, ready to boot, or booted.
///
/// Dropping a target cancels outstanding reads and releases its files and
/// mounts.
pub trait BootTarget: fmt::Debug {
    fn kind(&self) -> TargetKind;

    fn state(&self) -> TargetState;

    /// Descriptor that becomes readable when [`progress`](Self::progress)
    /// has work to do.
    fn readiness_fd(&self) -> RawFd;

    /// Account for completed reads without blocking.
    ///
    /// Returns a value in `0..=1000` that is 1000 exactly when everything
    /// has been read.
    fn progress(&mut self) -> Result<u32>;

    /// Stage the target and reboot into it. Only valid once loading is done.
    fn boot(&mut self, controller: &mut dyn SystemController) -> Result<()>;
}

/// Start loading the target a boot command describes.
pub fn load(
    command: &str,
    config: &BootConfig,
    mounts: &dyn MountProvider,
) -> Result<Box<dyn BootTarget>> {
    match TargetKind::of_command(command)? {
        TargetKind::Linux => Ok(Box::new(LinuxTarget::load(
            LinuxCommand::parse(command)?,
            config,
            mounts,
        )?)),
    }
}

/// Human-readable name of the target a boot command describes.
pub fn display_name(command: &str, mounts: &dyn MountProvider) -> Result<String> {
    match TargetKind::of_command(command)? {
        TargetKind::Linux => Ok(LinuxCommand::parse(command)?.display_name(mounts)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::HostPaths;

    #[test]
    fn test_target_kind_dispatch() {
        let kind = TargetKind::of_command("  linux /dev/sda1 /vmlinuz").unwrap();
        assert_eq!(kind, TargetKind::Linux);
        assert!(matches!(
            TargetKind::of_command("windows /dev/sda2"),
            Err(Error::UnsupportedTarget(word)) if word == "windows"
        ));
        assert!(matches!(TargetKind::of_command("   "), Err(Error::InvalidCommand(_))));
        // Prefixes do not select a kind.
        assert_eq!(TargetKind::from_word("lin"), None);
    }

    #[test]
    fn test_load_rejects_unknown_kind() {
        let err =
            load("chain /dev/sda1", &BootConfig::default(), &HostPaths::default()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedTarget(_)));
    }

    #[test]
    fn test_display_name_dispatch() {
        let mounts = HostPaths::new("/nonexistent");
        let name = display_name("linux /dev/sda9 /vmlinuz quiet", &mounts).unwrap();
        assert_eq!(name, "Linux (/dev/sda9 /vmlinuz quiet)");
        assert!(display_name("hurd /dev/sda1", &HostPaths::default()).is_err());
    }

    #[test]
    fn test_state_mismatch_error() {
        let err = TargetState::Ready.mismatch(TargetState::Loading);
        assert_eq!(
            err.to_string(),
            "target not in expected state: expected ready, got loading"
        );
    }
}
