//! Boot configuration.

use std::path::PathBuf;

use crate::aio::{ReadBackend, DEFAULT_CHUNK_SIZE};
use crate::error::{Error, Result};
use crate::kexec::controller::DEFAULT_REBOOT_COMMANDS;

/// Default memory map source.
pub const DEFAULT_IOMEM_PATH: &str = "/proc/iomem";

/// Default framebuffer device queried for display information.
pub const DEFAULT_FRAMEBUFFER_PATH: &str = "/dev/fb0";

/// Default directory under which devices are mounted.
pub const DEFAULT_MOUNT_DIR: &str = "/var/cache/libbootloader";

/// Configuration shared by every boot target of a [`Bootloader`](crate::Bootloader).
///
/// # Example
///
/// ```rust
/// use kexboot::BootConfig;
///
/// let config = BootConfig {
///     chunk_size: 64 * 1024,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootConfig {
    /// Memory map source, in `/proc/iomem` format.
    pub iomem_path: PathBuf,
    /// Framebuffer device used to describe the display to the new kernel.
    pub framebuffer_path: PathBuf,
    /// Scratch directory for temporary mount points.
    pub mount_dir: PathBuf,
    /// Read granularity for file loading.
    pub chunk_size: usize,
    /// Physical page size (default: queried from the system).
    pub page_size: Option<usize>,
    /// Completion source used for file loading.
    pub read_backend: ReadBackend,
    /// Reboot front-ends, tried in order.
    pub reboot_commands: Vec<PathBuf>,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            iomem_path: PathBuf::from(DEFAULT_IOMEM_PATH),
            framebuffer_path: PathBuf::from(DEFAULT_FRAMEBUFFER_PATH),
            mount_dir: PathBuf::from(DEFAULT_MOUNT_DIR),
            chunk_size: DEFAULT_CHUNK_SIZE,
            page_size: None,
            read_backend: ReadBackend::Auto,
            reboot_commands: DEFAULT_REBOOT_COMMANDS.iter().map(PathBuf::from).collect(),
        }
    }
}

impl BootConfig {
    /// Check the configuration for values no boot could succeed with.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk size must be non-zero".into()));
        }
        if let Some(page_size) = self.page_size {
            if !page_size.is_power_of_two() {
                return Err(Error::InvalidConfig(format!(
                    "page size {} is not a non-zero power of two",
                    page_size
                )));
            }
        }
        Ok(())
    }

    /// The configured page size, or the system's when unset.
    pub fn effective_page_size(&self) -> usize {
        self.page_size.unwrap_or_else(system_page_size)
    }
}

fn system_page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    match usize::try_from(size) {
        Ok(size) if size.is_power_of_two() => size,
        _ => 4096,
    }
}
