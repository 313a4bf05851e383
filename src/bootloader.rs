//! The bootloader entry point.

use crate::boot::{self, BootTarget};
use crate::config::BootConfig;
use crate::error::Result;
use crate::kexec::LinuxController;
use crate::memory::MemoryMap;
use crate::mount::MountProvider;

/// Loads and boots targets described by boot commands.
///
/// Use [`Bootloader::builder()`] to create one.
///
/// # Example
///
/// ```rust,no_run
/// use kexboot::{Bootloader, BootTarget};
///
/// let bootloader = Bootloader::builder().build()?;
/// let mut target = bootloader.load("linux /dev/sda1 /boot/vmlinuz root=/dev/sda1 ro")?;
/// while target.progress()? < 1000 {
///     // wait for target.readiness_fd() to become readable
/// }
/// target.boot(&mut bootloader.controller())?;
/// # Ok::<(), kexboot::Error>(())
/// ```
#[derive(Debug)]
pub struct Bootloader {
    config: BootConfig,
    mounts: Box<dyn MountProvider>,
}

impl Bootloader {
    /// Create a new bootloader builder.
    pub fn builder() -> crate::builder::BootloaderBuilder {
        crate::builder::BootloaderBuilder::new()
    }

    pub(crate) fn new(config: BootConfig, mounts: Box<dyn MountProvider>) -> Self {
        Self { config, mounts }
    }

    pub fn config(&self) -> &BootConfig {
        &self.config
    }

    /// Parse a boot command and start loading its files.
    pub fn load(&self, command: &str) -> Result<Box<dyn BootTarget>> {
        boot::load(command, &self.config, self.mounts.as_ref())
    }

    /// Human-readable name of the target a boot command describes.
    pub fn display_name(&self, command: &str) -> Result<String> {
        boot::display_name(command, self.mounts.as_ref())
    }

    /// Read the physical memory map.
    pub fn memory_map(&self) -> Result<MemoryMap> {
        MemoryMap::from_file(&self.config.iomem_path)
    }

    /// Controller that stages images on this machine with the configured
    /// reboot front-ends.
    pub fn controller(&self) -> LinuxController {
        LinuxController::new(self.config.reboot_commands.clone())
    }
}
