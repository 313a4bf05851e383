//! Bootloader builder.

use std::path::PathBuf;

use crate::aio::ReadBackend;
use crate::bootloader::Bootloader;
use crate::config::BootConfig;
use crate::error::Result;
use crate::mount::{MountProvider, SystemMounter};

/// Builder for creating a [`Bootloader`].
///
/// # Example
///
/// ```rust
/// use kexboot::{Bootloader, HostPaths};
///
/// let bootloader = Bootloader::builder()
///     .chunk_size(64 * 1024)
///     .page_size(4096)
///     .mounts(HostPaths::default())
///     .build()?;
/// assert_eq!(bootloader.config().chunk_size, 64 * 1024);
/// # Ok::<(), kexboot::Error>(())
/// ```
#[derive(Debug, Default)]
pub struct BootloaderBuilder {
    config: BootConfig,
    mounts: Option<Box<dyn MountProvider>>,
}

impl BootloaderBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration.
    pub fn config(mut self, config: BootConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the memory map source.
    ///
    /// Default: `/proc/iomem`
    pub fn iomem_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.iomem_path = path.into();
        self
    }

    /// Set the framebuffer device describing the display.
    ///
    /// Default: `/dev/fb0`
    pub fn framebuffer_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.framebuffer_path = path.into();
        self
    }

    /// Set the directory temporary mount points are created in.
    ///
    /// Default: `/var/cache/libbootloader`
    pub fn mount_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.mount_dir = path.into();
        self
    }

    /// Set the read granularity.
    ///
    /// Default: 128 KiB
    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.config.chunk_size = bytes;
        self
    }

    /// Set the page size used for segment placement.
    ///
    /// Default: the system page size
    pub fn page_size(mut self, bytes: usize) -> Self {
        self.config.page_size = Some(bytes);
        self
    }

    /// Set how files are read.
    pub fn read_backend(mut self, backend: ReadBackend) -> Self {
        self.config.read_backend = backend;
        self
    }

    /// Set the reboot front-ends, tried in order.
    pub fn reboot_commands(
        mut self,
        commands: impl IntoIterator<Item = impl Into<PathBuf>>,
    ) -> Self {
        self.config.reboot_commands = commands.into_iter().map(Into::into).collect();
        self
    }

    /// Set how devices are made reachable.
    ///
    /// Default: [`SystemMounter`] under the mount directory
    pub fn mounts(mut self, mounts: impl MountProvider + 'static) -> Self {
        self.mounts = Some(Box::new(mounts));
        self
    }

    /// Build the bootloader, validating the configuration.
    pub fn build(self) -> Result<Bootloader> {
        self.config.validate()?;
        let mounts = self
            .mounts
            .unwrap_or_else(|| Box::new(SystemMounter::new(self.config.mount_dir.clone())));
        Ok(Bootloader::new(self.config, mounts))
    }
}
