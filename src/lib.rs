//! # kexboot
//!
//! Boot another Linux kernel from a running Linux system without going
//! through firmware: load the kernel and initrd, build the x86 boot
//! protocol structures, stage everything with `kexec_load` and reboot.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use kexboot::{Bootloader, BootTarget, Poller, Result};
//!
//! fn main() -> Result<()> {
//!     let bootloader = Bootloader::builder().build()?;
//!     let mut target = bootloader.load(
//!         "linux /dev/sda1 /boot/vmlinuz root=/dev/sda1 ro initrd=/boot/initrd.img",
//!     )?;
//!
//!     let poller = Poller::new()?;
//!     poller.add(target.readiness_fd(), 0)?;
//!     while target.progress()? < 1000 {
//!         poller.wait(-1)?;
//!     }
//!
//!     // Point of no return.
//!     target.boot(&mut bootloader.controller())
//! }
//! ```
//!
//! ## Platform Support
//!
//! - **Linux x86_64**: `kexec_load` with the 64-bit boot protocol

pub mod aio;
pub mod boot;
mod bootloader;
mod builder;
pub mod config;
pub mod debug;
mod error;
pub mod kexec;
pub mod memory;
pub mod mount;

#[cfg(test)]
mod testutil;

// Re-exports
pub use aio::{progress_fraction, AsyncFileLoader, Poller, ReadBackend};
pub use boot::{BootTarget, LinuxCommand, LinuxTarget, TargetKind, TargetState};
pub use bootloader::Bootloader;
pub use builder::BootloaderBuilder;
pub use config::BootConfig;
pub use error::{Error, Result};
pub use kexec::{DryRunController, LinuxController, SegmentAllocator, SystemController};
pub use memory::{MemoryMap, MemoryRegion, RegionKind};
pub use mount::{HostPaths, MountProvider, Mounted, SystemMounter};
