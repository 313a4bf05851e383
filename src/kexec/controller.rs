//! The irreversible hand-off: staging a kernel image and rebooting into it.
//!
//! [`SystemController`] is the seam between segment placement and the
//! machine. [`LinuxController`] issues the real `kexec_load` request and runs
//! the system's reboot front-end; [`DryRunController`] only records what
//! would have happened.

use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use log::{debug, info, warn};

use super::PlacedSegment;
use crate::error::{Error, Result};

/// Capability to stage a new kernel image and reboot the machine.
pub trait SystemController {
    /// Stage all segments with a single image-switch request.
    ///
    /// Either every segment is staged or none is.
    fn install_image(&mut self, segments: &[PlacedSegment<'_>], entry: u64) -> io::Result<()>;

    /// Ask the running system to reboot gracefully.
    ///
    /// Failures must be reported as [`Error::ExternalProcess`], since the
    /// image has already been staged when this is called.
    fn request_reboot(&mut self) -> Result<()>;
}

/// Raw `struct kexec_segment` from `<linux/kexec.h>`.
#[repr(C)]
#[derive(Debug)]
struct KexecSegment {
    buf: *const libc::c_void,
    bufsz: libc::size_t,
    mem: libc::uintptr_t,
    memsz: libc::size_t,
}

const KEXEC_ARCH_DEFAULT: libc::c_ulong = 0;

/// Default reboot front-ends, tried in order.
pub const DEFAULT_REBOOT_COMMANDS: [&str; 3] = ["/usr/bin/reboot", "/sbin/reboot", "/bin/reboot"];

/// Controller acting on the running Linux system.
#[derive(Debug, Clone)]
pub struct LinuxController {
    reboot_commands: Vec<PathBuf>,
}

impl Default for LinuxController {
    fn default() -> Self {
        Self::new(DEFAULT_REBOOT_COMMANDS.iter().map(PathBuf::from).collect())
    }
}

impl LinuxController {
    /// Create a controller trying the given reboot front-ends in order.
    pub fn new(reboot_commands: Vec<PathBuf>) -> Self {
        Self { reboot_commands }
    }
}

impl SystemController for LinuxController {
    fn install_image(&mut self, segments: &[PlacedSegment<'_>], entry: u64) -> io::Result<()> {
        let to_word = |v: u64| -> io::Result<usize> {
            usize::try_from(v).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
        };

        let raw = segments
            .iter()
            .map(|s| -> io::Result<KexecSegment> {
                Ok(KexecSegment {
                    buf: s.source.as_ptr() as *const libc::c_void,
                    bufsz: s.source.len(),
                    mem: to_word(s.dest_addr)?,
                    memsz: s.dest_len,
                })
            })
            .collect::<io::Result<Vec<_>>>()?;
        let entry = to_word(entry)?;

        info!("loading {} segments, entry point {:#x}", raw.len(), entry);

        // Safety: every segment points into a live borrowed buffer of
        // `bufsz` bytes for the duration of the call, and `raw` outlives it.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_kexec_load,
                entry as libc::c_ulong,
                raw.len() as libc::c_ulong,
                raw.as_ptr(),
                KEXEC_ARCH_DEFAULT,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn request_reboot(&mut self) -> Result<()> {
        for path in &self.reboot_commands {
            // Output is discarded so the user is not shown shutdown chatter.
            let status = Command::new(path)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            match status {
                Ok(status) if status.success() => {
                    info!("{} accepted the reboot request", path.display());
                    return Ok(());
                }
                Ok(status) => {
                    return Err(Error::ExternalProcess(format!(
                        "{} exited with {}",
                        path.display(),
                        status
                    )));
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("{} not found", path.display());
                }
                Err(e) => {
                    return Err(Error::ExternalProcess(format!(
                        "failed to run {}: {}",
                        path.display(),
                        e
                    )));
                }
            }
        }
        warn!("none of {} reboot front-ends exist", self.reboot_commands.len());
        Err(Error::ExternalProcess("no reboot front-end found".into()))
    }
}

/// A segment as seen by [`DryRunController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSummary {
    pub dest_addr: u64,
    pub source_len: usize,
    pub dest_len: usize,
}

/// Controller that logs the hand-off instead of performing it.
#[derive(Debug, Default, Clone)]
pub struct DryRunController {
    /// Entry point of the last staged image
    pub entry: Option<u64>,
    /// Segments of the last staged image
    pub segments: Vec<SegmentSummary>,
}

impl SystemController for DryRunController {
    fn install_image(&mut self, segments: &[PlacedSegment<'_>], entry: u64) -> io::Result<()> {
        self.entry = Some(entry);
        self.segments = segments
            .iter()
            .map(|s| SegmentSummary {
                dest_addr: s.dest_addr,
                source_len: s.source_len(),
                dest_len: s.dest_len,
            })
            .collect();
        for s in &self.segments {
            info!(
                "dry run: {:#x} bytes -> {:#x}..{:#x}",
                s.source_len,
                s.dest_addr,
                s.dest_addr + s.dest_len as u64
            );
        }
        info!("dry run: entry point {:#x}", entry);
        Ok(())
    }

    fn request_reboot(&mut self) -> Result<()> {
        info!("dry run: skipping reboot");
        Ok(())
    }
}
