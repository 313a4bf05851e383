//! Access to the filesystems boot files live on.
//!
//! A boot command names a block device; a [`MountProvider`] turns it into a
//! directory the loader can read from. The returned [`Mounted`] guard keeps
//! the filesystem available until it is dropped.

use std::ffi::{CString, OsString};
use std::fmt;
use std::fs;
use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::{Error, Result};

const FILESYSTEMS_PATH: &str = "/proc/filesystems";
const MOUNTS_PATH: &str = "/proc/mounts";

/// A mounted filesystem. Unmounted (if needed) on drop.
pub trait Mounted: fmt::Debug {
    /// Directory the filesystem is reachable at.
    fn root(&self) -> &Path;

    /// Resolve a path relative to the filesystem root.
    fn resolve(&self, path: &str) -> PathBuf {
        self.root().join(path.trim_start_matches('/'))
    }
}

/// Makes block devices' filesystems reachable.
pub trait MountProvider: fmt::Debug {
    fn mount(&self, device: &str) -> Result<Box<dyn Mounted>>;
}

/// Mounts devices read-only under a scratch directory.
#[derive(Debug, Clone)]
pub struct SystemMounter {
    dir: PathBuf,
}

impl SystemMounter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn make_mount_point(&self) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let template = self.dir.join("XXXXXX");
        let mut template = CString::new(template.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?
            .into_bytes_with_nul();
        let ret = unsafe { libc::mkdtemp(template.as_mut_ptr() as *mut libc::c_char) };
        if ret.is_null() {
            return Err(io::Error::last_os_error());
        }
        template.pop();
        Ok(PathBuf::from(OsString::from_vec(template)))
    }
}

impl MountProvider for SystemMounter {
    fn mount(&self, device: &str) -> Result<Box<dyn Mounted>> {
        let filesystems = fs::read_to_string(FILESYSTEMS_PATH)
            .map_err(|e| Error::mount(device, format!("cannot read {}: {}", FILESYSTEMS_PATH, e)))?;
        let target = self
            .make_mount_point()
            .map_err(|e| Error::mount(device, format!("cannot create mount point: {}", e)))?;

        let c_device =
            CString::new(device).map_err(|_| Error::mount(device, "device name contains NUL"))?;
        let c_target = CString::new(target.as_os_str().as_bytes())
            .map_err(|_| Error::mount(device, "mount point contains NUL"))?;

        let mut last_error = io::Error::from_raw_os_error(libc::ENODEV);
        for fstype in block_filesystems(&filesystems) {
            let Ok(c_fstype) = CString::new(fstype) else {
                continue;
            };
            let ret = unsafe {
                libc::mount(
                    c_device.as_ptr(),
                    c_target.as_ptr(),
                    c_fstype.as_ptr(),
                    libc::MS_RDONLY,
                    std::ptr::null(),
                )
            };
            if ret == 0 {
                debug!("mounted {} ({}) at {}", device, fstype, target.display());
                return Ok(Box::new(SystemMount { root: target, owned: true }));
            }

            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EBUSY) {
                let _ = fs::remove_dir(&target);
                let mounts = fs::read_to_string(MOUNTS_PATH).map_err(|e| {
                    Error::mount(device, format!("cannot read {}: {}", MOUNTS_PATH, e))
                })?;
                return match find_mount_point(&mounts, device) {
                    Some(root) => {
                        debug!("{} is already mounted at {}", device, root.display());
                        Ok(Box::new(SystemMount { root, owned: false }))
                    }
                    None => Err(Error::mount(device, "device is busy but not mounted")),
                };
            }
            last_error = err;
        }

        let _ = fs::remove_dir(&target);
        Err(Error::mount(device, last_error.to_string()))
    }
}

#[derive(Debug)]
struct SystemMount {
    root: PathBuf,
    owned: bool,
}

impl Mounted for SystemMount {
    fn root(&self) -> &Path {
        &self.root
    }
}

impl Drop for SystemMount {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        let Ok(target) = CString::new(self.root.as_os_str().as_bytes()) else {
            return;
        };
        if unsafe { libc::umount2(target.as_ptr(), 0) } < 0 {
            warn!("failed to unmount {}: {}", self.root.display(), io::Error::last_os_error());
            return;
        }
        let _ = fs::remove_dir(&self.root);
    }
}

/// Resolves device paths against a fixed directory without mounting.
///
/// Useful when the boot files are on the running system's own root, and for
/// tests.
#[derive(Debug, Clone)]
pub struct HostPaths {
    root: PathBuf,
}

impl HostPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for HostPaths {
    fn default() -> Self {
        Self::new("/")
    }
}

#[derive(Debug)]
struct HostRoot(PathBuf);

impl Mounted for HostRoot {
    fn root(&self) -> &Path {
        &self.0
    }
}

impl MountProvider for HostPaths {
    fn mount(&self, device: &str) -> Result<Box<dyn Mounted>> {
        debug!("using {} for {}", self.root.display(), device);
        Ok(Box::new(HostRoot(self.root.clone())))
    }
}

/// Filesystem types from `/proc/filesystems` that need a block device.
fn block_filesystems(text: &str) -> impl Iterator<Item = &str> {
    text.lines()
        .filter(|line| !line.starts_with("nodev"))
        .map(str::trim)
        .filter(|name| !name.is_empty())
}

/// Mount point of `device` in `/proc/mounts` text.
fn find_mount_point(text: &str, device: &str) -> Option<PathBuf> {
    text.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let source = unescape_mount_field(fields.next()?);
        let dir = unescape_mount_field(fields.next()?);
        (source == device).then(|| PathBuf::from(dir))
    })
}

/// Undo the octal escaping (`\040` for space) used in `/proc/mounts`.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let octal = i + 4 <= bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b));
        if bytes[i] == b'\\' && octal {
            let value = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + (b - b'0') as u32);
            out.push(value as u8);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
