//! Incremental, non-blocking file loading.
//!
//! An [`AsyncFileLoader`] reads one file into a buffer of exactly the file's
//! size, one chunk at a time. Completed reads are signalled through a
//! readiness descriptor; the caller waits on it (directly or through a
//! [`Poller`]) and then calls [`AsyncFileLoader::process`], which never
//! blocks.
//!
//! The actual I/O is delegated to a [`CompletionSource`]. Two are provided:
//! Linux native AIO ([`KernelAio`]) and a positional-read fallback
//! ([`PreadSource`]) for hosts where native AIO is unavailable.

mod kernel;
mod poller;
mod pread;

use std::fs::File;
use std::io::{self, Seek, SeekFrom};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::{Error, Result};

pub use kernel::KernelAio;
pub use poller::Poller;
pub use pread::PreadSource;

/// Read granularity. Only affects how fine-grained progress is.
pub const DEFAULT_CHUNK_SIZE: usize = 128 * 1024;

/// Reads completed since the last drain.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Drained {
    /// Number of completed requests
    pub completions: u64,
    /// Bytes transferred by those requests
    pub bytes: usize,
}

/// A source of asynchronous read completions with a non-blocking drain.
pub trait CompletionSource {
    /// Descriptor that becomes readable when a submitted read has completed.
    fn readiness_fd(&self) -> RawFd;

    /// Submit a read of `len` bytes at `offset` of `file` into `buf`.
    ///
    /// # Safety
    ///
    /// `buf` must be valid for writes of `len` bytes, and neither `buf` nor
    /// `file` may be freed until the completion has been drained, the read
    /// cancelled, or the source dropped.
    unsafe fn submit_read(
        &mut self,
        file: &File,
        buf: *mut u8,
        len: usize,
        offset: u64,
    ) -> io::Result<()>;

    /// Collect completed reads without blocking. No completions is not an error.
    fn drain(&mut self) -> io::Result<Drained>;

    /// Best-effort cancellation of the outstanding read, if any.
    fn cancel(&mut self);
}

/// Which completion source a loader uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadBackend {
    /// Native AIO, falling back to positional reads if it is unavailable
    #[default]
    Auto,
    /// Native AIO only
    KernelAio,
    /// Positional reads completed at submission time
    Pread,
}

impl std::str::FromStr for ReadBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(ReadBackend::Auto),
            "aio" => Ok(ReadBackend::KernelAio),
            "pread" => Ok(ReadBackend::Pread),
            other => Err(Error::InvalidConfig(format!("unknown read backend {:?}", other))),
        }
    }
}

fn open_source(backend: ReadBackend) -> io::Result<Box<dyn CompletionSource>> {
    match backend {
        ReadBackend::KernelAio => Ok(Box::new(KernelAio::new()?)),
        ReadBackend::Pread => Ok(Box::new(PreadSource::new()?)),
        ReadBackend::Auto => match KernelAio::new() {
            Ok(source) => Ok(Box::new(source)),
            Err(e) => {
                warn!("native AIO unavailable ({}), using positional reads", e);
                Ok(Box::new(PreadSource::new()?))
            }
        },
    }
}

/// Reads a whole file into memory in chunks, without blocking the caller.
pub struct AsyncFileLoader {
    // Dropped first so no read can target `buffer` or `file` once they go.
    source: Box<dyn CompletionSource>,
    buffer: Vec<u8>,
    file: File,
    path: PathBuf,
    bytes_done: usize,
    in_flight: bool,
    chunk_size: usize,
}

impl std::fmt::Debug for AsyncFileLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncFileLoader")
            .field("path", &self.path)
            .field("bytes_done", &self.bytes_done)
            .field("total", &self.buffer.len())
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

impl AsyncFileLoader {
    /// Open `path` and submit the first read with default settings.
    pub fn begin_read(path: impl AsRef<Path>) -> Result<Self> {
        Self::begin_read_with(path, ReadBackend::Auto, DEFAULT_CHUNK_SIZE)
    }

    /// Open `path` and submit the first read using the given backend.
    pub fn begin_read_with(
        path: impl AsRef<Path>,
        backend: ReadBackend,
        chunk_size: usize,
    ) -> Result<Self> {
        let path = path.as_ref();
        let mut file = File::open(path).map_err(|e| Error::open(path, e))?;

        let size = file.seek(SeekFrom::End(0)).map_err(|e| Error::open(path, e))?;
        let size = usize::try_from(size).map_err(|_| {
            Error::open(
                path,
                io::Error::new(io::ErrorKind::InvalidData, "file is larger than the address space"),
            )
        })?;
        file.seek(SeekFrom::Start(0)).map_err(|e| Error::open(path, e))?;

        let mut buffer = Vec::new();
        buffer.try_reserve_exact(size).map_err(|e| {
            Error::Io(io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!("cannot allocate {} bytes for {}: {}", size, path.display(), e),
            ))
        })?;
        buffer.resize(size, 0);

        let source = open_source(backend)?;
        debug!("reading {} ({} bytes)", path.display(), size);

        let mut loader = Self {
            source,
            buffer,
            file,
            path: path.to_path_buf(),
            bytes_done: 0,
            in_flight: false,
            chunk_size: chunk_size.max(1),
        };
        loader.submit_next()?;
        Ok(loader)
    }

    fn submit_next(&mut self) -> Result<()> {
        if self.in_flight || self.bytes_done >= self.buffer.len() {
            return Ok(());
        }
        let len = (self.buffer.len() - self.bytes_done).min(self.chunk_size);
        // Safety: `buf` points into `self.buffer`, which is never resized and
        // is dropped only after `self.source` has been torn down.
        unsafe {
            let buf = self.buffer.as_mut_ptr().add(self.bytes_done);
            self.source
                .submit_read(&self.file, buf, len, self.bytes_done as u64)?;
        }
        self.in_flight = true;
        Ok(())
    }

    /// Descriptor that becomes readable when a read has completed.
    pub fn readiness_fd(&self) -> RawFd {
        self.source.readiness_fd()
    }

    /// Account for completed reads and submit the next chunk.
    ///
    /// Returns `(bytes_done, total)`. Safe to call when nothing completed.
    pub fn process(&mut self) -> Result<(usize, usize)> {
        let drained = self.source.drain()?;
        if drained.completions > 0 {
            self.in_flight = false;
            let total = self.buffer.len();
            if drained.bytes == 0 && self.bytes_done < total {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("{} shrank while being read", self.path.display()),
                )));
            }
            self.bytes_done = (self.bytes_done + drained.bytes).min(total);
        }
        self.submit_next()?;
        Ok((self.bytes_done, self.buffer.len()))
    }

    /// The backing buffer. Bytes past [`bytes_done`](Self::bytes_done) are not yet read.
    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    pub fn bytes_done(&self) -> usize {
        self.bytes_done
    }

    pub fn total(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_done == self.buffer.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for AsyncFileLoader {
    fn drop(&mut self) {
        if self.in_flight {
            debug!("cancelling outstanding read of {}", self.path.display());
            self.source.cancel();
        }
    }
}

/// Scale `done / total` to `[0, scale]`.
///
/// The result equals `scale` only when `done == total`, so a full bar always
/// means a finished load.
pub fn progress_fraction(done: usize, total: usize, scale: u32) -> u32 {
    if done >= total {
        return scale;
    }
    if scale == 0 {
        return 0;
    }
    let (done, total, wide_scale) = (done as u128, total as u128, scale as u128);
    let value = if wide_scale < total {
        done / (total / wide_scale)
    } else {
        wide_scale * done / total
    };
    value.min(wide_scale - 1) as u32
}

/// Create a non-blocking eventfd.
pub(crate) fn eventfd() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // Safety: `fd` was just created and is owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Read and reset an eventfd counter. An empty counter reads as zero.
pub(crate) fn eventfd_take(fd: &OwnedFd) -> io::Result<u64> {
    let mut count: u64 = 0;
    let ret = unsafe {
        libc::read(
            fd.as_raw_fd(),
            &mut count as *mut u64 as *mut libc::c_void,
            std::mem::size_of::<u64>(),
        )
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(0);
        }
        return Err(err);
    }
    Ok(count)
}

/// Add `count` to an eventfd counter.
pub(crate) fn eventfd_signal(fd: &OwnedFd, count: u64) -> io::Result<()> {
    let ret = unsafe {
        libc::write(
            fd.as_raw_fd(),
            &count as *const u64 as *const libc::c_void,
            std::mem::size_of::<u64>(),
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::testutil::TempDir;
    use proptest::prelude::*;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
    }

    fn load_fully(loader: &mut AsyncFileLoader) -> (usize, usize) {
        let poller = Poller::new().unwrap();
        poller.add(loader.readiness_fd(), 1).unwrap();
        loop {
            poller.wait(1000).unwrap();
            let (done, total) = loader.process().unwrap();
            if done == total {
                return (done, total);
            }
        }
    }

    #[test]
    fn test_progress_fraction_edges() {
        assert_eq!(progress_fraction(0, 0, 1000), 1000);
        assert_eq!(progress_fraction(10, 10, 1000), 1000);
        assert_eq!(progress_fraction(0, 10, 1000), 0);
        assert_eq!(progress_fraction(5, 10, 1000), 500);
        // Naive scaling would round up to the full scale.
        assert_eq!(progress_fraction(999_999, 1_000_000, 1000), 999);
        assert_eq!(progress_fraction(1499, 1500, 1000), 999);
        assert_eq!(progress_fraction(9, 10, 1), 0);
    }

    proptest! {
        #[test]
        fn prop_progress_full_only_when_done(
            total in 1usize..10_000_000,
            frac in 0.0f64..1.0,
            scale in 1u32..5000,
        ) {
            let done = ((total as f64) * frac) as usize;
            let value = progress_fraction(done, total, scale);
            if done == total {
                prop_assert_eq!(value, scale);
            } else {
                prop_assert!(value < scale);
            }
        }

        #[test]
        fn prop_progress_is_monotonic(
            total in 1usize..5_000_000,
            a in 0usize..5_000_000,
            b in 0usize..5_000_000,
        ) {
            let (lo, hi) = (a.min(b).min(total), a.max(b).min(total));
            prop_assert!(progress_fraction(lo, total, 1000) <= progress_fraction(hi, total, 1000));
        }
    }

    #[test]
    fn test_pread_round_trip() {
        let dir = TempDir::new("aio-pread");
        let contents = pattern(300_001);
        let path = dir.write("image", &contents);

        let mut loader = AsyncFileLoader::begin_read_with(&path, ReadBackend::Pread, 4096).unwrap();
        assert_eq!(loader.total(), contents.len());
        assert_eq!(load_fully(&mut loader), (contents.len(), contents.len()));
        assert_eq!(loader.data(), &contents[..]);
        assert!(loader.is_complete());
    }

    #[test]
    fn test_kernel_aio_round_trip() {
        let dir = TempDir::new("aio-native");
        let contents = pattern(DEFAULT_CHUNK_SIZE * 2 + 17);
        let path = dir.write("image", &contents);

        // Native AIO may be disabled on the host running the tests.
        let loader =
            AsyncFileLoader::begin_read_with(&path, ReadBackend::KernelAio, DEFAULT_CHUNK_SIZE);
        let Ok(mut loader) = loader else {
            return;
        };
        load_fully(&mut loader);
        assert_eq!(loader.data(), &contents[..]);
    }

    #[test]
    fn test_process_advances_per_completion() {
        let dir = TempDir::new("aio-steps");
        let contents = pattern(10_000);
        let path = dir.write("image", &contents);

        let mut loader = AsyncFileLoader::begin_read_with(&path, ReadBackend::Pread, 4096).unwrap();
        let (done, _) = loader.process().unwrap();
        assert_eq!(done, 4096);
        let (done, _) = loader.process().unwrap();
        assert_eq!(done, 8192);
        let (done, total) = loader.process().unwrap();
        assert_eq!((done, total), (10_000, 10_000));
        // Spurious calls on a finished loader change nothing.
        assert_eq!(loader.process().unwrap(), (10_000, 10_000));
        assert_eq!(loader.process().unwrap(), (10_000, 10_000));
    }

    #[test]
    fn test_file_shrinking_mid_load_is_fatal() {
        let dir = TempDir::new("aio-shrink");
        let path = dir.write("image", &pattern(10_000));

        let mut loader = AsyncFileLoader::begin_read_with(&path, ReadBackend::Pread, 4096).unwrap();
        File::options().write(true).open(&path).unwrap().set_len(4096).unwrap();

        assert_eq!(loader.process().unwrap(), (4096, 10_000));
        let err = loader.process().unwrap_err();
        assert!(
            matches!(&err, Error::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof),
            "{:?}",
            err
        );
    }

    #[test]
    fn test_empty_file_is_complete() {
        let dir = TempDir::new("aio-empty");
        let path = dir.write("empty", &[]);
        let mut loader = AsyncFileLoader::begin_read_with(&path, ReadBackend::Pread, 4096).unwrap();
        assert!(loader.is_complete());
        assert_eq!(loader.process().unwrap(), (0, 0));
    }

    #[test]
    fn test_missing_file() {
        let err = AsyncFileLoader::begin_read("/nonexistent/vmlinuz").unwrap_err();
        assert!(matches!(err, Error::Open { .. }));
    }

    #[test]
    fn test_drop_mid_load() {
        let dir = TempDir::new("aio-drop");
        let path = dir.write("image", &pattern(DEFAULT_CHUNK_SIZE * 4));
        let loader = AsyncFileLoader::begin_read(&path).unwrap();
        assert!(!loader.is_complete());
        drop(loader);
    }

    #[test]
    fn test_backend_names() {
        assert_eq!("aio".parse::<ReadBackend>().unwrap(), ReadBackend::KernelAio);
        assert_eq!("pread".parse::<ReadBackend>().unwrap(), ReadBackend::Pread);
        assert!("io_uring".parse::<ReadBackend>().is_err());
    }
}
