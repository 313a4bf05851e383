//! Positional-read completion source.
//!
//! Each read is performed synchronously at submission and its result queued;
//! the eventfd is signalled so callers see the same readiness protocol as
//! with native AIO.

use std::collections::VecDeque;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::FileExt;

use super::{eventfd, eventfd_signal, eventfd_take, CompletionSource, Drained};

#[derive(Debug)]
pub struct PreadSource {
    eventfd: OwnedFd,
    completed: VecDeque<io::Result<usize>>,
}

impl PreadSource {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            eventfd: eventfd()?,
            completed: VecDeque::new(),
        })
    }
}

impl CompletionSource for PreadSource {
    fn readiness_fd(&self) -> RawFd {
        self.eventfd.as_raw_fd()
    }

    unsafe fn submit_read(
        &mut self,
        file: &File,
        buf: *mut u8,
        len: usize,
        offset: u64,
    ) -> io::Result<()> {
        // Safety: the caller guarantees `buf` is valid for `len` bytes.
        let dest = std::slice::from_raw_parts_mut(buf, len);
        let result = loop {
            match file.read_at(dest, offset) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };
        self.completed.push_back(result);
        eventfd_signal(&self.eventfd, 1)
    }

    fn drain(&mut self) -> io::Result<Drained> {
        eventfd_take(&self.eventfd)?;
        let mut drained = Drained::default();
        while let Some(result) = self.completed.pop_front() {
            drained.completions += 1;
            drained.bytes += result?;
        }
        Ok(drained)
    }

    fn cancel(&mut self) {
        self.completed.clear();
    }
}
