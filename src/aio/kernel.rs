//! Linux native AIO completion source.
//!
//! Reads are submitted with `io_submit` and tagged with an eventfd, so the
//! eventfd counter equals the number of completions waiting in the context.

#![allow(non_camel_case_types)]

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use log::debug;

use super::{eventfd, eventfd_take, CompletionSource, Drained};

type aio_context_t = libc::c_ulong;

const IOCB_CMD_PREAD: u16 = 0;
const IOCB_FLAG_RESFD: u32 = 1 << 0;

/// `struct iocb` from `<linux/aio_abi.h>` (little-endian layout).
#[repr(C)]
#[derive(Debug, Default)]
struct iocb {
    aio_data: u64,
    aio_key: u32,
    aio_rw_flags: i32,
    aio_lio_opcode: u16,
    aio_reqprio: i16,
    aio_fildes: u32,
    aio_buf: u64,
    aio_nbytes: u64,
    aio_offset: i64,
    aio_reserved2: u64,
    aio_flags: u32,
    aio_resfd: u32,
}

/// `struct io_event` from `<linux/aio_abi.h>`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct io_event {
    data: u64,
    obj: u64,
    res: i64,
    res2: i64,
}

fn check(ret: libc::c_long) -> io::Result<libc::c_long> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Native AIO context with one request slot.
#[derive(Debug)]
pub struct KernelAio {
    ctx: aio_context_t,
    // Boxed so the kernel sees a stable address while the request is queued.
    command: Box<iocb>,
    pending: bool,
    eventfd: OwnedFd,
}

impl KernelAio {
    /// Set up an AIO context and its completion eventfd.
    pub fn new() -> io::Result<Self> {
        let eventfd = eventfd()?;
        let mut ctx: aio_context_t = 0;
        check(unsafe {
            libc::syscall(libc::SYS_io_setup, 1 as libc::c_long, &mut ctx as *mut aio_context_t)
        })?;
        Ok(Self {
            ctx,
            command: Box::default(),
            pending: false,
            eventfd,
        })
    }
}

impl CompletionSource for KernelAio {
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
        *self.command = iocb {
            aio_lio_opcode: IOCB_CMD_PREAD,
            aio_fildes: file.as_raw_fd() as u32,
            aio_buf: buf as u64,
            aio_nbytes: len as u64,
            aio_offset: offset as i64,
            aio_flags: IOCB_FLAG_RESFD,
            aio_resfd: self.eventfd.as_raw_fd() as u32,
            ..Default::default()
        };
        let mut commands = [&mut *self.command as *mut iocb];
        let submitted = check(libc::syscall(
            libc::SYS_io_submit,
            self.ctx,
            1 as libc::c_long,
            commands.as_mut_ptr(),
        ))?;
        if submitted != 1 {
            return Err(io::Error::new(io::ErrorKind::Other, "io_submit queued no request"));
        }
        self.pending = true;
        Ok(())
    }

    fn drain(&mut self) -> io::Result<Drained> {
        let count = eventfd_take(&self.eventfd)?;
        let mut drained = Drained::default();
        for _ in 0..count {
            let mut event = io_event::default();
            // The eventfd count says this completion is ready, so this does not wait.
            let got = check(unsafe {
                libc::syscall(
                    libc::SYS_io_getevents,
                    self.ctx,
                    1 as libc::c_long,
                    1 as libc::c_long,
                    &mut event as *mut io_event,
                    std::ptr::null_mut::<libc::timespec>(),
                )
            })?;
            if got == 0 {
                break;
            }
            self.pending = false;
            if event.res < 0 {
                return Err(io::Error::from_raw_os_error(-event.res as i32));
            }
            drained.completions += 1;
            drained.bytes += event.res as usize;
        }
        Ok(drained)
    }

    fn cancel(&mut self) {
        if !self.pending {
            return;
        }
        let mut result = io_event::default();
        let ret = unsafe {
            libc::syscall(
                libc::SYS_io_cancel,
                self.ctx,
                &mut *self.command as *mut iocb,
                &mut result as *mut io_event,
            )
        };
        if ret < 0 {
            // io_destroy still waits for the request before the buffer goes away.
            debug!("io_cancel: {}", io::Error::last_os_error());
        }
        self.pending = false;
    }
}

impl Drop for KernelAio {
    fn drop(&mut self) {
        // Blocks until any request still queued has finished.
        unsafe {
            libc::syscall(libc::SYS_io_destroy, self.ctx);
        }
    }
}
