//! Physical placement of kexec segments.
//!
//! A [`SegmentAllocator`] owns a snapshot of the memory map and a bounded
//! table of placed segments. Segments borrow their payload from the caller;
//! nothing is copied until the image switch in [`SegmentAllocator::execute`].
//!
//! Placed segments never overlap and every placement, once rounded up to the
//! page size, lies inside a single RAM region. Automatic placement never goes
//! below the hole floor (1MB by default) so legacy low memory stays untouched.

pub mod controller;

use std::ops::ControlFlow;

use log::debug;

use crate::error::{Error, Result};
use crate::memory::{layout, MemoryMap, MemoryRegion};

pub use controller::{DryRunController, LinuxController, SystemController};

/// Maximum number of segments accepted by a single image switch.
pub const MAX_SEGMENTS: usize = 16;

/// A payload and the physical range it will be copied to.
#[derive(Debug, Clone, Copy)]
pub struct PlacedSegment<'a> {
    /// Payload bytes, owned by the caller
    pub source: &'a [u8],
    /// Destination physical address
    pub dest_addr: u64,
    /// Destination length, page-aligned and never shorter than `source`
    pub dest_len: usize,
}

impl PlacedSegment<'_> {
    pub fn source_len(&self) -> usize {
        self.source.len()
    }

    /// Exclusive end of the destination range.
    pub fn dest_end(&self) -> u64 {
        self.dest_addr + self.dest_len as u64
    }

    fn overlaps(&self, start: u64, len: u64) -> bool {
        start < self.dest_end() && self.dest_addr < start + len
    }
}

/// Places segments into free RAM without collisions.
#[derive(Debug)]
pub struct SegmentAllocator<'a> {
    map: MemoryMap,
    segments: Vec<PlacedSegment<'a>>,
    page_size: u64,
    hole_floor: u64,
}

impl<'a> SegmentAllocator<'a> {
    /// Create an allocator over a memory map. `page_size` must be a power of two.
    pub fn new(map: MemoryMap, page_size: usize) -> Self {
        debug_assert!(page_size.is_power_of_two());
        Self {
            map,
            segments: Vec::with_capacity(MAX_SEGMENTS),
            page_size: page_size as u64,
            hole_floor: layout::KERNEL_START,
        }
    }

    /// Set the lowest address [`find_hole`](Self::find_hole) may return.
    pub fn with_hole_floor(mut self, floor: u64) -> Self {
        self.hole_floor = floor;
        self
    }

    pub fn memory_map(&self) -> &MemoryMap {
        &self.map
    }

    pub fn segments(&self) -> &[PlacedSegment<'a>] {
        &self.segments
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    fn round_up(&self, value: u64) -> Option<u64> {
        value
            .checked_add(self.page_size - 1)
            .map(|v| v & !(self.page_size - 1))
    }

    fn collision(&self, start: u64, len: u64) -> Option<&PlacedSegment<'a>> {
        self.segments.iter().find(|s| s.overlaps(start, len))
    }

    /// Find the first page-aligned address that can hold `size` bytes.
    ///
    /// RAM regions are scanned in map order. Within a region the candidate
    /// start slides past each colliding segment until it either fits or runs
    /// off the end of the region.
    pub fn find_hole(&self, size: usize) -> Result<u64> {
        let size = self.round_up(size as u64).ok_or_else(|| {
            Error::ResourceExhausted(format!("segment of {} bytes is too large", size))
        })?;

        for region in self.map.ram() {
            let Some(mut start) = self.round_up(region.start.max(self.hole_floor)) else {
                continue;
            };
            'slide: loop {
                match start.checked_add(size) {
                    Some(end) if end <= region.end() => {}
                    _ => break 'slide,
                }
                match self.collision(start, size) {
                    Some(segment) => match self.round_up(segment.dest_end()) {
                        Some(next) => start = next,
                        None => break 'slide,
                    },
                    None => return Ok(start),
                }
            }
        }

        Err(Error::ResourceExhausted(format!("no free RAM hole for {:#x} bytes", size)))
    }

    fn register(&mut self, source: &'a [u8], dest_addr: u64, dest_len: u64) -> Result<()> {
        if self.segments.len() == MAX_SEGMENTS {
            return Err(Error::ResourceExhausted(format!(
                "segment table is full ({} entries)",
                MAX_SEGMENTS
            )));
        }
        debug!(
            "segment {}: {:#x} bytes at {:#x}..{:#x}",
            self.segments.len(),
            source.len(),
            dest_addr,
            dest_addr + dest_len
        );
        self.segments.push(PlacedSegment {
            source,
            dest_addr,
            dest_len: dest_len as usize,
        });
        Ok(())
    }

    /// Place `source` at the first free hole and return its address.
    pub fn add_segment(&mut self, source: &'a [u8]) -> Result<u64> {
        if self.segments.len() == MAX_SEGMENTS {
            return Err(Error::ResourceExhausted(format!(
                "segment table is full ({} entries)",
                MAX_SEGMENTS
            )));
        }
        let addr = self.find_hole(source.len())?;
        let len = self.round_up(source.len() as u64).unwrap_or(u64::MAX);
        self.register(source, addr, len)?;
        Ok(addr)
    }

    /// Place `source` at a caller-chosen address.
    ///
    /// The rounded range must fit inside one RAM region and must not overlap
    /// any placed segment; otherwise nothing is changed.
    pub fn add_segment_at(&mut self, source: &'a [u8], addr: u64) -> Result<()> {
        self.add_segment_at_sized(source, addr, source.len())
    }

    /// Like [`add_segment_at`](Self::add_segment_at), but reserves at least
    /// `mem_len` bytes at the destination. The image switch zero-fills the
    /// part beyond the payload.
    pub fn add_segment_at_sized(
        &mut self,
        source: &'a [u8],
        addr: u64,
        mem_len: usize,
    ) -> Result<()> {
        let len = self
            .round_up(source.len().max(mem_len) as u64)
            .ok_or_else(|| Error::ResourceExhausted("segment is too large".into()))?;

        if !self.map.ram().any(|r| r.contains_range(addr, len)) {
            return Err(Error::ResourceExhausted(format!(
                "{:#x}..{:#x} is not inside a single RAM region",
                addr,
                addr.saturating_add(len)
            )));
        }
        if let Some(segment) = self.collision(addr, len) {
            return Err(Error::ResourceExhausted(format!(
                "{:#x}..{:#x} overlaps the segment at {:#x}",
                addr,
                addr + len,
                segment.dest_addr
            )));
        }
        self.register(source, addr, len)
    }

    /// Visit each memory region in map order, stopping when the visitor breaks.
    pub fn enumerate_regions<B>(
        &self,
        visitor: impl FnMut(&MemoryRegion) -> ControlFlow<B>,
    ) -> ControlFlow<B> {
        self.map.visit(visitor)
    }

    /// Stage all placed segments and reboot into them.
    ///
    /// This is the point of no return. A failure of the image switch leaves
    /// the machine untouched and is reported as [`Error::ImageSwitch`]; once
    /// it succeeds, a failed reboot is reported as [`Error::ExternalProcess`].
    pub fn execute(&self, controller: &mut dyn SystemController, entry: u64) -> Result<()> {
        debug!("executing {} segments with entry point {:#x}", self.segments.len(), entry);
        controller
            .install_image(&self.segments, entry)
            .map_err(Error::ImageSwitch)?;
        controller.request_reboot()
    }
}
