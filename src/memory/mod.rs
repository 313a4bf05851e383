//! Physical memory map of the running machine.
//!
//! The map is read once from the kernel's resource listing (`/proc/iomem`)
//! and stays read-only afterwards. Only top-level resources of the four
//! well-known kinds are kept; everything else is skipped.

mod region;

use std::fs;
use std::ops::ControlFlow;
use std::path::Path;

use log::{debug, warn};

use crate::error::{Error, Result};

pub use region::{MemoryRegion, RegionKind};

/// Standard physical layout constants for x86 boot.
pub mod layout {
    /// Kernel load address (1MB)
    pub const KERNEL_START: u64 = 0x100000;

    /// Legacy initrd ceiling for boot protocols older than 2.03
    pub const LEGACY_INITRD_ADDR_MAX: u64 = 0x37ff_ffff;

    /// High memory starts at 4GB
    pub const HIGH_MEMORY_START: u64 = 0x1_0000_0000;
}

/// Maximum number of regions, matching the zero page's E820 table.
pub const MAX_REGIONS: usize = 128;

/// Bounded snapshot of the physical memory map, in source order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryMap {
    regions: Vec<MemoryRegion>,
}

impl MemoryMap {
    /// Build a map from explicit regions.
    pub fn from_regions(regions: impl IntoIterator<Item = MemoryRegion>) -> Result<Self> {
        let mut map = Self::default();
        for region in regions {
            map.push(region)?;
        }
        Ok(map)
    }

    /// Read the map from a `/proc/iomem`-formatted file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| Error::MemoryMap(format!("cannot read {}: {}", path.display(), e)))?;
        let map = Self::parse(&text)?;
        debug!("read {} memory regions from {}", map.len(), path.display());
        Ok(map)
    }

    /// Parse `/proc/iomem` text. Malformed and unrecognized lines are skipped.
    pub fn parse(text: &str) -> Result<Self> {
        let mut map = Self::default();
        for line in text.lines() {
            // Nested resources are indented.
            if line.starts_with(' ') {
                continue;
            }
            match parse_line(line) {
                Some(region) => map.push(region)?,
                None => debug!("skipping memory map line {:?}", line),
            }
        }
        if !map.regions.iter().any(MemoryRegion::is_ram) {
            warn!("memory map contains no RAM regions");
        }
        Ok(map)
    }

    fn push(&mut self, region: MemoryRegion) -> Result<()> {
        if self.regions.len() == MAX_REGIONS {
            return Err(Error::ResourceExhausted(format!(
                "memory map holds at most {} regions",
                MAX_REGIONS
            )));
        }
        self.regions.push(region);
        Ok(())
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// RAM regions in source order.
    pub fn ram(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions.iter().filter(|r| r.is_ram())
    }

    /// Visit each region in source order until the visitor breaks.
    pub fn visit<B>(
        &self,
        mut visitor: impl FnMut(&MemoryRegion) -> ControlFlow<B>,
    ) -> ControlFlow<B> {
        for region in &self.regions {
            visitor(region)?;
        }
        ControlFlow::Continue(())
    }
}

/// Parse `<hex-start>-<hex-end> : <label>`. The end address is inclusive.
fn parse_line(line: &str) -> Option<MemoryRegion> {
    let (range, label) = line.split_once(" : ")?;
    let (start, end) = range.trim().split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;
    if start > end {
        return None;
    }
    let kind = RegionKind::from_label(label.trim())?;
    Some(MemoryRegion::new(start, end - start + 1, kind))
}
