//! Physical memory region abstraction.

use std::fmt;

/// Kind of a physical memory region, as reported by the running kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    /// Usable system RAM
    Ram,
    /// Reserved by firmware or devices
    Reserved,
    /// ACPI tables (reclaimable after the OS has parsed them)
    AcpiTables,
    /// ACPI non-volatile storage
    AcpiNvs,
}

impl RegionKind {
    /// Map a `/proc/iomem` resource label to a region kind.
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "System RAM" => Some(RegionKind::Ram),
            "reserved" => Some(RegionKind::Reserved),
            "ACPI Tables" => Some(RegionKind::AcpiTables),
            "ACPI Non-volatile Storage" => Some(RegionKind::AcpiNvs),
            _ => None,
        }
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionKind::Ram => write!(f, "RAM"),
            RegionKind::Reserved => write!(f, "reserved"),
            RegionKind::AcpiTables => write!(f, "ACPI tables"),
            RegionKind::AcpiNvs => write!(f, "ACPI NVS"),
        }
    }
}

/// A contiguous range of physical memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Physical start address
    pub start: u64,
    /// Length in bytes
    pub length: u64,
    /// Region kind
    pub kind: RegionKind,
}

impl MemoryRegion {
    /// Create a new memory region.
    pub fn new(start: u64, length: u64, kind: RegionKind) -> Self {
        Self {
            start,
            length,
            kind,
        }
    }

    /// Create a RAM region.
    pub fn ram(start: u64, length: u64) -> Self {
        Self::new(start, length, RegionKind::Ram)
    }

    /// Exclusive end address, saturating at the top of the address space.
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.length)
    }

    pub fn is_ram(&self) -> bool {
        self.kind == RegionKind::Ram
    }

    /// Check if an address falls within this region.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end()
    }

    /// Check if `[addr, addr + len)` lies entirely within this region.
    pub fn contains_range(&self, addr: u64, len: u64) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= self.start && end <= self.end(),
            None => false,
        }
    }
}

impl fmt::Display for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#014x}-{:#014x} {}",
            self.start,
            self.end().saturating_sub(1),
            self.kind
        )
    }
}
