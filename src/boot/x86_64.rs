//! x86 Linux boot protocol structures.
//!
//! The new kernel is entered through its 64-bit entry point with `rsi`
//! pointing at the zero page (`struct boot_params`). Everything here is
//! written at explicit little-endian byte offsets.

use crate::error::{Error, Result};
use crate::memory::{layout, MemoryRegion, RegionKind};

/// Size of the zero page.
pub const ZERO_PAGE_SIZE: usize = 4096;

/// Minimum boot protocol version (2.00).
pub const MIN_PROTOCOL_VERSION: u16 = 0x0200;

/// First protocol version that declares a 64-bit entry point (2.12).
pub const ENTRY_64_PROTOCOL_VERSION: u16 = 0x020c;

/// Command line limit for protocols without `cmdline_size`.
pub const LEGACY_CMDLINE_MAX: usize = 255;

/// Capacity of the zero page's E820 table.
pub const E820_MAX_ENTRIES: usize = 128;

/// Boot params structure offsets (Linux boot protocol).
#[allow(dead_code)]
pub mod boot_params {
    pub const ALT_MEM_K: usize = 0x1e0;
    pub const E820_ENTRIES: usize = 0x1e8;
    pub const SETUP_SECTS: usize = 0x1f1;
    pub const JUMP: usize = 0x200;
    pub const HEADER: usize = 0x202;
    pub const VERSION: usize = 0x206;
    pub const KERNEL_VERSION: usize = 0x20e;
    pub const TYPE_OF_LOADER: usize = 0x210;
    pub const LOADFLAGS: usize = 0x211;
    pub const CODE32_START: usize = 0x214;
    pub const RAMDISK_IMAGE: usize = 0x218;
    pub const RAMDISK_SIZE: usize = 0x21c;
    pub const CMD_LINE_PTR: usize = 0x228;
    pub const INITRD_ADDR_MAX: usize = 0x22c;
    pub const KERNEL_ALIGNMENT: usize = 0x230;
    pub const RELOCATABLE_KERNEL: usize = 0x234;
    pub const XLOADFLAGS: usize = 0x236;
    pub const CMDLINE_SIZE: usize = 0x238;
    pub const INIT_SIZE: usize = 0x260;
    /// End of the setup header area in the zero page
    pub const SETUP_HEADER_END: usize = 0x290;
    pub const E820_TABLE: usize = 0x2d0;
}

/// `struct screen_info` offsets, at the start of the zero page.
#[allow(dead_code)]
pub mod screen_info {
    pub const ORIG_X: usize = 0x00;
    pub const ORIG_Y: usize = 0x01;
    pub const EXT_MEM_K: usize = 0x02;
    pub const ORIG_VIDEO_PAGE: usize = 0x04;
    pub const ORIG_VIDEO_MODE: usize = 0x06;
    pub const ORIG_VIDEO_COLS: usize = 0x07;
    pub const ORIG_VIDEO_EGA_BX: usize = 0x0a;
    pub const ORIG_VIDEO_LINES: usize = 0x0e;
    pub const ORIG_VIDEO_IS_VGA: usize = 0x0f;
    pub const ORIG_VIDEO_POINTS: usize = 0x10;
    pub const LFB_WIDTH: usize = 0x12;
    pub const LFB_HEIGHT: usize = 0x14;
    pub const LFB_DEPTH: usize = 0x16;
    pub const LFB_BASE: usize = 0x18;
    pub const LFB_SIZE: usize = 0x1c;
    pub const LFB_LINELENGTH: usize = 0x24;
    pub const RED_SIZE: usize = 0x26;
    pub const RED_POS: usize = 0x27;
    pub const GREEN_SIZE: usize = 0x28;
    pub const GREEN_POS: usize = 0x29;
    pub const BLUE_SIZE: usize = 0x2a;
    pub const BLUE_POS: usize = 0x2b;
    pub const RSVD_SIZE: usize = 0x2c;
    pub const RSVD_POS: usize = 0x2d;
    pub const VESAPM_SEG: usize = 0x2e;
    pub const PAGES: usize = 0x32;
    pub const CAPABILITIES: usize = 0x36;
    pub const EXT_LFB_BASE: usize = 0x3a;
}

/// Values for `orig_video_isVGA`.
pub mod video_type {
    pub const VGA_TEXT: u8 = 0x01;
    pub const VLFB: u8 = 0x23;
    pub const EFI: u8 = 0x70;
}

/// `screen_info.capabilities` bit: `ext_lfb_base` is valid.
pub const VIDEO_CAPABILITY_64BIT_BASE: u32 = 1 << 1;

/// Load flags in boot protocol.
#[allow(dead_code)]
pub mod loadflags {
    pub const LOADED_HIGH: u8 = 0x01;
    pub const CAN_USE_HEAP: u8 = 0x80;
}

/// Extended load flags (protocol 2.12+).
#[allow(dead_code)]
pub mod xloadflags {
    /// The kernel has the legacy 64-bit entry point at `code32_start + 0x200`.
    pub const KERNEL_64: u16 = 1 << 0;
    pub const CAN_BE_LOADED_ABOVE_4G: u16 = 1 << 1;
}

/// `type_of_loader` value for an unregistered boot loader.
pub const LOADER_TYPE_UNDEFINED: u8 = 0xff;

/// E820 memory map entry types.
pub mod e820_type {
    pub const RAM: u32 = 1;
    pub const RESERVED: u32 = 2;
    pub const ACPI: u32 = 3;
    pub const NVS: u32 = 4;
}

/// E820 memory map entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct E820Entry {
    pub addr: u64,
    pub size: u64,
    pub type_: u32,
}

impl E820Entry {
    pub const SIZE: usize = 20;

    pub fn from_region(region: &MemoryRegion) -> Self {
        let type_ = match region.kind {
            RegionKind::Ram => e820_type::RAM,
            RegionKind::Reserved => e820_type::RESERVED,
            RegionKind::AcpiTables => e820_type::ACPI,
            RegionKind::AcpiNvs => e820_type::NVS,
        };
        Self {
            addr: region.start,
            size: region.length,
            type_,
        }
    }

    pub fn to_bytes(&self) -> [u8; 20] {
        let mut bytes = [0u8; 20];
        bytes[0..8].copy_from_slice(&self.addr.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.size.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.type_.to_le_bytes());
        bytes
    }
}

/// 64-bit entry stub placed right after the zero page.
///
/// ```text
/// cli
/// mov esi, <zero page>
/// mov eax, <kernel load address>
/// add rax, 0x200          ; 64-bit entry point
/// xor ebp, ebp
/// xor edi, edi
/// xor ebx, ebx
/// jmp rax
/// ```
pub mod trampoline {
    pub const CODE: [u8; 25] = [
        0xfa, //
        0xbe, 0, 0, 0, 0, //
        0xb8, 0, 0, 0, 0, //
        0x48, 0x05, 0x00, 0x02, 0x00, 0x00, //
        0x31, 0xed, //
        0x31, 0xff, //
        0x31, 0xdb, //
        0xff, 0xe0,
    ];

    /// Offset of the zero page address immediate.
    pub const PARAMS_OFFSET: usize = 2;

    /// Offset of the kernel load address immediate.
    pub const KERNEL_OFFSET: usize = 7;
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
}

/// Fields of a bzImage setup header the loader acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupHeader {
    /// Setup sectors, with the legacy 0 already mapped to 4
    pub setup_sects: u8,
    pub version: u16,
    pub loadflags: u8,
    pub xloadflags: u16,
    pub code32_start: u32,
    pub initrd_addr_max: u32,
    pub kernel_alignment: u32,
    pub relocatable: bool,
    pub cmdline_size: u32,
    pub init_size: u32,
    /// End of the header as declared by the image, clamped to the zero page layout
    pub header_end: usize,
}

impl SetupHeader {
    /// Parse the setup header of a bzImage.
    ///
    /// Fails unless the image carries the `HdrS` magic and speaks protocol
    /// 2.00 or newer. Fields the image's protocol version predates read as 0.
    pub fn parse(image: &[u8]) -> Result<Self> {
        if image.len() < boot_params::SETUP_HEADER_END {
            return Err(Error::Protocol(format!("kernel image is only {} bytes", image.len())));
        }
        if &image[boot_params::HEADER..boot_params::HEADER + 4] != b"HdrS" {
            return Err(Error::Protocol("kernel image has no setup header".into()));
        }
        let version = read_u16(image, boot_params::VERSION);
        if version < MIN_PROTOCOL_VERSION {
            return Err(Error::Protocol(format!(
                "boot protocol {}.{:02} is older than 2.00",
                version >> 8,
                version & 0xff
            )));
        }

        let since = |min: u16, value: u32| if version >= min { value } else { 0 };
        let setup_sects = match image[boot_params::SETUP_SECTS] {
            0 => 4,
            n => n,
        };
        // The byte after the jump opcode counts from 0x202: it marks the end
        // of the header, not a length measured from 0x1f1.
        let header_end = (boot_params::HEADER + image[boot_params::JUMP + 1] as usize)
            .min(boot_params::SETUP_HEADER_END);
        let xloadflags = if version >= ENTRY_64_PROTOCOL_VERSION {
            read_u16(image, boot_params::XLOADFLAGS)
        } else {
            0
        };

        Ok(Self {
            setup_sects,
            version,
            loadflags: image[boot_params::LOADFLAGS],
            xloadflags,
            code32_start: read_u32(image, boot_params::CODE32_START),
            initrd_addr_max: since(0x0203, read_u32(image, boot_params::INITRD_ADDR_MAX)),
            kernel_alignment: since(0x0205, read_u32(image, boot_params::KERNEL_ALIGNMENT)),
            relocatable: since(0x0205, image[boot_params::RELOCATABLE_KERNEL] as u32) != 0,
            cmdline_size: since(0x0206, read_u32(image, boot_params::CMDLINE_SIZE)),
            init_size: since(0x020a, read_u32(image, boot_params::INIT_SIZE)),
            header_end,
        })
    }

    /// Check that the kernel can run from `addr`.
    pub fn check_load_address(&self, addr: u64) -> Result<()> {
        if self.code32_start as u64 == addr {
            return Ok(());
        }
        if !self.relocatable {
            return Err(Error::Protocol(format!(
                "kernel expects to run at {:#x} and is not relocatable",
                self.code32_start
            )));
        }
        if self.kernel_alignment == 0 || addr % self.kernel_alignment as u64 != 0 {
            return Err(Error::Protocol(format!(
                "load address {:#x} violates kernel alignment {:#x}",
                addr, self.kernel_alignment
            )));
        }
        Ok(())
    }

    /// Check that the kernel declares the 64-bit entry point the trampoline
    /// jumps to.
    pub fn check_64bit_entry(&self) -> Result<()> {
        if self.version < ENTRY_64_PROTOCOL_VERSION {
            return Err(Error::Protocol(format!(
                "boot protocol {}.{:02} has no 64-bit entry point",
                self.version >> 8,
                self.version & 0xff
            )));
        }
        if self.xloadflags & xloadflags::KERNEL_64 == 0 {
            return Err(Error::Protocol("kernel is not a 64-bit kernel".into()));
        }
        Ok(())
    }

    /// Offset of the protected-mode kernel inside the image.
    pub fn payload_offset(&self) -> usize {
        (self.setup_sects as usize + 1) * 512
    }

    /// Highest address the initrd may occupy.
    pub fn initrd_ceiling(&self) -> u64 {
        if self.version >= 0x0203 {
            self.initrd_addr_max as u64
        } else {
            layout::LEGACY_INITRD_ADDR_MAX
        }
    }

    /// Longest command line the kernel accepts, excluding the NUL.
    pub fn max_cmdline_len(&self) -> usize {
        if self.version >= 0x0206 {
            self.cmdline_size as usize
        } else {
            LEGACY_CMDLINE_MAX
        }
    }
}

/// Kernel version string referenced by the setup header, if any.
pub fn kernel_version(image: &[u8]) -> Option<String> {
    if image.len() < boot_params::KERNEL_VERSION + 2 {
        return None;
    }
    let offset = read_u16(image, boot_params::KERNEL_VERSION) as usize;
    if offset == 0 {
        return None;
    }
    let start = offset + 0x200;
    let text = image.get(start..)?;
    let end = text.iter().position(|&b| b == 0)?;
    let version = std::str::from_utf8(&text[..end]).ok()?;
    // Only the release, not the build information that follows it.
    version.split_whitespace().next().map(str::to_owned)
}

/// Mutable view of a zero page.
#[derive(Debug)]
pub struct ZeroPage<'a> {
    bytes: &'a mut [u8],
}

impl<'a> ZeroPage<'a> {
    pub fn new(bytes: &'a mut [u8]) -> Result<Self> {
        if bytes.len() != ZERO_PAGE_SIZE {
            return Err(Error::Protocol(format!(
                "zero page must be {} bytes, got {}",
                ZERO_PAGE_SIZE,
                bytes.len()
            )));
        }
        Ok(Self { bytes })
    }

    pub fn set_u8(&mut self, offset: usize, value: u8) {
        self.bytes[offset] = value;
    }

    pub fn set_u16(&mut self, offset: usize, value: u16) {
        self.bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    pub fn set_u32(&mut self, offset: usize, value: u32) {
        self.bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn u8_at(&self, offset: usize) -> u8 {
        self.bytes[offset]
    }

    pub fn u16_at(&self, offset: usize) -> u16 {
        read_u16(self.bytes, offset)
    }

    pub fn u32_at(&self, offset: usize) -> u32 {
        read_u32(self.bytes, offset)
    }

    /// Copy the image's setup header verbatim.
    ///
    /// The copy covers `0x1f1..header_end`, with `header_end` an absolute
    /// offset (`0x202 + image[0x201]`), not a length counted from 0x1f1.
    pub fn copy_setup_header(&mut self, image: &[u8], header: &SetupHeader) {
        let range = boot_params::SETUP_SECTS..header.header_end;
        self.bytes[range.clone()].copy_from_slice(&image[range]);
    }

    /// Append an E820 entry. Returns false once the table is full.
    pub fn push_e820(&mut self, entry: &E820Entry) -> bool {
        let count = self.bytes[boot_params::E820_ENTRIES] as usize;
        if count >= E820_MAX_ENTRIES {
            return false;
        }
        let offset = boot_params::E820_TABLE + count * E820Entry::SIZE;
        self.bytes[offset..offset + E820Entry::SIZE].copy_from_slice(&entry.to_bytes());
        self.bytes[boot_params::E820_ENTRIES] = (count + 1) as u8;
        true
    }

    pub fn e820_entries(&self) -> usize {
        self.bytes[boot_params::E820_ENTRIES] as usize
    }
}
