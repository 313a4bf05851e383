//! Display description for the new kernel.
//!
//! The active framebuffer is described if it is a plain linear one the new
//! kernel can keep drawing to; anything else falls back to 80x25 text mode.

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;

use log::debug;

use super::x86_64::{screen_info, video_type, ZeroPage, VIDEO_CAPABILITY_64BIT_BASE};
use crate::error::{Error, Result};

const FBIOGET_VSCREENINFO: libc::c_ulong = 0x4600;
const FBIOGET_FSCREENINFO: libc::c_ulong = 0x4602;

/// `struct fb_fix_screeninfo` from `<linux/fb.h>`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct FbFixScreeninfo {
    pub id: [u8; 16],
    pub smem_start: libc::c_ulong,
    pub smem_len: u32,
    pub type_: u32,
    pub type_aux: u32,
    pub visual: u32,
    pub xpanstep: u16,
    pub ypanstep: u16,
    pub ywrapstep: u16,
    pub line_length: u32,
    pub mmio_start: libc::c_ulong,
    pub mmio_len: u32,
    pub accel: u32,
    pub capabilities: u16,
    pub reserved: [u16; 2],
}

/// `struct fb_bitfield` from `<linux/fb.h>`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct FbBitfield {
    pub offset: u32,
    pub length: u32,
    pub msb_right: u32,
}

/// `struct fb_var_screeninfo` from `<linux/fb.h>`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct FbVarScreeninfo {
    pub xres: u32,
    pub yres: u32,
    pub xres_virtual: u32,
    pub yres_virtual: u32,
    pub xoffset: u32,
    pub yoffset: u32,
    pub bits_per_pixel: u32,
    pub grayscale: u32,
    pub red: FbBitfield,
    pub green: FbBitfield,
    pub blue: FbBitfield,
    pub transp: FbBitfield,
    pub nonstd: u32,
    pub activate: u32,
    pub height: u32,
    pub width: u32,
    pub accel_flags: u32,
    pub pixclock: u32,
    pub left_margin: u32,
    pub right_margin: u32,
    pub upper_margin: u32,
    pub lower_margin: u32,
    pub hsync_len: u32,
    pub vsync_len: u32,
    pub sync: u32,
    pub vmode: u32,
    pub rotate: u32,
    pub colorspace: u32,
    pub reserved: [u32; 4],
}

/// Colour channel as (size, position) in bits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Channel {
    pub size: u8,
    pub pos: u8,
}

impl From<FbBitfield> for Channel {
    fn from(field: FbBitfield) -> Self {
        Self {
            size: field.length as u8,
            pos: field.offset as u8,
        }
    }
}

/// A linear framebuffer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Framebuffer {
    pub video_type: u8,
    pub width: u16,
    pub height: u16,
    pub depth: u16,
    pub base: u64,
    pub line_length: u16,
    /// Size in 64 KiB units
    pub size_64k: u32,
    /// Size in 4 KiB pages
    pub pages: u16,
    /// Red, green, blue and reserved channels, only for depths above 8
    pub channels: Option<[Channel; 4]>,
}

/// What the new kernel is told about the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenInfo {
    /// 80x25 VGA text mode
    Text,
    Framebuffer(Framebuffer),
}

impl ScreenInfo {
    /// Describe the framebuffer device at `path`, if it is usable.
    pub fn query(path: &Path) -> Result<Self> {
        let unavailable = |what: &str, e: io::Error| {
            Error::HardwareInfoUnavailable(format!("{} {}: {}", what, path.display(), e))
        };
        let file = File::open(path).map_err(|e| unavailable("cannot open", e))?;

        let mut fix = FbFixScreeninfo::default();
        let mut var = FbVarScreeninfo::default();
        // Safety: both structs match the kernel's layouts for these ioctls.
        unsafe {
            let fix_ptr = &mut fix as *mut FbFixScreeninfo;
            if libc::ioctl(file.as_raw_fd(), FBIOGET_FSCREENINFO as _, fix_ptr) < 0 {
                return Err(unavailable("FBIOGET_FSCREENINFO on", io::Error::last_os_error()));
            }
            let var_ptr = &mut var as *mut FbVarScreeninfo;
            if libc::ioctl(file.as_raw_fd(), FBIOGET_VSCREENINFO as _, var_ptr) < 0 {
                return Err(unavailable("FBIOGET_VSCREENINFO on", io::Error::last_os_error()));
            }
        }
        Self::from_fb(&fix, &var)
    }

    /// Translate framebuffer driver information.
    pub fn from_fb(fix: &FbFixScreeninfo, var: &FbVarScreeninfo) -> Result<Self> {
        let id_len = fix.id.iter().position(|&b| b == 0).unwrap_or(fix.id.len());
        let video_type = match &fix.id[..id_len] {
            b"VESA VGA" => video_type::VLFB,
            b"EFI VGA" => video_type::EFI,
            other => {
                return Err(Error::HardwareInfoUnavailable(format!(
                    "unsupported framebuffer driver {:?}",
                    String::from_utf8_lossy(other)
                )))
            }
        };

        let depth = var.bits_per_pixel as u16;
        let channels = (depth > 8).then(|| {
            [
                Channel::from(var.red),
                Channel::from(var.green),
                Channel::from(var.blue),
                Channel::from(var.transp),
            ]
        });

        Ok(ScreenInfo::Framebuffer(Framebuffer {
            video_type,
            width: var.xres as u16,
            height: var.yres as u16,
            depth,
            base: fix.smem_start as u64,
            line_length: fix.line_length as u16,
            size_64k: fix.smem_len.div_ceil(65536),
            pages: fix.smem_len.div_ceil(4096) as u16,
            channels,
        }))
    }

    /// Query `path`, falling back to text mode on any failure.
    pub fn detect(path: &Path) -> Self {
        match Self::query(path) {
            Ok(info) => info,
            Err(e) => {
                debug!("{}, describing the display as text mode", e);
                ScreenInfo::Text
            }
        }
    }

    /// Fill in the zero page's `screen_info`.
    pub fn write_to(&self, page: &mut ZeroPage<'_>) {
        page.set_u8(screen_info::ORIG_X, 0);
        page.set_u8(screen_info::ORIG_Y, 0);
        page.set_u16(screen_info::ORIG_VIDEO_PAGE, 0);
        page.set_u8(screen_info::ORIG_VIDEO_MODE, 0);
        page.set_u8(screen_info::ORIG_VIDEO_COLS, 80);
        page.set_u8(screen_info::ORIG_VIDEO_LINES, 25);
        page.set_u16(screen_info::ORIG_VIDEO_EGA_BX, 0);
        page.set_u16(screen_info::ORIG_VIDEO_POINTS, 16);

        let fb = match self {
            ScreenInfo::Text => {
                page.set_u8(screen_info::ORIG_VIDEO_IS_VGA, video_type::VGA_TEXT);
                return;
            }
            ScreenInfo::Framebuffer(fb) => fb,
        };

        page.set_u8(screen_info::ORIG_VIDEO_IS_VGA, fb.video_type);
        page.set_u16(screen_info::LFB_WIDTH, fb.width);
        page.set_u16(screen_info::LFB_HEIGHT, fb.height);
        page.set_u16(screen_info::LFB_DEPTH, fb.depth);
        page.set_u32(screen_info::LFB_BASE, fb.base as u32);
        page.set_u32(screen_info::LFB_SIZE, fb.size_64k);
        page.set_u16(screen_info::LFB_LINELENGTH, fb.line_length);
        page.set_u16(screen_info::VESAPM_SEG, 0);
        page.set_u16(screen_info::PAGES, fb.pages);
        if fb.base > u32::MAX as u64 {
            page.set_u32(screen_info::EXT_LFB_BASE, (fb.base >> 32) as u32);
            page.set_u32(screen_info::CAPABILITIES, VIDEO_CAPABILITY_64BIT_BASE);
        }
        if let Some([red, green, blue, rsvd]) = fb.channels {
            for (channel, size, pos) in [
                (red, screen_info::RED_SIZE, screen_info::RED_POS),
                (green, screen_info::GREEN_SIZE, screen_info::GREEN_POS),
                (blue, screen_info::BLUE_SIZE, screen_info::BLUE_POS),
                (rsvd, screen_info::RSVD_SIZE, screen_info::RSVD_POS),
            ] {
                page.set_u8(size, channel.size);
                page.set_u8(pos, channel.pos);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::x86_64::ZERO_PAGE_SIZE;

    fn efi_fb(depth: u32, base: u64) -> (FbFixScreeninfo, FbVarScreeninfo) {
        let mut fix = FbFixScreeninfo::default();
        fix.id[..7].copy_from_slice(b"EFI VGA");
        fix.smem_start = base as libc::c_ulong;
        fix.smem_len = 1024 * 768 * 4 + 1;
        fix.line_length = 4096;
        let var = FbVarScreeninfo {
            xres: 1024,
            yres: 768,
            bits_per_pixel: depth,
            red: FbBitfield { offset: 16, length: 8, msb_right: 0 },
            green: FbBitfield { offset: 8, length: 8, msb_right: 0 },
            blue: FbBitfield { offset: 0, length: 8, msb_right: 0 },
            transp: FbBitfield { offset: 24, length: 8, msb_right: 0 },
            ..Default::default()
        };
        (fix, var)
    }

    #[test]
    fn test_ioctl_struct_sizes() {
        assert_eq!(std::mem::size_of::<FbVarScreeninfo>(), 160);
        #[cfg(target_pointer_width = "64")]
        assert_eq!(std::mem::size_of::<FbFixScreeninfo>(), 80);
    }

    #[test]
    fn test_text_mode_defaults() {
        let mut bytes = vec![0u8; ZERO_PAGE_SIZE];
        let mut page = ZeroPage::new(&mut bytes).unwrap();
        ScreenInfo::Text.write_to(&mut page);
        assert_eq!(page.u8_at(screen_info::ORIG_VIDEO_COLS), 80);
        assert_eq!(page.u8_at(screen_info::ORIG_VIDEO_LINES), 25);
        assert_eq!(page.u16_at(screen_info::ORIG_VIDEO_POINTS), 16);
        assert_eq!(page.u8_at(screen_info::ORIG_VIDEO_IS_VGA), 1);
        assert_eq!(page.u16_at(screen_info::LFB_WIDTH), 0);
    }

    #[test]
    fn test_efi_framebuffer() {
        let (fix, var) = efi_fb(32, 0x8000_0000);
        let info = ScreenInfo::from_fb(&fix, &var).unwrap();
        let mut bytes = vec![0u8; ZERO_PAGE_SIZE];
        let mut page = ZeroPage::new(&mut bytes).unwrap();
        info.write_to(&mut page);

        assert_eq!(page.u8_at(screen_info::ORIG_VIDEO_IS_VGA), video_type::EFI);
        assert_eq!(page.u16_at(screen_info::LFB_WIDTH), 1024);
        assert_eq!(page.u16_at(screen_info::LFB_HEIGHT), 768);
        assert_eq!(page.u16_at(screen_info::LFB_DEPTH), 32);
        assert_eq!(page.u32_at(screen_info::LFB_BASE), 0x8000_0000);
        // Sizes round up.
        assert_eq!(page.u32_at(screen_info::LFB_SIZE), 49);
        assert_eq!(page.u16_at(screen_info::PAGES), 769);
        assert_eq!(page.u8_at(screen_info::RED_POS), 16);
        assert_eq!(page.u8_at(screen_info::RSVD_SIZE), 8);
        assert_eq!(page.u32_at(screen_info::CAPABILITIES), 0);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_high_framebuffer_base() {
        let (fix, var) = efi_fb(32, 0x40_8000_0000);
        let info = ScreenInfo::from_fb(&fix, &var).unwrap();
        let mut bytes = vec![0u8; ZERO_PAGE_SIZE];
        let mut page = ZeroPage::new(&mut bytes).unwrap();
        info.write_to(&mut page);
        assert_eq!(page.u32_at(screen_info::LFB_BASE), 0x8000_0000);
        assert_eq!(page.u32_at(screen_info::EXT_LFB_BASE), 0x40);
        assert_eq!(page.u32_at(screen_info::CAPABILITIES), VIDEO_CAPABILITY_64BIT_BASE);
    }

    #[test]
    fn test_palette_depth_has_no_channels() {
        let (mut fix, var) = efi_fb(8, 0xa0000);
        fix.id = [0; 16];
        fix.id[..8].copy_from_slice(b"VESA VGA");
        match ScreenInfo::from_fb(&fix, &var).unwrap() {
            ScreenInfo::Framebuffer(fb) => {
                assert_eq!(fb.video_type, video_type::VLFB);
                assert_eq!(fb.channels, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_driver_and_missing_device_fall_back() {
        let (mut fix, var) = efi_fb(32, 0);
        fix.id = *b"inteldrmfb\0\0\0\0\0\0";
        assert!(matches!(
            ScreenInfo::from_fb(&fix, &var),
            Err(Error::HardwareInfoUnavailable(_))
        ));
        assert_eq!(ScreenInfo::detect(Path::new("/nonexistent/fb0")), ScreenInfo::Text);
    }
}
