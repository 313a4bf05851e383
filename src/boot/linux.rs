//! Booting a Linux bzImage.
//!
//! A command such as
//! `linux /dev/sda1 /boot/vmlinuz root=/dev/sda1 ro initrd=/boot/initrd.img`
//! is parsed into a [`LinuxCommand`]. [`LinuxTarget::load`] mounts the device
//! and starts reading the kernel (and initrd); once both are in memory,
//! [`LinuxTarget::boot`] assembles the zero page, places every segment and
//! hands off to the new kernel.
//!
//! Physical layout of a staged boot:
//!
//! ```text
//! 0x100000          kernel payload, reserving init_size bytes
//! first free hole   zero page | trampoline | command line
//! below RAM top     initrd, page aligned, under the kernel's initrd ceiling
//! ```

use std::fs::File;
use std::io::Read;
use std::ops::ControlFlow;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use super::arena::Arena;
use super::command::{arg_value, has_arg, split_word};
use super::screen::ScreenInfo;
use super::x86_64::{
    boot_params, loadflags, screen_info, trampoline, E820Entry, SetupHeader, ZeroPage,
    LOADER_TYPE_UNDEFINED, ZERO_PAGE_SIZE,
};
use super::{BootTarget, TargetKind, TargetState, PROGRESS_SCALE};
use crate::aio::{progress_fraction, AsyncFileLoader, Poller};
use crate::config::BootConfig;
use crate::error::{Error, Result};
use crate::kexec::{SegmentAllocator, SystemController};
use crate::memory::{layout, MemoryMap};
use crate::mount::{MountProvider, Mounted};

const KERNEL_TOKEN: u64 = 1;
const INITRD_TOKEN: u64 = 2;

/// Enough of a bzImage to reach any kernel version string.
const VERSION_PROBE_LEN: u64 = 0x200 + 0x1_0000 + 256;

/// A parsed `linux` boot command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinuxCommand {
    /// Device holding the kernel
    pub device: String,
    /// Kernel path relative to the device's filesystem
    pub kernel: String,
    /// Command line passed verbatim to the new kernel
    pub cmdline: String,
    /// Initrd path relative to the device's filesystem
    pub initrd: Option<String>,
}

impl LinuxCommand {
    /// Parse `linux <device> <kernel> [<cmdline>...]`.
    pub fn parse(command: &str) -> Result<Self> {
        let missing = |what: &str| Error::InvalidCommand(format!("{:?} has no {}", command, what));

        let (kind, rest) = split_word(command).ok_or_else(|| missing("target type"))?;
        if kind != TargetKind::Linux.name() {
            return Err(Error::InvalidCommand(format!("{:?} is not a linux command", command)));
        }
        let (device, rest) = split_word(rest).ok_or_else(|| missing("device"))?;
        let (kernel, cmdline) = split_word(rest).ok_or_else(|| missing("kernel path"))?;
        let cmdline = cmdline.trim_end();

        Ok(Self {
            device: device.to_owned(),
            kernel: kernel.to_owned(),
            cmdline: cmdline.to_owned(),
            initrd: arg_value(cmdline, "initrd")
                .filter(|path| !path.is_empty())
                .map(str::to_owned),
        })
    }

    /// Human-readable name for a boot menu.
    ///
    /// Uses the distribution description of the `root=` filesystem and the
    /// kernel's version string when they can be found, e.g.
    /// `"Ubuntu 11.10 (Linux 3.0.0-12-generic, Recovery Mode)"`.
    pub fn display_name(&self, mounts: &dyn MountProvider) -> String {
        let distro = arg_value(&self.cmdline, "root").and_then(|root| read_distro(root, mounts));
        let Some(distro) = distro else {
            return format!("Linux ({})", self.words());
        };

        let version = self.read_kernel_version(mounts);
        let recovery = has_arg(&self.cmdline, "recovery");
        let details: Vec<String> = version
            .map(|v| format!("Linux {}", v))
            .into_iter()
            .chain(recovery.then(|| "Recovery Mode".to_owned()))
            .collect();
        if details.is_empty() {
            distro
        } else {
            format!("{} ({})", distro, details.join(", "))
        }
    }

    fn words(&self) -> String {
        let mut words = format!("{} {}", self.device, self.kernel);
        if !self.cmdline.is_empty() {
            words.push(' ');
            words.push_str(&self.cmdline);
        }
        words
    }

    fn read_kernel_version(&self, mounts: &dyn MountProvider) -> Option<String> {
        let mount = mounts.mount(&self.device).ok()?;
        let mut head = Vec::new();
        File::open(mount.resolve(&self.kernel))
            .ok()?
            .take(VERSION_PROBE_LEN)
            .read_to_end(&mut head)
            .ok()?;
        super::x86_64::kernel_version(&head)
    }
}

/// Device named by a `root=` value.
fn root_device(root: &str) -> PathBuf {
    match root.strip_prefix("UUID=") {
        Some(uuid) => {
            let link = Path::new("/dev/disk/by-uuid").join(uuid);
            std::fs::canonicalize(&link).unwrap_or(link)
        }
        None => PathBuf::from(root),
    }
}

fn read_distro(root: &str, mounts: &dyn MountProvider) -> Option<String> {
    let device = root_device(root);
    let mount = mounts.mount(&device.to_string_lossy()).ok()?;
    let text = std::fs::read_to_string(mount.resolve("/etc/lsb-release")).ok()?;
    distrib_description(&text)
}

/// `DISTRIB_DESCRIPTION` from `lsb-release` contents.
fn distrib_description(text: &str) -> Option<String> {
    text.lines().find_map(|line| {
        let (key, value) = line.split_once('=')?;
        if key.trim() != "DISTRIB_DESCRIPTION" {
            return None;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        (!value.is_empty()).then(|| value.to_owned())
    })
}

/// Highest page-aligned initrd address below both `ram_top` and `ceiling`.
fn initrd_address(ram_top: u64, size: u64, ceiling: u64, page_size: u64) -> Result<u64> {
    let too_big = || Error::ResourceExhausted(format!("no room for a {:#x}-byte initrd", size));
    let mut start = ram_top.checked_sub(size).ok_or_else(too_big)?;
    if start + size >= ceiling {
        start = ceiling.checked_sub(size).ok_or_else(too_big)?;
    }
    Ok(start & !(page_size - 1))
}

/// Append one E820 entry per region and derive the legacy memory sizes.
///
/// Returns the end of the RAM region holding the kernel load address.
fn write_memory_map(allocator: &SegmentAllocator<'_>, page: &mut ZeroPage<'_>) -> Result<u64> {
    let mut ram_top = None;
    let flow = allocator.enumerate_regions(|region| {
        if !page.push_e820(&E820Entry::from_region(region)) {
            return ControlFlow::Break(());
        }
        if region.is_ram() && region.contains(layout::KERNEL_START) {
            let mem_k = (region.end() - layout::KERNEL_START) / 1024;
            page.set_u16(screen_info::EXT_MEM_K, mem_k.min(0xfc00) as u16);
            page.set_u32(boot_params::ALT_MEM_K, mem_k.min(u32::MAX as u64) as u32);
            ram_top = Some(region.end());
        }
        ControlFlow::Continue(())
    });
    if flow.is_break() {
        warn!("E820 table is full, later memory regions are not reported");
    }
    ram_top.ok_or_else(|| {
        Error::MemoryMap(format!("no RAM region contains {:#x}", layout::KERNEL_START))
    })
}

/// A Linux kernel being loaded or booted.
pub struct LinuxTarget {
    command: LinuxCommand,
    state: TargetState,
    poller: Poller,
    kernel: AsyncFileLoader,
    initrd: Option<AsyncFileLoader>,
    memory_map: MemoryMap,
    page_size: usize,
    framebuffer: PathBuf,
    // Last, so reads are cancelled before the filesystem goes away.
    _mount: Box<dyn Mounted>,
}

impl std::fmt::Debug for LinuxTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinuxTarget")
            .field("command", &self.command)
            .field("state", &self.state)
            .field("kernel", &self.kernel)
            .field("initrd", &self.initrd)
            .finish()
    }
}

impl LinuxTarget {
    /// Mount the kernel's device and start reading the kernel and initrd.
    pub fn load(
        command: LinuxCommand,
        config: &BootConfig,
        mounts: &dyn MountProvider,
    ) -> Result<Self> {
        let memory_map = MemoryMap::from_file(&config.iomem_path)?;
        let mount = mounts.mount(&command.device)?;

        let begin_read = |path: &str| {
            AsyncFileLoader::begin_read_with(
                mount.resolve(path),
                config.read_backend,
                config.chunk_size,
            )
        };

        let kernel = begin_read(&command.kernel)?;
        if kernel.total() == 0 {
            return Err(Error::Protocol(format!("kernel {} is empty", kernel.path().display())));
        }
        let initrd = command.initrd.as_deref().map(begin_read).transpose()?;

        let poller = Poller::new()?;
        poller.add(kernel.readiness_fd(), KERNEL_TOKEN)?;
        if let Some(initrd) = &initrd {
            poller.add(initrd.readiness_fd(), INITRD_TOKEN)?;
        }

        info!(
            "loading {} ({} bytes){}",
            command.kernel,
            kernel.total(),
            initrd
                .as_ref()
                .map(|i| format!(" and {} ({} bytes)", i.path().display(), i.total()))
                .unwrap_or_default()
        );

        Ok(Self {
            command,
            state: TargetState::Loading,
            poller,
            kernel,
            initrd,
            memory_map,
            page_size: config.effective_page_size(),
            framebuffer: config.framebuffer_path.clone(),
            _mount: mount,
        })
    }

    pub fn command(&self) -> &LinuxCommand {
        &self.command
    }

    fn totals(&self) -> (usize, usize) {
        let (mut done, mut total) = (self.kernel.bytes_done(), self.kernel.total());
        if let Some(initrd) = &self.initrd {
            done += initrd.bytes_done();
            total += initrd.total();
        }
        (done, total)
    }

    fn poll_loaders(&mut self) -> Result<u32> {
        for token in self.poller.wait(0)? {
            match token {
                KERNEL_TOKEN => {
                    self.kernel.process()?;
                }
                INITRD_TOKEN => {
                    if let Some(initrd) = &mut self.initrd {
                        initrd.process()?;
                    }
                }
                _ => {}
            }
        }
        let (done, total) = self.totals();
        Ok(progress_fraction(done, total, PROGRESS_SCALE))
    }

    /// Build the boot image and hand off to it.
    fn commit(&self, controller: &mut dyn SystemController) -> Result<()> {
        let image = self.kernel.data();
        let header = SetupHeader::parse(image)?;
        header.check_64bit_entry()?;
        header.check_load_address(layout::KERNEL_START)?;
        debug!(
            "boot protocol {}.{:02}, {} setup sectors, init_size {:#x}",
            header.version >> 8,
            header.version & 0xff,
            header.setup_sects,
            header.init_size
        );

        let payload = image
            .get(header.payload_offset()..)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::Protocol("kernel image ends inside its setup code".into()))?;

        let cmdline = self.command.cmdline.as_bytes();
        if cmdline.len() > header.max_cmdline_len() {
            return Err(Error::Protocol(format!(
                "command line is {} bytes, the kernel accepts {}",
                cmdline.len(),
                header.max_cmdline_len()
            )));
        }

        let mut arena = Arena::new();
        let params = arena.append_zeroed(ZERO_PAGE_SIZE);
        let stub = arena.append(&trampoline::CODE);
        let cmdline_slot = arena.append(cmdline);
        arena.append(&[0]);

        let mut allocator = SegmentAllocator::new(self.memory_map.clone(), self.page_size);
        let ram_top = {
            let mut page = ZeroPage::new(arena.slice_mut(params, 0, ZERO_PAGE_SIZE)?)?;
            page.copy_setup_header(image, &header);
            page.set_u8(boot_params::SETUP_SECTS, header.setup_sects);
            page.set_u8(boot_params::TYPE_OF_LOADER, LOADER_TYPE_UNDEFINED);
            page.set_u8(boot_params::LOADFLAGS, loadflags::LOADED_HIGH);
            page.set_u32(boot_params::CODE32_START, layout::KERNEL_START as u32);
            ScreenInfo::detect(&self.framebuffer).write_to(&mut page);
            write_memory_map(&allocator, &mut page)?
        };

        allocator.add_segment_at_sized(payload, layout::KERNEL_START, header.init_size as usize)?;

        if let Some(initrd) = self.initrd.as_ref().filter(|i| i.total() > 0) {
            let data = initrd.data();
            let addr = initrd_address(
                ram_top,
                data.len() as u64,
                header.initrd_ceiling(),
                allocator.page_size(),
            )?;
            allocator.add_segment_at(data, addr)?;
            let mut page = ZeroPage::new(arena.slice_mut(params, 0, ZERO_PAGE_SIZE)?)?;
            page.set_u32(boot_params::RAMDISK_IMAGE, addr as u32);
            page.set_u32(boot_params::RAMDISK_SIZE, data.len() as u32);
        }

        let base = allocator.find_hole(arena.len())?;
        if base + arena.len() as u64 > layout::HIGH_MEMORY_START {
            return Err(Error::Protocol(format!(
                "boot parameters at {:#x} are not addressable by the 32-bit fields",
                base
            )));
        }
        arena.write_u32(stub, trampoline::PARAMS_OFFSET, params.address(base) as u32)?;
        arena.write_u32(stub, trampoline::KERNEL_OFFSET, layout::KERNEL_START as u32)?;
        arena.write_u32(params, boot_params::CMD_LINE_PTR, cmdline_slot.address(base) as u32)?;
        arena.write_u32(params, boot_params::CMDLINE_SIZE, cmdline.len() as u32)?;

        allocator.add_segment_at(arena.as_bytes(), base)?;
        info!("booting {} with {:?}", self.command.kernel, self.command.cmdline);
        allocator.execute(controller, stub.address(base))
    }
}

impl BootTarget for LinuxTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::Linux
    }

    fn state(&self) -> TargetState {
        self.state
    }

    fn readiness_fd(&self) -> RawFd {
        self.poller.as_raw_fd()
    }

    fn progress(&mut self) -> Result<u32> {
        match self.state {
            TargetState::Loading => {}
            TargetState::Ready => return Ok(PROGRESS_SCALE),
            other => return Err(TargetState::Loading.mismatch(other)),
        }
        match self.poll_loaders() {
            Ok(progress) => {
                if progress == PROGRESS_SCALE {
                    debug!("{} fully loaded", self.command.kernel);
                    self.state = TargetState::Ready;
                }
                Ok(progress)
            }
            Err(e) => {
                self.state = TargetState::Failed;
                Err(e)
            }
        }
    }

    fn boot(&mut self, controller: &mut dyn SystemController) -> Result<()> {
        if self.state != TargetState::Ready {
            return Err(TargetState::Ready.mismatch(self.state));
        }
        let result = self.commit(controller);
        self.state = match &result {
            Ok(()) => TargetState::Committed,
            Err(e) if e.image_staged() => TargetState::Committed,
            Err(_) => TargetState::Failed,
        };
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aio::ReadBackend;
    use crate::boot::x86_64::tests::fake_bzimage;
    use crate::kexec::controller::tests::RecordingController;
    use crate::mount::HostPaths;
    use crate::testutil::TempDir;

    const COMMAND: &str = "linux /dev/sda1 /boot/vmlinuz root=/dev/sda1 ro initrd=/boot/initrd.img";
    const IOMEM: &str = "\
00000000-0009fbff : System RAM
0009fc00-000fffff : reserved
00100000-07fdffff : System RAM
";
    const INITRD_LEN: usize = 10_000;

    struct Fixture {
        dir: TempDir,
        config: BootConfig,
        mounts: HostPaths,
    }

    impl Fixture {
        fn new(version: u16) -> Self {
            let dir = TempDir::new("linux");
            dir.write("boot/vmlinuz", &fake_bzimage(version, 8192));
            dir.write("boot/initrd.img", &vec![0x5a; INITRD_LEN]);
            let iomem = dir.write("iomem", IOMEM.as_bytes());
            let config = BootConfig {
                iomem_path: iomem,
                framebuffer_path: PathBuf::from("/nonexistent/fb0"),
                chunk_size: 4096,
                page_size: Some(4096),
                read_backend: ReadBackend::Pread,
                ..Default::default()
            };
            let mounts = HostPaths::new(dir.path());
            Self { dir, config, mounts }
        }

        fn load(&self, command: &str) -> Result<LinuxTarget> {
            LinuxTarget::load(LinuxCommand::parse(command)?, &self.config, &self.mounts)
        }
    }

    fn load_fully(target: &mut LinuxTarget) -> Vec<u32> {
        let mut seen = Vec::new();
        for _ in 0..10_000 {
            let progress = target.progress().unwrap();
            seen.push(progress);
            if progress == PROGRESS_SCALE {
                return seen;
            }
        }
        panic!("load did not finish: {:?}", seen.last());
    }

    fn u32_at(bytes: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
    }

    #[test]
    fn test_parse_command() {
        let command = LinuxCommand::parse(COMMAND).unwrap();
        assert_eq!(command.device, "/dev/sda1");
        assert_eq!(command.kernel, "/boot/vmlinuz");
        assert_eq!(command.cmdline, "root=/dev/sda1 ro initrd=/boot/initrd.img");
        assert_eq!(command.initrd.as_deref(), Some("/boot/initrd.img"));

        let command = LinuxCommand::parse("linux\t/dev/sdb2  /vmlinuz").unwrap();
        assert_eq!(command.cmdline, "");
        assert_eq!(command.initrd, None);
    }

    #[test]
    fn test_parse_rejects_incomplete_commands() {
        for command in ["", "linux", "linux /dev/sda1", "chain /dev/sda1 /boot/vmlinuz"] {
            assert!(
                matches!(LinuxCommand::parse(command), Err(Error::InvalidCommand(_))),
                "{:?}",
                command
            );
        }
    }

    #[test]
    fn test_load_and_boot() {
        let fixture = Fixture::new(0x020c);
        let mut target = fixture.load(COMMAND).unwrap();
        assert_eq!(target.state(), TargetState::Loading);

        let progress = load_fully(&mut target);
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(progress.iter().filter(|&&p| p == PROGRESS_SCALE).count(), 1);
        assert_eq!(target.state(), TargetState::Ready);
        assert_eq!(target.progress().unwrap(), PROGRESS_SCALE);

        let mut controller = RecordingController::default();
        target.boot(&mut controller).unwrap();
        assert_eq!(target.state(), TargetState::Committed);
        assert_eq!(controller.reboots, 1);

        let (entry, segments) = &controller.installed[0];
        let image = fake_bzimage(0x020c, 8192);
        let cmdline = "root=/dev/sda1 ro initrd=/boot/initrd.img";
        let arena_len = ZERO_PAGE_SIZE + trampoline::CODE.len() + cmdline.len() + 1;
        assert_eq!(
            segments,
            &vec![
                (0x100000, 8192, 0x300000),
                (0x7fdd000, INITRD_LEN, 0x3000),
                (0x400000, arena_len, 0x2000),
            ]
        );
        assert_eq!(*entry, 0x401000);

        assert_eq!(controller.payloads[0], &image[0xa00..]);
        let arena = &controller.payloads[2];
        assert_eq!(arena[boot_params::TYPE_OF_LOADER], 0xff);
        assert_eq!(arena[boot_params::SETUP_SECTS], 4);
        assert_eq!(&arena[boot_params::HEADER..boot_params::HEADER + 4], b"HdrS");
        assert_eq!(u32_at(arena, boot_params::CMD_LINE_PTR), 0x401019);
        assert_eq!(u32_at(arena, boot_params::CMDLINE_SIZE), cmdline.len() as u32);
        assert_eq!(u32_at(arena, boot_params::RAMDISK_IMAGE), 0x7fdd000);
        assert_eq!(u32_at(arena, boot_params::RAMDISK_SIZE), INITRD_LEN as u32);
        assert_eq!(u32_at(arena, boot_params::ALT_MEM_K), 129_920);
        assert_eq!(
            &arena[screen_info::EXT_MEM_K..screen_info::EXT_MEM_K + 2],
            &0xfc00u16.to_le_bytes()
        );
        assert_eq!(arena[screen_info::ORIG_VIDEO_IS_VGA], 1);
        assert_eq!(arena[boot_params::E820_ENTRIES], 3);
        assert_eq!(u32_at(arena, boot_params::E820_TABLE + 2 * E820Entry::SIZE + 16), 1);

        let stub = &arena[ZERO_PAGE_SIZE..ZERO_PAGE_SIZE + trampoline::CODE.len()];
        assert_eq!(u32_at(stub, trampoline::PARAMS_OFFSET), 0x400000);
        assert_eq!(u32_at(stub, trampoline::KERNEL_OFFSET), 0x100000);
        let tail = &arena[ZERO_PAGE_SIZE + trampoline::CODE.len()..];
        assert_eq!(tail, b"root=/dev/sda1 ro initrd=/boot/initrd.img\0");
    }

    #[test]
    fn test_old_protocol_places_nothing() {
        let fixture = Fixture::new(0x0106);
        let mut target = fixture.load(COMMAND).unwrap();
        load_fully(&mut target);

        let mut controller = RecordingController::default();
        let err = target.boot(&mut controller).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(controller.installed.is_empty());
        assert_eq!(target.state(), TargetState::Failed);
        assert!(matches!(target.boot(&mut controller), Err(Error::InvalidState { .. })));
    }

    #[test]
    fn test_boot_before_load_completes() {
        let fixture = Fixture::new(0x020c);
        let mut target = fixture.load(COMMAND).unwrap();
        let mut controller = RecordingController::default();
        assert!(matches!(
            target.boot(&mut controller),
            Err(Error::InvalidState { .. })
        ));
        assert!(controller.installed.is_empty());
    }

    #[test]
    fn test_boot_without_initrd() {
        let fixture = Fixture::new(0x020c);
        let mut target = fixture.load("linux /dev/sda1 /boot/vmlinuz quiet").unwrap();
        load_fully(&mut target);
        let mut controller = RecordingController::default();
        target.boot(&mut controller).unwrap();
        let segments = &controller.installed[0].1;
        assert_eq!(segments.len(), 2);
        assert_eq!(u32_at(&controller.payloads[1], boot_params::RAMDISK_IMAGE), 0);
    }

    #[test]
    fn test_load_failures() {
        let fixture = Fixture::new(0x020c);
        assert!(matches!(
            fixture.load("linux /dev/sda1 /boot/missing"),
            Err(Error::Open { .. })
        ));
        assert!(matches!(
            fixture.load("linux /dev/sda1 /boot/vmlinuz initrd=/boot/missing"),
            Err(Error::Open { .. })
        ));

        fixture.dir.write("boot/empty", &[]);
        assert!(matches!(
            fixture.load("linux /dev/sda1 /boot/empty"),
            Err(Error::Protocol(_))
        ));

        let mut fixture = Fixture::new(0x020c);
        fixture.config.iomem_path = PathBuf::from("/nonexistent/iomem");
        assert!(matches!(fixture.load(COMMAND), Err(Error::MemoryMap(_))));
    }

    #[test]
    fn test_kernel_without_64bit_entry_places_nothing() {
        // Protocol 2.01 predates the 64-bit entry point.
        let fixture = Fixture::new(0x0201);
        let mut target = fixture.load(COMMAND).unwrap();
        load_fully(&mut target);
        let mut controller = RecordingController::default();
        assert!(matches!(target.boot(&mut controller), Err(Error::Protocol(_))));
        assert!(controller.installed.is_empty());
        assert_eq!(target.state(), TargetState::Failed);

        // A 32-bit kernel speaking a recent protocol.
        let fixture = Fixture::new(0x020c);
        let mut image = fake_bzimage(0x020c, 8192);
        image[boot_params::XLOADFLAGS] = 0;
        fixture.dir.write("boot/vmlinuz", &image);
        let mut target = fixture.load(COMMAND).unwrap();
        load_fully(&mut target);
        assert!(matches!(target.boot(&mut controller), Err(Error::Protocol(_))));
        assert!(controller.installed.is_empty());
    }

    #[test]
    fn test_kernel_shrinking_while_loading() {
        let fixture = Fixture::new(0x020c);
        let mut target = fixture.load("linux /dev/sda1 /boot/vmlinuz quiet").unwrap();
        File::options()
            .write(true)
            .open(fixture.dir.path().join("boot/vmlinuz"))
            .unwrap()
            .set_len(4096)
            .unwrap();

        let mut result = Ok(0);
        for _ in 0..100 {
            result = target.progress();
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(Error::Io(_))), "{:?}", result);
        assert_eq!(target.state(), TargetState::Failed);
        assert!(matches!(target.progress(), Err(Error::InvalidState { .. })));

        let mut controller = RecordingController::default();
        assert!(matches!(
            target.boot(&mut controller),
            Err(Error::InvalidState { .. })
        ));
        assert!(controller.installed.is_empty());
    }

    #[test]
    fn test_empty_initrd_argument_is_ignored() {
        let command = LinuxCommand::parse("linux /dev/sda1 /boot/vmlinuz initrd= quiet").unwrap();
        assert_eq!(command.initrd, None);
        assert_eq!(command.cmdline, "initrd= quiet");
    }

    #[test]
    fn test_cmdline_longer_than_kernel_limit() {
        let fixture = Fixture::new(0x020c);
        let command = format!("linux /dev/sda1 /boot/vmlinuz {}", "x".repeat(2048));
        let mut target = fixture.load(&command).unwrap();
        load_fully(&mut target);
        let mut controller = RecordingController::default();
        assert!(matches!(target.boot(&mut controller), Err(Error::Protocol(_))));
        assert!(controller.installed.is_empty());
    }

    #[test]
    fn test_failures_at_hand_off() {
        let fixture = Fixture::new(0x020c);

        let mut target = fixture.load(COMMAND).unwrap();
        load_fully(&mut target);
        let mut controller = RecordingController {
            fail_install: true,
            ..Default::default()
        };
        assert!(matches!(target.boot(&mut controller), Err(Error::ImageSwitch(_))));
        assert_eq!(target.state(), TargetState::Failed);

        let mut target = fixture.load(COMMAND).unwrap();
        load_fully(&mut target);
        let mut controller = RecordingController {
            fail_reboot: true,
            ..Default::default()
        };
        assert!(target.boot(&mut controller).unwrap_err().image_staged());
        assert_eq!(target.state(), TargetState::Committed);
    }

    #[test]
    fn test_no_ram_at_load_address() {
        let fixture = Fixture::new(0x020c);
        let iomem = fixture.dir.write("iomem", b"00000000-0009fbff : System RAM\n");
        let config = BootConfig {
            iomem_path: iomem,
            ..fixture.config.clone()
        };
        let command = LinuxCommand::parse(COMMAND).unwrap();
        let mut target = LinuxTarget::load(command, &config, &fixture.mounts).unwrap();
        load_fully(&mut target);
        let mut controller = RecordingController::default();
        assert!(matches!(target.boot(&mut controller), Err(Error::MemoryMap(_))));
    }

    #[test]
    fn test_initrd_address() {
        // Highest page below the top of RAM.
        assert_eq!(initrd_address(0x8000_0000, 0x1800, 0x7fff_ffff, 4096).unwrap(), 0x7fff_e000);
        // Clamped below the ceiling.
        assert_eq!(initrd_address(0x1_0000_0000, 0x1000, 0x37ff_ffff, 4096).unwrap(), 0x37ff_e000);
        assert!(initrd_address(0x1000, 0x2000, 0x37ff_ffff, 4096).is_err());
    }

    #[test]
    fn test_display_name_with_distribution() {
        let fixture = Fixture::new(0x020c);
        fixture.dir.write(
            "etc/lsb-release",
            b"DISTRIB_ID=Ubuntu\nDISTRIB_RELEASE=11.10\nDISTRIB_DESCRIPTION=\"Ubuntu 11.10\"\n",
        );
        let command = "linux /dev/sda1 /boot/vmlinuz root=/dev/sda1 ro recovery";
        let command = LinuxCommand::parse(command).unwrap();
        assert_eq!(
            command.display_name(&fixture.mounts),
            "Ubuntu 11.10 (Linux 3.0.0-12-generic, Recovery Mode)"
        );

        let command = LinuxCommand::parse("linux /dev/sda1 /boot/missing root=/dev/sda1").unwrap();
        assert_eq!(command.display_name(&fixture.mounts), "Ubuntu 11.10");
    }

    #[test]
    fn test_display_name_fallback() {
        let fixture = Fixture::new(0x020c);
        let command = LinuxCommand::parse("linux  /dev/sda1 /boot/vmlinuz quiet").unwrap();
        assert_eq!(
            command.display_name(&fixture.mounts),
            "Linux (/dev/sda1 /boot/vmlinuz quiet)"
        );
    }

    #[test]
    fn test_distrib_description() {
        assert_eq!(
            distrib_description("DISTRIB_DESCRIPTION=\"Debian 12\"").as_deref(),
            Some("Debian 12")
        );
        assert_eq!(distrib_description("DISTRIB_DESCRIPTION=Arch").as_deref(), Some("Arch"));
        assert_eq!(distrib_description("DISTRIB_ID=Ubuntu"), None);
    }
}
