//! kexboot CLI tool
//!
//! A command-line interface for booting other kernels through kexec.

use std::io::Write;
use std::process;

use kexboot::{BootTarget, Bootloader, DryRunController, Poller, SystemController};

fn main() {
    kexboot::debug::init();
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_usage(&args[0]);
        return Ok(());
    }

    match args[1].as_str() {
        "boot" => cmd_boot(&args[2..])?,
        "name" => cmd_name(&args[2..])?,
        "memmap" => cmd_memmap()?,
        "help" | "--help" | "-h" => print_usage(&args[0]),
        "version" | "--version" | "-V" => print_version(),
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            print_usage(&args[0]);
            process::exit(1);
        }
    }

    Ok(())
}

fn print_usage(program: &str) {
    println!(
        r#"kexboot - Boot another kernel without a firmware reboot

USAGE:
    {} <COMMAND> [OPTIONS]

COMMANDS:
    boot    Load a boot command's files and reboot into it
    name    Show the display name of a boot command
    memmap  Show the physical memory map
    help    Show this help message
    version Show version information

BOOT OPTIONS:
    --dry-run           Show the segments that would be staged, do not reboot

ENVIRONMENT:
    KEXBOOT_DEBUG       Debug output: 1, all, or a list of aio,kexec,boot,mount

EXAMPLES:
    {} boot linux /dev/sda1 /boot/vmlinuz root=/dev/sda1 ro initrd=/boot/initrd.img
    {} boot --dry-run linux /dev/sda1 /boot/vmlinuz root=/dev/sda1 ro
    {} name linux /dev/sda1 /boot/vmlinuz root=UUID=0a1b2c3d recovery
"#,
        program, program, program, program
    );
}

fn print_version() {
    println!("kexboot {}", env!("CARGO_PKG_VERSION"));
    let rust_version = option_env!("CARGO_PKG_RUST_VERSION")
        .filter(|v| !v.is_empty())
        .unwrap_or("unknown");
    println!("Built with Rust {}", rust_version);

    #[cfg(target_arch = "x86_64")]
    println!("Architecture: x86_64");
    #[cfg(not(target_arch = "x86_64"))]
    println!("Architecture: unsupported (x86_64 kernels only)");
}

fn cmd_memmap() -> Result<(), Box<dyn std::error::Error>> {
    let bootloader = Bootloader::builder().build()?;
    let map = bootloader.memory_map()?;

    println!("Physical Memory Map");
    println!("===================");
    for region in map.regions() {
        println!("{}", region);
    }
    let ram: u64 = map.ram().map(|r| r.length).sum();
    println!();
    println!("RAM: {} MB in {} regions", ram / (1024 * 1024), map.ram().count());
    Ok(())
}

fn cmd_name(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    if args.is_empty() {
        return Err("name requires a boot command".into());
    }
    let bootloader = Bootloader::builder().build()?;
    println!("{}", bootloader.display_name(&args.join(" "))?);
    Ok(())
}

fn cmd_boot(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let (dry_run, words) = match args.first().map(String::as_str) {
        Some("--dry-run") => (true, &args[1..]),
        _ => (false, args),
    };
    if words.is_empty() {
        return Err("boot requires a boot command".into());
    }
    let command = words.join(" ");

    let bootloader = Bootloader::builder().build()?;
    println!("Booting: {}", bootloader.display_name(&command)?);

    let mut target = bootloader.load(&command)?;
    let poller = Poller::new()?;
    poller.add(target.readiness_fd(), 0)?;

    let mut stdout = std::io::stdout();
    loop {
        let progress = target.progress()?;
        print!("\rLoading: {:>3}.{}%", progress / 10, progress % 10);
        stdout.flush()?;
        if progress == 1000 {
            break;
        }
        poller.wait(-1)?;
    }
    println!();

    if dry_run {
        let mut controller = DryRunController::default();
        target.boot(&mut controller)?;
        print_dry_run(&controller);
        return Ok(());
    }

    let mut controller = bootloader.controller();
    boot_with(target.as_mut(), &mut controller)
}

fn boot_with(
    target: &mut dyn BootTarget,
    controller: &mut dyn SystemController,
) -> Result<(), Box<dyn std::error::Error>> {
    match target.boot(controller) {
        Ok(()) => {
            println!("Rebooting...");
            Ok(())
        }
        Err(e) if e.image_staged() => {
            eprintln!("The new kernel is staged; reboot manually to start it.");
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

fn print_dry_run(controller: &DryRunController) {
    println!("Segments");
    println!("========");
    for segment in &controller.segments {
        println!(
            "{:#014x}-{:#014x}  {} bytes",
            segment.dest_addr,
            segment.dest_addr + segment.dest_len as u64,
            segment.source_len
        );
    }
    if let Some(entry) = controller.entry {
        println!("Entry: {:#x}", entry);
    }
}
