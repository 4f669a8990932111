#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::num::ParseIntError;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context};
use indicatif::{ProgressBar, ProgressStyle};
use rand::Rng;

use picoboot3::linux::{Interface, LinuxTransport};
use picoboot3::{Control, LinkOptions, Options, Outcome, Programmer, SectorRange};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum InterfaceKind {
    Uart,
    I2c,
    Spi,
}

impl FromStr for InterfaceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uart" => Ok(InterfaceKind::Uart),
            "i2c" => Ok(InterfaceKind::I2c),
            "spi" => Ok(InterfaceKind::Spi),
            _ => Err(format!("unknown interface '{}', expected uart, i2c or spi", s)),
        }
    }
}

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Interface to reach the bootloader over (uart, i2c, spi)
    #[structopt(long, default_value = "uart")]
    interface: InterfaceKind,

    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: PathBuf,

    /// Serial port baud rate
    #[structopt(long, default_value = "115200")]
    baud: usize,

    /// I2C or SPI bus number
    #[structopt(long, default_value = "1")]
    bus: u8,

    /// I2C device address (default 0x5E) or SPI chip select (default 0)
    #[structopt(long, parse(try_from_str = parse_u8))]
    address: Option<u8>,

    /// SPI clock in Hz
    #[structopt(long, default_value = "10000000")]
    clock: u32,

    #[structopt(flatten)]
    options: Options,

    #[structopt(flatten)]
    link: LinkOptions,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,

    #[structopt(subcommand)]
    command: Operation,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Operation {
    /// Show bootloader version and flash layout
    Info,

    /// Erase application sectors
    Erase {
        /// First sector, defaults to the first application sector
        #[structopt(long)]
        first: Option<u32>,

        /// Number of sectors, defaults to the rest of the flash
        #[structopt(long)]
        count: Option<u32>,
    },

    /// Check a region reads as erased
    Blank {
        #[structopt(long, parse(try_from_str = parse_u32))]
        offset: Option<u32>,

        #[structopt(long, parse(try_from_str = parse_size))]
        length: Option<usize>,
    },

    /// Erase, program and verify a binary image
    Program {
        file: PathBuf,

        #[structopt(long, parse(try_from_str = parse_u32))]
        offset: Option<u32>,
    },

    /// Compare flash contents with a binary image
    Verify {
        file: PathBuf,

        #[structopt(long, parse(try_from_str = parse_u32))]
        offset: Option<u32>,
    },

    /// Read flash contents, to a file or as a hex dump
    Dump {
        #[structopt(long, parse(try_from_str = parse_u32))]
        offset: Option<u32>,

        #[structopt(long, parse(try_from_str = parse_size), default_value = "256")]
        length: usize,

        /// Write to a file instead of logging a hex dump
        #[structopt(long)]
        output: Option<PathBuf>,
    },

    /// Leave the bootloader and run the application
    Go,

    /// Erase, program and verify random data, then compare a dump
    Test {
        /// Number of sectors to test, 0 for the whole application area
        #[structopt(long, default_value = "0")]
        sectors: u32,
    },
}

fn parse_u32(s: &str) -> Result<u32, ParseIntError> {
    match s.strip_prefix("0x") {
        Some(h) => u32::from_str_radix(h, 16),
        None => s.parse(),
    }
}

fn parse_u8(s: &str) -> Result<u8, ParseIntError> {
    match s.strip_prefix("0x") {
        Some(h) => u8::from_str_radix(h, 16),
        None => s.parse(),
    }
}

fn parse_size(s: &str) -> Result<usize, String> {
    if let Ok(v) = parse_u32(s) {
        return Ok(v as usize);
    }
    bytefmt::parse(s).map(|v| v as usize).map_err(|e| e.to_string())
}

type Device = Programmer<LinuxTransport>;

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    if let Err(e) = run(o) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(o: Args) -> anyhow::Result<()> {
    let interface = match o.interface {
        InterfaceKind::Uart => Interface::Uart { port: o.port.clone(), baud: o.baud },
        InterfaceKind::I2c => Interface::I2c { bus: o.bus, address: o.address.unwrap_or(0x5E) },
        InterfaceKind::Spi => Interface::Spi {
            bus: o.bus,
            device: o.address.unwrap_or(0),
            clock_baud: o.clock,
        },
    };

    info!("Connecting over {:?}", interface);

    let mut p = Programmer::linux(&interface, o.link.clone(), o.options.clone())?;

    p.open()?;

    info!("Connecting to bootloader");

    if !p.activate()? {
        p.close()?;
        bail!("Failed to communicate with picoboot3");
    }

    info!("Bootloader connected!");

    let result = execute(&mut p, &o.command);

    p.close()?;

    result
}

fn execute(p: &mut Device, command: &Operation) -> anyhow::Result<()> {
    let version = p.version_command()?;
    let flash_size = p.flash_size_command()?;
    let g = p.geometry();
    let available = g.available().unwrap_or(0);

    match command {
        Operation::Info => {
            info!("Device picoboot3 version: {}", version);
            info!("Flash size: {}", bytefmt::format(flash_size as u64));
            info!("Sector size: {}", bytefmt::format(g.sector_size as u64));
            info!("Application offset: 0x{:08x}", g.appcode_offset);
            info!("Available space: {} bytes", available);
        }
        Operation::Erase { first, count } => {
            let first = first.unwrap_or_else(|| g.first_app_sector());
            let count = count.unwrap_or_else(|| (flash_size / g.sector_size).saturating_sub(first));
            erase(p, SectorRange::new(first, count))?;
        }
        Operation::Blank { offset, length } => {
            let offset = offset.unwrap_or(g.appcode_offset);
            let length = length.unwrap_or_else(|| flash_size.saturating_sub(offset) as usize);

            let pb = progress_bar(length, "Blank check");
            let blank = p.verify_blank_with(offset, length, &mut track(&pb))?;
            pb.finish_and_clear();

            if !blank {
                bail!("Region is not blank");
            }
            info!("Region is blank");
        }
        Operation::Program { file, offset } => {
            let data = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
            let offset = offset.unwrap_or(g.appcode_offset);
            program(p, offset, &data, false)?;
        }
        Operation::Verify { file, offset } => {
            let data = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
            let offset = offset.unwrap_or(g.appcode_offset);
            verify(p, offset, &data)?;
        }
        Operation::Dump { offset, length, output } => {
            let offset = offset.unwrap_or(g.appcode_offset);

            match output {
                Some(path) => {
                    let pb = progress_bar(*length, "Read");
                    let data = p.dump_with(offset, *length, false, &mut track(&pb))?;
                    pb.finish_with_message("Read complete");

                    std::fs::write(path, &data).with_context(|| format!("writing {}", path.display()))?;
                    info!("Wrote {} to {}", bytefmt::format(data.len() as u64), path.display());
                }
                None => {
                    p.dump(offset, *length, true)?;
                }
            }
        }
        Operation::Go => {
            p.go_to_appcode()?;
            info!("Application started");
        }
        Operation::Test { sectors } => {
            let len = match sectors {
                0 => available as usize,
                n => (*n * g.sector_size) as usize,
            };
            if len > available as usize {
                bail!("Not enough available space in flash");
            }

            info!("Test data size: {} bytes", len);

            let mut data = vec![0u8; len];
            rand::thread_rng().fill(&mut data[..]);

            program(p, g.appcode_offset, &data, true)?;

            let dumped = p.dump(g.appcode_offset, data.len(), false)?;
            if dumped != data {
                bail!("Dump comparison failed");
            }
            info!("Dump comparison passed");
        }
    }

    Ok(())
}

fn progress_bar(len: usize, what: &str) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            .progress_chars("#>-"),
    );
    pb.set_message(what);
    pb
}

fn track(pb: &ProgressBar) -> impl FnMut(usize, usize) -> Control + '_ {
    move |done, _total| {
        pb.set_position(done as u64);
        Control::Continue
    }
}

fn check(outcome: Outcome, what: &str) -> anyhow::Result<()> {
    match outcome {
        Outcome::Complete => Ok(()),
        Outcome::Incomplete(s) => Err(anyhow!(
            "{} stopped at chunk {} (0x{:x}) after {} units: {:?}",
            what,
            s.chunk,
            s.start,
            s.completed,
            s.reason
        )),
    }
}

fn erase(p: &mut Device, range: SectorRange) -> anyhow::Result<()> {
    let pb = progress_bar(range.count() as usize, "Erase");
    let outcome = p.erase_with(range, &mut track(&pb))?;
    pb.finish_with_message("Erase complete");

    check(outcome, "Erase")
}

/// Log the first and last 64 bytes of a region as hex
fn show_edges(p: &mut Device, offset: u32, len: usize) -> anyhow::Result<()> {
    let n = len.min(64);
    if n == 0 {
        return Ok(());
    }

    p.dump(offset, n, true)?;
    p.dump(offset + (len - n) as u32, n, true)?;

    Ok(())
}

/// Erase, blank check, program with read-back and verify.
///
/// With `show` the ends of the image are dumped after erasing and after programming.
fn program(p: &mut Device, offset: u32, data: &[u8], show: bool) -> anyhow::Result<()> {
    let g = p.geometry();
    if offset % g.sector_size != 0 {
        bail!("Program offset 0x{:x} is not sector aligned", offset);
    }

    let first = offset / g.sector_size;
    let count = g.sectors_for(data.len());
    erase(p, SectorRange::new(first, count))?;

    if show {
        show_edges(p, offset, data.len())?;
    }

    if !p.verify_blank(offset, (count * g.sector_size) as usize)? {
        bail!("Verify after erase failed");
    }

    let pb = progress_bar(data.len(), "Program");
    let outcome = p.program_with(offset, data, &mut track(&pb))?;
    pb.finish_with_message("Program complete");
    check(outcome, "Program")?;

    if show {
        show_edges(p, offset, data.len())?;
    }

    verify(p, offset, data)
}

fn verify(p: &mut Device, offset: u32, data: &[u8]) -> anyhow::Result<()> {
    let pb = progress_bar(data.len(), "Verify");
    let ok = p.verify_with(offset, data, &mut track(&pb))?;
    pb.finish_and_clear();

    if !ok {
        bail!("Verify failed");
    }
    info!("Verify passed");

    Ok(())
}
