use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::Parser;
use indicatif::ProgressBar;
use log::{debug, info, warn};

use stm32_sysboot::{
    Bootloader, Family, LinkConfig, Parity, Progress, SerialLink, ERASED_BYTE,
};

const PORT_ENV: &str = "STM32LOADER_SERIAL_PORT";
const FAMILY_ENV: &str = "STM32LOADER_FAMILY";

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum ArgParity {
    /// 8E1, what STM32 bootloaders speak
    Even,
    /// 8N1, for BlueNRG-1/2
    None,
}

impl From<ArgParity> for Parity {
    fn from(parity: ArgParity) -> Self {
        match parity {
            ArgParity::Even => Parity::Even,
            ArgParity::None => Parity::None,
        }
    }
}

/// Flash, read and protect STM32 microcontrollers through the factory UART
/// bootloader, driving BOOT0 and RESET over the serial modem-control lines.
#[derive(clap::Parser)]
#[command(author, version, about, long_about = None)]
struct Opt {
    /// Serial port (or set STM32LOADER_SERIAL_PORT)
    #[arg(short, long)]
    port: Option<String>,

    /// Baud rate
    #[arg(short, long, default_value_t = stm32_sysboot::DEFAULT_BAUDRATE)]
    baud: u32,

    /// Wire parity; defaults to the family's convention
    #[arg(long, value_enum)]
    parity: Option<ArgParity>,

    /// Target address for read/write/verify
    #[arg(short, long, default_value = "0x08000000", value_parser = parse_address)]
    address: u32,

    /// Number of bytes to read (defaults to the detected flash size)
    #[arg(short, long)]
    length: Option<usize>,

    /// Device family, e.g. F4 or NRG (or set STM32LOADER_FAMILY)
    #[arg(short, long)]
    family: Option<String>,

    /// Erase before writing: the listed pages, or everything
    #[arg(short, long)]
    erase: bool,

    /// Page indices to erase, comma separated
    #[arg(long, value_delimiter = ',', requires = "erase")]
    pages: Option<Vec<u32>>,

    /// Write the firmware file to the target
    #[arg(short, long)]
    write: bool,

    /// Read the written range back and compare it with the firmware file
    #[arg(short, long)]
    verify: bool,

    /// Read target memory out into the file
    #[arg(short, long)]
    read: bool,

    /// Lift readout protection first; this mass-erases the flash
    #[arg(short, long)]
    unprotect: bool,

    /// Jump to this address when done instead of resetting into user code
    #[arg(short, long, value_parser = parse_address)]
    go_address: Option<u32>,

    /// RESET rides on RTS and BOOT0 on DTR instead of the usual assignment
    #[arg(long)]
    swap_rts_dtr: bool,

    /// RESET pin is wired active-high
    #[arg(long)]
    reset_active_high: bool,

    /// BOOT0 pin is wired active-low
    #[arg(long)]
    boot0_active_low: bool,

    /// Do not render progress bars
    #[arg(long)]
    no_progress: bool,

    /// Firmware file (raw binary, or Intel HEX by .hex/.ihx extension);
    /// output file for --read
    file: Option<PathBuf>,
}

/// Parsed firmware image: load data plus the base address Intel HEX records
/// carry. Raw binaries have no base of their own.
struct Firmware {
    base: Option<u32>,
    data: Vec<u8>,
}

fn parse_address(s: &str) -> Result<u32, String> {
    let stripped = s.trim_start_matches("0x").trim_start_matches("0X");
    let radix = if stripped.len() == s.len() { 10 } else { 16 };
    u32::from_str_radix(stripped, radix).map_err(|e| format!("invalid address `{s}`: {e}"))
}

fn load_firmware(path: &Path) -> anyhow::Result<Firmware> {
    let is_hex = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("hex") | Some("ihx")
    );
    if is_hex {
        let text = fs::read_to_string(path)?;
        parse_intel_hex(&text)
    } else {
        Ok(Firmware {
            base: None,
            data: fs::read(path)?,
        })
    }
}

/// Flatten Intel HEX records into one contiguous image. Gaps between
/// records are filled with the erased-flash value, so sparse images stay
/// write- and verify-safe on erased parts.
fn parse_intel_hex(text: &str) -> anyhow::Result<Firmware> {
    use ihex::Record;

    let mut chunks: Vec<(u32, Vec<u8>)> = Vec::new();
    let mut upper: u32 = 0;
    let mut segment: u32 = 0;
    for record in ihex::Reader::new(text) {
        match record.context("Failed to parse Intel HEX record")? {
            Record::Data { offset, value } => {
                chunks.push((upper + segment + u32::from(offset), value));
            }
            Record::ExtendedLinearAddress(address) => upper = u32::from(address) << 16,
            Record::ExtendedSegmentAddress(address) => segment = u32::from(address) << 4,
            // entry-point records carry no load data
            Record::StartLinearAddress(_) | Record::StartSegmentAddress { .. } => {}
            Record::EndOfFile => break,
        }
    }
    if chunks.is_empty() {
        bail!("no data records in Intel HEX file");
    }

    let base = chunks.iter().map(|(address, _)| *address).min().unwrap();
    let end = chunks
        .iter()
        .map(|(address, data)| address + data.len() as u32)
        .max()
        .unwrap();
    let mut data = vec![ERASED_BYTE; (end - base) as usize];
    for (address, bytes) in &chunks {
        let offset = (address - base) as usize;
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
    debug!("Intel HEX image: {} bytes based at 0x{base:08X}", data.len());
    Ok(Firmware {
        base: Some(base),
        data,
    })
}

/// Progress bar adapter for the library's observer.
struct Bar(ProgressBar);

impl Bar {
    fn new(hidden: bool) -> Self {
        if hidden {
            Self(ProgressBar::hidden())
        } else {
            Self(ProgressBar::new(0))
        }
    }
}

impl Progress for Bar {
    fn update(&mut self, done: usize, total: usize) {
        self.0.set_length(total as u64);
        self.0.set_position(done as u64);
        if done == total {
            self.0.finish();
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let opt = Opt::parse();
    run(opt)
}

fn run(opt: Opt) -> anyhow::Result<()> {
    let port = opt
        .port
        .clone()
        .or_else(|| std::env::var(PORT_ENV).ok())
        .with_context(|| format!("No serial port given; use --port or {PORT_ENV}"))?;

    let family = opt
        .family
        .clone()
        .or_else(|| std::env::var(FAMILY_ENV).ok())
        .map(|name| name.parse::<Family>())
        .transpose()
        .context("Failed to parse device family")?;

    let parity = opt
        .parity
        .map(Parity::from)
        .or_else(|| family.map(|f| f.parity()))
        .unwrap_or(Parity::Even);

    let config = LinkConfig::with_port(port)
        .and_baud_rate(opt.baud)
        .and_parity(parity)
        .and_swap_rts_dtr(opt.swap_rts_dtr)
        .and_reset_active_high(opt.reset_active_high)
        .and_boot0_active_low(opt.boot0_active_low);

    let link = SerialLink::open(config).context("Failed to open serial port")?;
    let mut target = Bootloader::new(link);

    target
        .reset_from_system_memory()
        .context("Failed to activate the system bootloader")?;
    let descriptor = target
        .identify(family)
        .context("Failed to identify the target")?
        .clone();

    println!("Bootloader version: {}", descriptor.version);
    match descriptor.family {
        Some(family) => println!(
            "Product id: 0x{:03X} (family {family})",
            descriptor.product_id
        ),
        None => println!("Product id: 0x{:03X} (unknown family)", descriptor.product_id),
    }

    let flash_size = match target.get_flash_size() {
        Ok(size) => {
            println!("Flash size: {} KiB", size / 1024);
            Some(size)
        }
        Err(e) => {
            debug!("flash size not read: {e}");
            None
        }
    };
    match target.get_uid() {
        Ok(uid) => {
            let hex: Vec<String> = uid.iter().map(|b| format!("{b:02X}")).collect();
            println!("Device UID: {}", hex.join(":"));
        }
        Err(e) => debug!("UID not read: {e}"),
    }

    if opt.unprotect {
        target
            .readout_unprotect()
            .context("Failed to lift readout protection")?;
        warn!("readout protection lifted; the flash is now mass-erased");
    }

    let firmware = if opt.write || opt.verify {
        let path = opt
            .file
            .as_ref()
            .context("--write and --verify need a firmware file")?;
        let firmware = load_firmware(path)
            .with_context(|| format!("Failed to load firmware from {}", path.display()))?;
        info!("loaded {} firmware bytes", firmware.data.len());
        Some(firmware)
    } else {
        None
    };

    if opt.erase {
        match &opt.pages {
            Some(pages) => target.erase_memory(Some(pages)),
            None => target.erase_memory(None),
        }
        .context("Failed to erase")?;
    }

    if opt.write {
        let image = firmware.as_ref().unwrap();
        let address = image.base.unwrap_or(opt.address);
        let mut bar = Bar::new(opt.no_progress);
        target
            .write_memory_data(address, &image.data, &mut bar)
            .context("Failed to write firmware")?;
    }

    if opt.verify {
        let image = firmware.as_ref().unwrap();
        let address = image.base.unwrap_or(opt.address);
        let mut bar = Bar::new(opt.no_progress);
        target
            .verify(address, &image.data, &mut bar)
            .context("Verification failed")?;
        println!("Verification OK");
    }

    if opt.read {
        let path = opt.file.as_ref().context("--read needs an output file")?;
        let length = match opt.length {
            Some(length) => length,
            None => flash_size.context(
                "--length not given and the flash size could not be detected",
            )? as usize,
        };
        let mut bar = Bar::new(opt.no_progress);
        let data = target
            .read_memory_data(opt.address, length, &mut bar)
            .context("Failed to read target memory")?;
        fs::write(path, &data)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Read {} bytes into {}", data.len(), path.display());
    }

    match opt.go_address {
        Some(address) => target
            .go(address)
            .context("Failed to jump to user code")?,
        None => target
            .reset_from_flash()
            .context("Failed to reset the target")?,
    }

    Ok(())
}
