//! Frame codec and the AN3155 command set.

use std::thread;
use std::time::Duration;

use log::{debug, info, trace, warn};

use crate::{
    family::Family, link::ByteLink, CommandSet, Error, Version, ACK, MAX_ERASE_PAGE_COUNT,
    MAX_READ_BYTES_COUNT, MAX_WRITE_BYTES_COUNT, NACK, SYNC_BYTE,
};

/// Minimum time RESET is held active during a pulse
const RESET_PULSE: Duration = Duration::from_millis(10);

/// Settle time after a reset before the bootloader accepts the sync byte
const RESET_SETTLE: Duration = Duration::from_millis(25);

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    /// Gets the version and the allowed commands supported by the current version of the protocol.
    Get = 0x00,
    /// Gets the protocol version and the read protection status.
    GetVersion = 0x01,
    /// Gets the chip ID.
    GetId = 0x02,
    /// Reads up to 256 bytes of memory starting from an address specified by the application.
    ReadMemory = 0x11,
    /// Jumps to user application code located in the internal flash memory or in the SRAM.
    Go = 0x21,
    /// Writes up to 256 bytes to the RAM or flash memory starting from an address specified by the application.
    WriteMemory = 0x31,
    /// Erases from one to all the flash memory pages.
    Erase = 0x43,
    /// Erases from one to all the flash memory pages using two-byte addressing mode (available only for USART bootloader v3.0 and higher).
    ExtendedErase = 0x44,
    /// Enables the write protection for some sectors.
    WriteProtect = 0x63,
    /// Disables the write protection for all flash memory sectors.
    WriteUnprotect = 0x73,
    /// Enables the read protection.
    ReadoutProtect = 0x82,
    /// Disables the read protection. The device mass-erases itself in the process.
    ReadoutUnprotect = 0x92,
}

/// Which dialect of the erase command the device implements.
///
/// The two are mutually exclusive: a bootloader advertises either the
/// one-byte-index Erase command or the two-byte ExtendedErase, never both.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EraseDialect {
    /// One-byte page indices, at most 255 pages per command
    Legacy,
    /// Two-byte page indices
    Extended,
}

/// Extended-erase target for the sentinel (non-page-list) forms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BankErase {
    /// Erase all banks
    Global,
    /// Erase only bank 1
    Bank1,
    /// Erase only bank 2
    Bank2,
}

/// Everything learned about the target during identification.
#[derive(Clone, Debug)]
pub struct DeviceDescriptor {
    /// Bootloader protocol version
    pub version: Version,
    /// Option bytes from Get Version; the first reflects read protection
    pub option_bytes: [u8; 2],
    /// 12-bit product identifier
    pub product_id: u16,
    /// Opcodes the bootloader advertised
    pub commands: CommandSet,
    /// Catalog family, when the product id (or the caller) names one
    pub family: Option<Family>,
    /// Erase dialect inferred from the advertised opcodes
    pub erase_dialect: EraseDialect,
}

impl DeviceDescriptor {
    /// Read-protection status byte.
    pub fn read_protection(&self) -> u8 {
        self.option_bytes[0]
    }
}

/// Frame a command opcode with its ones'-complement check byte.
pub fn encode_command(opcode: u8) -> [u8; 2] {
    [opcode, !opcode]
}

/// XOR checksum of a payload. A single byte checksums to its complement.
pub fn checksum(bytes: &[u8]) -> u8 {
    match bytes {
        [single] => !single,
        _ => bytes.iter().fold(0u8, |acc, b| acc ^ *b),
    }
}

/// Append the XOR checksum to a payload.
pub fn encode_payload(bytes: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(bytes.len() + 1);
    frame.extend_from_slice(bytes);
    frame.push(checksum(bytes));
    frame
}

/// Validate a framed payload's trailing checksum and strip it.
pub fn decode_payload(frame: &[u8]) -> Option<&[u8]> {
    let (check, payload) = frame.split_last()?;
    (checksum(payload) == *check).then_some(payload)
}

/// Protocol engine driving a target's system bootloader over a [`ByteLink`].
///
/// Single-threaded by design; the link is owned exclusively for the
/// engine's lifetime and the port closes when the engine is dropped.
pub struct Bootloader<L> {
    pub(crate) link: L,
    descriptor: Option<DeviceDescriptor>,
    pub(crate) cancel: Option<std::sync::Arc<std::sync::atomic::AtomicBool>>,
}

impl<L: ByteLink> Bootloader<L> {
    pub fn new(link: L) -> Self {
        Self {
            link,
            descriptor: None,
            cancel: None,
        }
    }

    /// Descriptor populated by [`Bootloader::identify`].
    pub fn descriptor(&self) -> Option<&DeviceDescriptor> {
        self.descriptor.as_ref()
    }

    /// Erase dialect of the identified device.
    pub fn erase_dialect(&self) -> Option<EraseDialect> {
        self.descriptor.as_ref().map(|d| d.erase_dialect)
    }

    /// Force a boot from system memory and synchronise with the bootloader.
    ///
    /// BOOT0 stays asserted afterwards, so a command that restarts the
    /// bootloader lands back in system memory instead of user code.
    pub fn reset_from_system_memory(&mut self) -> Result<(), Error> {
        info!("resetting target into the system bootloader");
        self.link.set_boot0(true)?;
        self.pulse_reset()?;
        self.handshake()
    }

    /// Reboot into user code: release BOOT0 and pulse RESET. No handshake
    /// follows; the bootloader is gone after this.
    pub fn reset_from_flash(&mut self) -> Result<(), Error> {
        info!("resetting target into user code");
        self.link.set_boot0(false)?;
        self.pulse_reset()
    }

    fn pulse_reset(&mut self) -> Result<(), Error> {
        self.link.set_reset(true)?;
        thread::sleep(RESET_PULSE);
        self.link.set_reset(false)?;
        thread::sleep(RESET_SETTLE);
        Ok(())
    }

    /// Discard boot noise, send the autobaud sync byte, wait for the ACK.
    fn synchronize(&mut self) -> Result<(), Error> {
        self.link.flush_input()?;
        debug!("sending sync byte");
        self.link.write_all(&[SYNC_BYTE])?;
        self.expect_ack()
    }

    fn handshake(&mut self) -> Result<(), Error> {
        if let Err(first) = self.synchronize() {
            debug!("no answer to sync byte ({first}), retrying once");
            match self.synchronize() {
                Ok(()) => {}
                // An already-synchronised bootloader (BlueNRG in
                // particular) answers a repeated sync byte with NACK.
                Err(Error::Nack) => {}
                Err(_) => return Err(Error::Activation),
            }
        }
        Ok(())
    }

    /// A protection command restarts the bootloader. BOOT0 is still held,
    /// so the target lands back in system memory and must be synchronised
    /// again before the next command.
    fn reactivate(&mut self) -> Result<(), Error> {
        debug!("bootloader restarted, re-synchronising");
        thread::sleep(RESET_SETTLE);
        self.handshake()
    }

    fn read_byte(&mut self) -> Result<u8, Error> {
        let mut byte = [0u8];
        self.link.read_exact(&mut byte)?;
        Ok(byte[0])
    }

    fn expect_ack(&mut self) -> Result<(), Error> {
        match self.read_byte()? {
            ACK => {
                trace!("received ACK");
                Ok(())
            }
            NACK => {
                warn!("received NACK");
                Err(Error::Nack)
            }
            other => Err(Error::Protocol {
                expected: ACK,
                got: other,
            }),
        }
    }

    /// Send an encoded command frame and consume the command ACK.
    ///
    /// Once a descriptor exists, opcodes the bootloader did not advertise
    /// are refused before anything goes on the wire.
    fn send_command(&mut self, command: Command) -> Result<(), Error> {
        if let Some(descriptor) = &self.descriptor {
            if !descriptor.commands.contains(command as u8) {
                return Err(Error::Unsupported(format!(
                    "bootloader does not implement {command:?}"
                )));
            }
        }
        let frame = encode_command(command as u8);
        debug!("sending command {command:?}: {frame:02X?}");
        self.link.write_all(&frame)?;
        self.expect_ack()
    }

    fn write_address(&mut self, address: u32) -> Result<(), Error> {
        self.link
            .write_all(&encode_payload(&address.to_be_bytes()))?;
        self.expect_ack()
    }

    /// Get: protocol version and the set of implemented opcodes.
    pub fn get(&mut self) -> Result<(Version, CommandSet), Error> {
        self.send_command(Command::Get)?;
        let count = usize::from(self.read_byte()?);
        let mut data = vec![0u8; count + 1];
        self.link.read_exact(&mut data)?;
        self.expect_ack()?;
        let version = Version::from(data[0]);
        let commands: CommandSet = data[1..].iter().copied().collect();
        debug!("bootloader v{version}, commands {commands:?}");
        Ok((version, commands))
    }

    /// Get Version & Read Protection Status.
    pub fn get_version(&mut self) -> Result<(Version, [u8; 2]), Error> {
        self.send_command(Command::GetVersion)?;
        let mut data = [0u8; 3];
        self.link.read_exact(&mut data)?;
        self.expect_ack()?;
        Ok((Version::from(data[0]), [data[1], data[2]]))
    }

    /// Get ID: the 12-bit product identifier, received big-endian.
    pub fn get_id(&mut self) -> Result<u16, Error> {
        self.send_command(Command::GetId)?;
        let count = usize::from(self.read_byte()?) + 1;
        let mut data = vec![0u8; count];
        self.link.read_exact(&mut data)?;
        self.expect_ack()?;
        let id = data.iter().fold(0u16, |acc, b| (acc << 8) | u16::from(*b));
        debug!("product id: {id:#05X}");
        Ok(id)
    }

    /// Run Get / Get Version / Get ID and populate the device descriptor.
    ///
    /// `family` overrides the catalog lookup, for parts whose product id is
    /// ambiguous or absent (BlueNRG has to be named by the caller anyway,
    /// since its no-parity link is configured before any command runs).
    pub fn identify(&mut self, family: Option<Family>) -> Result<&DeviceDescriptor, Error> {
        let (version, commands) = self.get()?;
        let option_bytes = if commands.contains(Command::GetVersion as u8) {
            self.get_version()?.1
        } else {
            [0, 0]
        };
        let product_id = self.get_id()?;
        let family = family.or_else(|| Family::from_product_id(product_id));
        if family.is_none() {
            warn!("product id {product_id:#05X} is not in the AN2606 catalog");
        }
        let erase_dialect = if commands.contains(Command::ExtendedErase as u8) {
            EraseDialect::Extended
        } else {
            EraseDialect::Legacy
        };
        let descriptor = DeviceDescriptor {
            version,
            option_bytes,
            product_id,
            commands,
            family,
            erase_dialect,
        };
        info!(
            "target: product id {:#05X}, family {}, bootloader v{}",
            descriptor.product_id,
            descriptor
                .family
                .map(|f| f.to_string())
                .unwrap_or_else(|| "unknown".into()),
            descriptor.version,
        );
        Ok(self.descriptor.insert(descriptor))
    }

    /// Read up to 256 bytes starting at `address`.
    pub fn read_memory(&mut self, address: u32, data: &mut [u8]) -> Result<(), Error> {
        if data.is_empty() || data.len() > MAX_READ_BYTES_COUNT {
            return Err(Error::InvalidArgument("read length must be in 1..=256"));
        }
        self.send_command(Command::ReadMemory)?;
        self.write_address(address)?;
        let n = (data.len() - 1) as u8;
        self.link.write_all(&encode_payload(&[n]))?;
        self.expect_ack()?;
        self.link.read_exact(data)?;
        trace!("read {} bytes from {address:#010X}", data.len());
        Ok(())
    }

    /// Write up to 256 bytes starting at `address`. Address and length must
    /// be multiples of 4; the transfer layer pads image tails before
    /// calling this.
    pub fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() || data.len() > MAX_WRITE_BYTES_COUNT {
            return Err(Error::InvalidArgument("write length must be in 1..=256"));
        }
        if address % 4 != 0 || data.len() % 4 != 0 {
            return Err(Error::InvalidArgument(
                "writes must be aligned to 4-byte words",
            ));
        }
        self.send_command(Command::WriteMemory)?;
        self.write_address(address)?;
        let mut payload = Vec::with_capacity(data.len() + 1);
        payload.push((data.len() - 1) as u8);
        payload.extend_from_slice(data);
        self.link.write_all(&encode_payload(&payload))?;
        self.expect_ack()?;
        trace!("wrote {} bytes to {address:#010X}", data.len());
        Ok(())
    }

    /// Jump to user code at `address`. The bootloader stops answering after
    /// the final ACK.
    pub fn go(&mut self, address: u32) -> Result<(), Error> {
        info!("jumping to {address:#010X}");
        self.send_command(Command::Go)?;
        self.write_address(address)
    }

    /// Erase the listed pages with the one-byte-index command.
    pub fn erase_pages(&mut self, pages: &[u8]) -> Result<(), Error> {
        if pages.is_empty() {
            return Err(Error::InvalidArgument("page list is empty"));
        }
        if pages.len() > MAX_ERASE_PAGE_COUNT {
            return Err(Error::Unsupported(format!(
                "standard erase takes at most {MAX_ERASE_PAGE_COUNT} pages, got {}",
                pages.len()
            )));
        }
        info!("erasing {} pages", pages.len());
        self.send_command(Command::Erase)?;
        let mut payload = Vec::with_capacity(pages.len() + 1);
        payload.push((pages.len() - 1) as u8);
        payload.extend_from_slice(pages);
        self.link.write_all(&encode_payload(&payload))?;
        self.expect_ack()
    }

    /// Mass erase with the one-byte-index command.
    pub fn erase_all(&mut self) -> Result<(), Error> {
        info!("mass erase (standard command)");
        self.send_command(Command::Erase)?;
        self.link.write_all(&encode_payload(&[0xFF]))?;
        self.expect_ack()
    }

    /// Erase the listed pages with the two-byte-index command.
    pub fn extended_erase_pages(&mut self, pages: &[u16]) -> Result<(), Error> {
        if pages.is_empty() {
            return Err(Error::InvalidArgument("page list is empty"));
        }
        if pages.len() > usize::from(u16::MAX) {
            return Err(Error::Unsupported(format!(
                "extended erase takes at most {} pages, got {}",
                u16::MAX,
                pages.len()
            )));
        }
        info!("erasing {} pages (extended command)", pages.len());
        self.send_command(Command::ExtendedErase)?;
        let mut payload = Vec::with_capacity(2 * (pages.len() + 1));
        payload.extend_from_slice(&((pages.len() - 1) as u16).to_be_bytes());
        for page in pages {
            payload.extend_from_slice(&page.to_be_bytes());
        }
        self.link.write_all(&encode_payload(&payload))?;
        self.expect_ack()
    }

    /// Extended erase of a whole bank, or of everything.
    pub fn extended_erase_special(&mut self, target: BankErase) -> Result<(), Error> {
        info!("mass erase (extended command, {target:?})");
        let code: [u8; 2] = match target {
            BankErase::Global => [0xFF, 0xFF],
            BankErase::Bank1 => [0xFF, 0xFE],
            BankErase::Bank2 => [0xFF, 0xFD],
        };
        self.send_command(Command::ExtendedErase)?;
        self.link.write_all(&encode_payload(&code))?;
        self.expect_ack()
    }

    /// Mass erase with the two-byte-index command.
    pub fn extended_erase_all(&mut self) -> Result<(), Error> {
        self.extended_erase_special(BankErase::Global)
    }

    /// Enable write protection for the listed sectors. The bootloader
    /// restarts afterwards; the engine re-synchronises before returning.
    pub fn write_protect(&mut self, sectors: &[u8]) -> Result<(), Error> {
        if sectors.is_empty() {
            return Err(Error::InvalidArgument("sector list is empty"));
        }
        if sectors.len() > MAX_ERASE_PAGE_COUNT {
            return Err(Error::Unsupported(format!(
                "write protect takes at most {MAX_ERASE_PAGE_COUNT} sectors, got {}",
                sectors.len()
            )));
        }
        info!("write-protecting {} sectors", sectors.len());
        self.send_command(Command::WriteProtect)?;
        let mut payload = Vec::with_capacity(sectors.len() + 1);
        payload.push((sectors.len() - 1) as u8);
        payload.extend_from_slice(sectors);
        self.link.write_all(&encode_payload(&payload))?;
        self.expect_ack()?;
        self.reactivate()
    }

    /// Disable write protection for all sectors. Restarts the bootloader.
    pub fn write_unprotect(&mut self) -> Result<(), Error> {
        info!("lifting write protection");
        self.send_command(Command::WriteUnprotect)?;
        self.expect_ack()?;
        self.reactivate()
    }

    /// Enable readout protection. Restarts the bootloader.
    pub fn readout_protect(&mut self) -> Result<(), Error> {
        info!("enabling readout protection");
        self.send_command(Command::ReadoutProtect)?;
        self.expect_ack()?;
        self.reactivate()
    }

    /// Disable readout protection. The device mass-erases its flash, then
    /// restarts the bootloader.
    pub fn readout_unprotect(&mut self) -> Result<(), Error> {
        info!("lifting readout protection; this mass-erases the flash");
        self.send_command(Command::ReadoutUnprotect)?;
        self.expect_ack()?;
        self.reactivate()
    }

    /// Flash capacity in bytes, read from the family's size register.
    pub fn get_flash_size(&mut self) -> Result<u32, Error> {
        let family = self.known_family()?;
        let register = family.flash_size_register().ok_or_else(|| {
            Error::Unsupported(format!("no flash-size register documented for {family}"))
        })?;
        let mut raw = [0u8; 4];
        let width = family.flash_size_register_width();
        self.read_memory(register, &mut raw[..width])?;
        Ok(family.decode_flash_size(&raw[..width]))
    }

    /// The 96-bit unique device identifier.
    pub fn get_uid(&mut self) -> Result<[u8; 12], Error> {
        let family = self.known_family()?;
        let register = family
            .uid_register()
            .ok_or_else(|| Error::Unsupported(format!("no UID register documented for {family}")))?;
        let mut uid = [0u8; 12];
        self.read_memory(register, &mut uid)?;
        Ok(uid)
    }

    fn known_family(&self) -> Result<Family, Error> {
        self.descriptor
            .as_ref()
            .and_then(|d| d.family)
            .ok_or(Error::UnknownFamily)
    }
}
