//! Host-side driver for the STM32 system-memory (factory) bootloader.
//!
//! Talks the USART protocol from ST application note AN3155 over a serial
//! port, and drives the target's RESET and BOOT0 pins through the port's
//! modem-control lines so the target can be rebooted into the bootloader
//! held in system memory (AN2606). The BlueNRG-1/2 variant of the protocol
//! (AN4872) is reachable through the no-parity link configuration, and the
//! Wiznet W7500 speaks the same protocol as the STM32 parts.
//!
//! The [`Bootloader`] engine is generic over [`ByteLink`], so RESET/BOOT0
//! can be redirected to GPIO pins on a single-board computer by providing
//! another link implementation; [`SerialLink`] is the stock one.

use thiserror::Error as ThisError;

pub mod family;
pub mod link;
pub mod protocol;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testing;

pub use family::Family;
pub use link::{ByteLink, LinkConfig, Parity, SerialLink};
pub use protocol::{BankErase, Bootloader, Command, DeviceDescriptor, EraseDialect};
pub use transfer::{NoProgress, Progress};

/// Baudrate sync byte sent right after the bootloader starts
pub const SYNC_BYTE: u8 = 0x7F;

/// Command or data accepted
pub const ACK: u8 = 0x79;

/// Command or data rejected
pub const NACK: u8 = 0x1F;

/// Default baud rate
pub const DEFAULT_BAUDRATE: u32 = 115_200;

/// Default per-read timeout, in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// Maximum number of pages that can be erased in a single standard erase command
pub const MAX_ERASE_PAGE_COUNT: usize = u8::MAX as usize;

/// Maximum number of bytes that can be written in a single write memory command
pub const MAX_WRITE_BYTES_COUNT: usize = u8::MAX as usize + 1;

/// Maximum number of bytes that can be read in a single read memory command
pub const MAX_READ_BYTES_COUNT: usize = u8::MAX as usize + 1;

/// Start of user flash on most STM32 parts
pub const DEFAULT_START_ADDRESS: u32 = 0x0800_0000;

/// Value of erased flash, used to pad partial words
pub const ERASED_BYTE: u8 = 0xFF;

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("serial link failure: {0}")]
    Link(#[from] serialport::Error),

    #[error("timed out waiting for data from the target")]
    Timeout,

    #[error("received a NACK from bootloader")]
    Nack,

    #[error("invalid response from bootloader: expected 0x{expected:02X}, got 0x{got:02X}")]
    Protocol { expected: u8, got: u8 },

    #[error("target did not enter the system bootloader; check BOOT0 and RESET wiring")]
    Activation,

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("device family is not known; pass it explicitly to use family-specific registers")]
    UnknownFamily,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("verification mismatch at offset {offset}: expected 0x{expected:02X}, read 0x{actual:02X}")]
    Mismatch {
        offset: usize,
        expected: u8,
        actual: u8,
    },

    #[error("operation cancelled")]
    Cancelled,
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => Self::Timeout,
            _ => Self::Link(e.into()),
        }
    }
}

/// Bootloader protocol version, BCD major.minor in one byte
///
/// # Example
/// ```
/// # use stm32_sysboot::Version;
/// let ver = Version::from(0x31);
///
/// assert_eq!(3, ver.major());
/// assert_eq!(1, ver.minor());
/// assert_eq!((3, 1), ver.value());
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Version(u8);

impl Version {
    pub fn value(&self) -> (u8, u8) {
        (self.major(), self.minor())
    }

    pub fn major(&self) -> u8 {
        self.0 >> 4
    }

    pub fn minor(&self) -> u8 {
        self.0 & 0x0F
    }
}

impl From<u8> for Version {
    fn from(v: u8) -> Self {
        Self(v)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major(), self.minor())
    }
}

/// Set of command opcodes advertised by the bootloader's Get response.
///
/// Kept as a fixed bitset so unknown opcodes survive discovery; optional
/// operations consult this before going on the wire.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandSet([u64; 4]);

impl CommandSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, opcode: u8) {
        self.0[usize::from(opcode >> 6)] |= 1 << (opcode & 0x3F);
    }

    pub fn contains(&self, opcode: u8) -> bool {
        self.0[usize::from(opcode >> 6)] & (1 << (opcode & 0x3F)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == [0; 4]
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (0..=u8::MAX).filter(|opcode| self.contains(*opcode))
    }
}

impl FromIterator<u8> for CommandSet {
    fn from_iter<I: IntoIterator<Item = u8>>(opcodes: I) -> Self {
        let mut set = Self::new();
        for opcode in opcodes {
            set.insert(opcode);
        }
        set
    }
}

impl std::fmt::Debug for CommandSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set()
            .entries(self.iter().map(|opcode| format!("{opcode:#04X}")))
            .finish()
    }
}
