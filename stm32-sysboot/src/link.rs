//! Serial byte link and the RESET/BOOT0 modem-control plumbing.

use std::io::{Read, Write};
use std::time::Duration;

use log::{info, trace};

use crate::{Error, DEFAULT_BAUDRATE, DEFAULT_TIMEOUT_MS};

#[cfg(test)]
use mockall::automock;

/// Wire parity. STM32 bootloaders use even parity, BlueNRG-1/2 use none.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Parity {
    Even,
    None,
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::Even => serialport::Parity::Even,
            Parity::None => serialport::Parity::None,
        }
    }
}

impl std::str::FromStr for Parity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "even" | "EVEN" => Ok(Self::Even),
            "none" | "NONE" => Ok(Self::None),
            _ => Err(Error::InvalidArgument("parity must be `even` or `none`")),
        }
    }
}

/// Serial link configuration. Fixed once the port is opened.
///
/// RESET rides on DTR and BOOT0 on RTS unless `swap_rts_dtr` exchanges them.
/// Polarity flags describe the board wiring; callers of [`ByteLink`] always
/// work in logical active/inactive terms.
#[derive(Clone, Debug)]
pub struct LinkConfig {
    pub port: String,
    pub baud_rate: u32,
    pub parity: Parity,
    /// RESET pin is wired active-high (default is active-low)
    pub reset_active_high: bool,
    /// BOOT0 pin is wired active-low (default is active-high)
    pub boot0_active_low: bool,
    /// Exchange which modem-control line drives which pin
    pub swap_rts_dtr: bool,
    /// Deadline for a single exact read
    pub timeout: Duration,
}

impl LinkConfig {
    pub fn with_port(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: DEFAULT_BAUDRATE,
            parity: Parity::Even,
            reset_active_high: false,
            boot0_active_low: false,
            swap_rts_dtr: false,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }

    pub fn and_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn and_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    pub fn and_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn and_reset_active_high(mut self, active_high: bool) -> Self {
        self.reset_active_high = active_high;
        self
    }

    pub fn and_boot0_active_low(mut self, active_low: bool) -> Self {
        self.boot0_active_low = active_low;
        self
    }

    pub fn and_swap_rts_dtr(mut self, swap: bool) -> Self {
        self.swap_rts_dtr = swap;
        self
    }
}

/// Transport the protocol engine drives.
///
/// Implementations own polarity and line assignment, so `set_reset(true)`
/// always means "hold the target in reset" and `set_boot0(true)` always
/// means "request a system-memory boot", whatever the wiring.
#[cfg_attr(test, automock)]
pub trait ByteLink {
    /// Read exactly `buf.len()` bytes. A read that starves past the
    /// configured deadline fails with [`Error::Timeout`]; partial data is
    /// discarded, never returned.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Error>;

    /// Write the whole slice.
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), Error>;

    /// Discard pending input, e.g. line noise picked up during a reset.
    fn flush_input(&mut self) -> Result<(), Error>;

    /// Drive the logical RESET line.
    fn set_reset(&mut self, active: bool) -> Result<(), Error>;

    /// Drive the logical BOOT0 line.
    fn set_boot0(&mut self, active: bool) -> Result<(), Error>;
}

/// Physical line level for a logical pin state, given the pin's polarity.
fn line_level(active: bool, active_high: bool) -> bool {
    if active_high {
        active
    } else {
        !active
    }
}

/// [`ByteLink`] over a real serial port.
pub struct SerialLink {
    port: Box<dyn serialport::SerialPort>,
    config: LinkConfig,
}

impl SerialLink {
    /// Open and configure the port: 8 data bits, 1 stop bit, no flow
    /// control, parity and timeout from the configuration. The port is
    /// closed again when the link is dropped, on error paths included.
    pub fn open(config: LinkConfig) -> Result<Self, Error> {
        info!(
            "opening serial port: {} {} 8{}1",
            config.port,
            config.baud_rate,
            match config.parity {
                Parity::Even => 'E',
                Parity::None => 'N',
            }
        );
        let port = serialport::new(config.port.as_str(), config.baud_rate)
            .parity(config.parity.into())
            .stop_bits(serialport::StopBits::One)
            .data_bits(serialport::DataBits::Eight)
            .flow_control(serialport::FlowControl::None)
            .timeout(config.timeout)
            .open()?;
        Ok(Self { port, config })
    }

    fn write_reset_line(&mut self, level: bool) -> Result<(), Error> {
        if self.config.swap_rts_dtr {
            self.port.write_request_to_send(level)?;
        } else {
            self.port.write_data_terminal_ready(level)?;
        }
        Ok(())
    }

    fn write_boot0_line(&mut self, level: bool) -> Result<(), Error> {
        if self.config.swap_rts_dtr {
            self.port.write_data_terminal_ready(level)?;
        } else {
            self.port.write_request_to_send(level)?;
        }
        Ok(())
    }
}

impl ByteLink for SerialLink {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        self.port.read_exact(buf)?;
        trace!("read {} bytes: {:02X?}", buf.len(), buf);
        Ok(())
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), Error> {
        trace!("writing {} bytes: {:02X?}", bytes.len(), bytes);
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }

    fn flush_input(&mut self) -> Result<(), Error> {
        self.port.clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }

    fn set_reset(&mut self, active: bool) -> Result<(), Error> {
        let level = line_level(active, self.config.reset_active_high);
        trace!("RESET {} (line level {})", active, level);
        self.write_reset_line(level)
    }

    fn set_boot0(&mut self, active: bool) -> Result<(), Error> {
        let level = line_level(active, !self.config.boot0_active_low);
        trace!("BOOT0 {} (line level {})", active, level);
        self.write_boot0_line(level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_level_follows_polarity() {
        // active-low RESET: asserting drives the line low
        assert!(!line_level(true, false));
        assert!(line_level(false, false));
        // active-high BOOT0: asserting drives the line high
        assert!(line_level(true, true));
        assert!(!line_level(false, true));
    }

    #[test]
    fn config_defaults_match_the_usual_wiring() {
        let config = LinkConfig::with_port("/dev/ttyUSB0");
        assert_eq!(DEFAULT_BAUDRATE, config.baud_rate);
        assert_eq!(Parity::Even, config.parity);
        assert!(!config.reset_active_high);
        assert!(!config.boot0_active_low);
        assert!(!config.swap_rts_dtr);
        assert_eq!(Duration::from_secs(5), config.timeout);
    }

    #[test]
    fn parity_parses_cli_spellings() {
        assert_eq!(Parity::Even, "even".parse().unwrap());
        assert_eq!(Parity::None, "none".parse().unwrap());
        assert!("odd".parse::<Parity>().is_err());
    }
}
