//! Physical side of a serial connection.
//!
//! The arbiter worker is the only code that ever touches a [`SerialTransport`].
//! Transports are produced by a [`PortOpener`]; the daemon uses
//! [`SystemPortOpener`] (backed by the `serialport` crate) while tests inject an
//! opener that simulates the wire.

use crate::error::{AppResult, LabError};
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;

/// Blocking byte-level access to an open port.
pub trait SerialTransport: Send {
    /// Write the full payload and flush it to the device.
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Read up to and including the next `\n`.
    ///
    /// Must fail with [`io::ErrorKind::TimedOut`] when no complete line arrives
    /// within the port's read timeout.
    fn read_line(&mut self) -> io::Result<Vec<u8>>;

    /// Drop whatever the device has sent that nobody read yet, such as the
    /// late answer to a query that already timed out.
    fn discard_input(&mut self) -> io::Result<()>;
}

/// Opens transports for the port registry.
pub trait PortOpener: Send + Sync {
    /// Open `settings.path` exclusively.
    fn open(&self, settings: &SerialSettings) -> AppResult<Box<dyn SerialTransport>>;
}

/// Parity bit setting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Connection parameters, fixed for the lifetime of a port worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Port path (e.g. "/dev/ttyUSB0", "COM3")
    pub path: String,
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Software (XON/XOFF) flow control
    #[serde(default)]
    pub xonxoff: bool,
    /// Deadline for one response line
    #[serde(with = "humantime_serde", default = "default_read_timeout")]
    pub read_timeout: Duration,
    /// Line-turnaround pause after every write
    #[serde(with = "humantime_serde", default)]
    pub settle: Duration,
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(1)
}

impl SerialSettings {
    /// 8N1, no flow control, 1 s read timeout, no settle delay.
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            data_bits: default_data_bits(),
            parity: Parity::None,
            stop_bits: default_stop_bits(),
            xonxoff: false,
            read_timeout: default_read_timeout(),
            settle: Duration::ZERO,
        }
    }

    pub fn with_xonxoff(mut self, enabled: bool) -> Self {
        self.xonxoff = enabled;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }
}

/// Opens real serial ports through the `serialport` crate.
///
/// On Unix the port is opened in exclusive mode, so a second process (or a
/// second worker) fails to open it instead of interleaving traffic.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPortOpener;

impl PortOpener for SystemPortOpener {
    fn open(&self, settings: &SerialSettings) -> AppResult<Box<dyn SerialTransport>> {
        #[cfg(feature = "instrument_serial")]
        {
            system::open(settings)
        }
        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = settings;
            Err(LabError::FeatureNotEnabled("instrument_serial".into()))
        }
    }
}

#[cfg(feature = "instrument_serial")]
mod system {
    use super::*;
    use std::io::{Read, Write};
    use std::time::Instant;

    struct SystemSerial {
        port: Box<dyn serialport::SerialPort>,
        read_timeout: Duration,
    }

    pub(super) fn open(settings: &SerialSettings) -> AppResult<Box<dyn SerialTransport>> {
        let data_bits = match settings.data_bits {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            8 => serialport::DataBits::Eight,
            other => {
                return Err(LabError::Configuration(format!(
                    "unsupported data bits: {other}"
                )))
            }
        };
        let stop_bits = match settings.stop_bits {
            1 => serialport::StopBits::One,
            2 => serialport::StopBits::Two,
            other => {
                return Err(LabError::Configuration(format!(
                    "unsupported stop bits: {other}"
                )))
            }
        };
        let parity = match settings.parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        };
        let flow_control = if settings.xonxoff {
            serialport::FlowControl::Software
        } else {
            serialport::FlowControl::None
        };

        let port = serialport::new(&settings.path, settings.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(flow_control)
            .timeout(settings.read_timeout)
            .open()
            .map_err(|e| {
                LabError::Connectivity(format!("failed to open {}: {}", settings.path, e))
            })?;

        Ok(Box::new(SystemSerial {
            port,
            read_timeout: settings.read_timeout,
        }))
    }

    impl SerialTransport for SystemSerial {
        fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
            self.port.write_all(bytes)?;
            self.port.flush()
        }

        fn read_line(&mut self) -> io::Result<Vec<u8>> {
            let deadline = Instant::now() + self.read_timeout;
            let mut line = Vec::new();
            let mut byte = [0u8; 1];

            loop {
                if Instant::now() > deadline {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no response line within {:?}", self.read_timeout),
                    ));
                }

                match self.port.read(&mut byte) {
                    Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                    Ok(_) => {
                        line.push(byte[0]);
                        if byte[0] == b'\n' {
                            return Ok(line);
                        }
                    }
                    // Port timeout is at most our overall deadline
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                    Err(e) => return Err(e),
                }
            }
        }

        fn discard_input(&mut self) -> io::Result<()> {
            self.port
                .clear(serialport::ClearBuffer::Input)
                .map_err(io::Error::from)
        }
    }
}
