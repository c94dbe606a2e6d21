//! TDK-Lambda ZUP Power Supply Driver
//!
//! The ZUP speaks a short ASCII command set over RS-232/RS-485. Several supplies
//! can share one bus and a unit only listens after `:ADRnn;` has addressed it.
//! The driver's arbiter handle carries that selector, so the worker re-addresses
//! the bus inside the same job whenever another unit spoke last. Concurrent
//! callers on the same bus therefore never interleave commands or read another
//! unit's reply.
//!
//! `open` and `close` are counted: the port binding is released only by the
//! `close` matching the first `open`, so a status request probing the supply
//! does not pull it away from a running experiment.
//!
//! ## Protocol Reference
//!
//! | Command   | Reply       | Meaning                    |
//! |-----------|-------------|----------------------------|
//! | `:MDL?;`  | model text  | identification             |
//! | `:REV?;`  | version     | firmware revision          |
//! | `:STA?;`  | `OSxx...`   | status, 3rd char = mode    |
//! | `:OUT?;`  | `OT1`/`OT0` | output state               |
//! | `:VOL!;`  | `SV08.000`  | programmed voltage         |
//! | `:VOL?;`  | `AV07.998`  | measured voltage           |
//! | `:CUR!;`  | `SA1.500`   | programmed current         |
//! | `:CUR?;`  | `AA0.321`   | measured current           |
//! | `:VOLx;`  | none        | set voltage (`%.3f`)       |
//! | `:CURx;`  | none        | set current (`%06.2f`)     |
//!
//! Replies are terminated by `\r\n`. The unit needs ~50 ms after every write
//! before it accepts the next command.

use super::capabilities::{
    ConnectionTestable, Openable, PowerSupplyMode, VoltageCurrentControllable,
};
use crate::error::{AppResult, LabError};
use crate::serial::{ArbiterHandle, PortRegistry, SerialSettings};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

static TARGET_VOLTAGE: Lazy<Regex> = Lazy::new(|| reply_pattern("SV"));
static ACTUAL_VOLTAGE: Lazy<Regex> = Lazy::new(|| reply_pattern("AV"));
static TARGET_CURRENT: Lazy<Regex> = Lazy::new(|| reply_pattern("SA"));
static ACTUAL_CURRENT: Lazy<Regex> = Lazy::new(|| reply_pattern("AA"));

#[allow(clippy::expect_used)]
fn reply_pattern(prefix: &str) -> Regex {
    Regex::new(&format!(r"^{prefix}([0-9]+\.[0-9]+)$")).expect("reply pattern is valid")
}

/// Arguments accepted by the `tdklambda.zup` driver.
#[derive(Debug, Clone, Deserialize)]
pub struct ZupArgs {
    pub port: String,
    pub baudrate: u32,
    #[serde(default = "default_address")]
    pub address: u8,
    /// Pause after each write
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_address() -> u8 {
    1
}

fn default_settle_ms() -> u64 {
    50
}

fn default_timeout_ms() -> u64 {
    2000
}

impl ZupArgs {
    /// XON/XOFF, 8N1.
    pub fn serial_settings(&self) -> SerialSettings {
        SerialSettings::new(self.port.clone(), self.baudrate)
            .with_xonxoff(true)
            .with_read_timeout(Duration::from_millis(self.timeout_ms))
            .with_settle(Duration::from_millis(self.settle_ms))
    }
}

/// TDK-Lambda ZUP series power supply.
pub struct ZupPowerSupply {
    settings: SerialSettings,
    address: u8,
    ports: PortRegistry,
    session: Mutex<Session>,
}

#[derive(Default)]
struct Session {
    handle: Option<ArbiterHandle>,
    /// `open` calls not yet matched by a `close`
    opens: usize,
}

impl std::fmt::Debug for ZupPowerSupply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZupPowerSupply")
            .field("port", &self.settings.path)
            .field("address", &self.address)
            .finish()
    }
}

impl ZupPowerSupply {
    pub fn new(args: &ZupArgs, ports: PortRegistry) -> AppResult<Self> {
        if args.address > 99 {
            return Err(LabError::Configuration(format!(
                "ZUP address must be 0-99, got {}",
                args.address
            )));
        }
        Ok(Self {
            settings: args.serial_settings(),
            address: args.address,
            ports,
            session: Mutex::new(Session::default()),
        })
    }

    /// Outstanding `open` calls.
    pub async fn open_count(&self) -> usize {
        self.session.lock().await.opens
    }

    fn selector(&self) -> String {
        format!(":ADR{:02};", self.address)
    }

    /// Model identification string.
    pub async fn model(&self) -> AppResult<String> {
        self.query(":MDL?;").await
    }

    pub async fn software_version(&self) -> AppResult<String> {
        self.query(":REV?;").await
    }

    async fn write(&self, command: &str) -> AppResult<()> {
        let session = self.session.lock().await;
        let handle = session.handle.as_ref().ok_or_else(|| self.not_open())?;
        handle.write(command).await
    }

    async fn query(&self, command: &str) -> AppResult<String> {
        let session = self.session.lock().await;
        let handle = session.handle.as_ref().ok_or_else(|| self.not_open())?;
        let reply = handle.query(command).await?;
        debug!(port = %self.settings.path, command, reply = %reply, "zup exchange");
        Ok(reply)
    }

    async fn query_number(&self, command: &str, pattern: &Regex) -> AppResult<f64> {
        let reply = self.query(command).await?;
        parse_reading(pattern, &reply)
    }

    fn not_open(&self) -> LabError {
        LabError::Connectivity(format!(
            "ZUP on {} (address {}) is not open",
            self.settings.path, self.address
        ))
    }
}

fn parse_reading(pattern: &Regex, reply: &str) -> AppResult<f64> {
    pattern
        .captures(reply)
        .and_then(|caps| caps.get(1))
        .and_then(|value| value.as_str().parse().ok())
        .ok_or_else(|| LabError::ProtocolParse(format!("Could not parse response: {reply}")))
}

fn parse_mode(reply: &str) -> AppResult<PowerSupplyMode> {
    match reply.as_bytes().get(2) {
        Some(b'0') => Ok(PowerSupplyMode::ConstantVoltage),
        Some(b'1') => Ok(PowerSupplyMode::ConstantCurrent),
        _ => Err(LabError::ProtocolParse(format!(
            "Could not parse status register: {reply}"
        ))),
    }
}

#[async_trait]
impl Openable for ZupPowerSupply {
    async fn open(&self) -> AppResult<()> {
        let mut session = self.session.lock().await;
        if session.handle.is_some() {
            session.opens += 1;
            return Ok(());
        }
        let handle = self
            .ports
            .acquire_or_create(&self.settings)?
            .with_selector(self.selector());
        if let Err(err) = handle.select().await {
            warn!(port = %self.settings.path, error = %err, "address selection failed");
            let _ = handle.release().await;
            return Err(err);
        }
        session.handle = Some(handle);
        session.opens = 1;
        Ok(())
    }

    async fn close(&self) -> AppResult<()> {
        let mut session = self.session.lock().await;
        match session.opens {
            0 => Ok(()),
            1 => {
                session.opens = 0;
                match session.handle.take() {
                    Some(handle) => handle.release().await,
                    None => Ok(()),
                }
            }
            _ => {
                session.opens -= 1;
                debug!(
                    port = %self.settings.path,
                    address = self.address,
                    opens = session.opens,
                    "zup still in use"
                );
                Ok(())
            }
        }
    }
}

#[async_trait]
impl ConnectionTestable for ZupPowerSupply {
    async fn test_connection(&self) -> AppResult<()> {
        match self.model().await {
            Ok(model) if !model.trim().is_empty() => Ok(()),
            Ok(_) => Err(LabError::Connectivity(format!(
                "ZUP on {} returned an empty model",
                self.settings.path
            ))),
            Err(err @ LabError::Connectivity(_)) => Err(err),
            Err(err) => Err(LabError::Connectivity(err.to_string())),
        }
    }
}

#[async_trait]
impl VoltageCurrentControllable for ZupPowerSupply {
    async fn get_mode(&self) -> AppResult<PowerSupplyMode> {
        let reply = self.query(":STA?;").await?;
        parse_mode(&reply)
    }

    async fn is_output_on(&self) -> AppResult<bool> {
        Ok(self.query(":OUT?;").await? == "OT1")
    }

    async fn set_output_on(&self, on: bool) -> AppResult<()> {
        self.write(if on { ":OUT1;" } else { ":OUT0;" }).await
    }

    async fn get_target_voltage(&self) -> AppResult<f64> {
        self.query_number(":VOL!;", &TARGET_VOLTAGE).await
    }

    async fn get_actual_voltage(&self) -> AppResult<f64> {
        self.query_number(":VOL?;", &ACTUAL_VOLTAGE).await
    }

    async fn set_target_voltage(&self, volts: f64) -> AppResult<()> {
        self.write(&format!(":VOL{volts:.3};")).await
    }

    async fn get_target_current(&self) -> AppResult<f64> {
        self.query_number(":CUR!;", &TARGET_CURRENT).await
    }

    async fn get_actual_current(&self) -> AppResult<f64> {
        self.query_number(":CUR?;", &ACTUAL_CURRENT).await
    }

    async fn set_target_current(&self, amps: f64) -> AppResult<()> {
        self.write(&format!(":CUR{amps:06.2};")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_readings() {
        assert_eq!(parse_reading(&TARGET_VOLTAGE, "SV08.000").unwrap(), 8.0);
        assert_eq!(parse_reading(&ACTUAL_CURRENT, "AA1.234").unwrap(), 1.234);
    }

    #[test]
    fn rejects_wrong_prefix_and_trailing_noise() {
        for reply in ["AV08.000", "SV08", "SV08.000x", " SV08.000", ""] {
            let err = parse_reading(&TARGET_VOLTAGE, reply).unwrap_err();
            assert_eq!(err.kind(), "ProtocolParseError", "reply {reply:?}");
        }
    }

    #[test]
    fn mode_comes_from_third_character() {
        assert_eq!(parse_mode("OS00000000").unwrap(), PowerSupplyMode::ConstantVoltage);
        assert_eq!(parse_mode("OS10000000").unwrap(), PowerSupplyMode::ConstantCurrent);
        assert!(parse_mode("OS").is_err());
        assert!(parse_mode("OS7").is_err());
    }

    #[test]
    fn setter_formats() {
        assert_eq!(format!(":VOL{:.3};", 4.25_f64), ":VOL4.250;");
        assert_eq!(format!(":CUR{:06.2};", 1.5_f64), ":CUR001.50;");
    }

    #[test]
    fn address_out_of_range_is_rejected() {
        let args = ZupArgs {
            port: "/dev/null".into(),
            baudrate: 9600,
            address: 120,
            settle_ms: 0,
            timeout_ms: 100,
        };
        let err = ZupPowerSupply::new(&args, PortRegistry::system()).unwrap_err();
        assert_eq!(err.kind(), "ConfigurationError");
    }
}
