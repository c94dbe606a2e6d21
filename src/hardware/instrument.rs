//! Named, capability-typed instrument handles.

use super::capabilities::PowerSupply;
use crate::error::{AppResult, LabError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Capability type tag, as written in configuration and reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    PowerSupply,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::PowerSupply => write!(f, "power_supply"),
        }
    }
}

/// The capability set an instrument exposes.
#[derive(Clone)]
pub enum InstrumentKind {
    PowerSupply(Arc<dyn PowerSupply>),
}

/// A configured instrument.
///
/// Cloning is cheap and shares the underlying driver.
#[derive(Clone)]
pub struct Instrument {
    name: String,
    kind: InstrumentKind,
}

impl fmt::Debug for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instrument")
            .field("name", &self.name)
            .field("device_type", &self.device_type())
            .finish()
    }
}

impl Instrument {
    pub fn power_supply(name: impl Into<String>, driver: Arc<dyn PowerSupply>) -> Self {
        Self {
            name: name.into(),
            kind: InstrumentKind::PowerSupply(driver),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &InstrumentKind {
        &self.kind
    }

    pub fn device_type(&self) -> DeviceType {
        match self.kind {
            InstrumentKind::PowerSupply(_) => DeviceType::PowerSupply,
        }
    }

    pub fn as_power_supply(&self) -> Option<&Arc<dyn PowerSupply>> {
        match &self.kind {
            InstrumentKind::PowerSupply(supply) => Some(supply),
        }
    }

    pub async fn open(&self) -> AppResult<()> {
        match &self.kind {
            InstrumentKind::PowerSupply(supply) => supply.open().await,
        }
    }

    pub async fn close(&self) -> AppResult<()> {
        match &self.kind {
            InstrumentKind::PowerSupply(supply) => supply.close().await,
        }
    }

    pub async fn test_connection(&self) -> AppResult<()> {
        match &self.kind {
            InstrumentKind::PowerSupply(supply) => supply.test_connection().await,
        }
    }
}

/// The daemon's instruments, in configuration order.
#[derive(Debug, Clone, Default)]
pub struct InstrumentSet {
    instruments: Vec<Instrument>,
}

impl InstrumentSet {
    pub fn new(instruments: Vec<Instrument>) -> Self {
        Self { instruments }
    }

    pub fn get(&self, name: &str) -> Option<&Instrument> {
        self.instruments.iter().find(|i| i.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instrument> {
        self.instruments.iter()
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }

    /// Look up `name` and require it to be a power supply.
    pub fn power_supply(&self, name: &str) -> AppResult<Arc<dyn PowerSupply>> {
        let instrument = self
            .get(name)
            .ok_or_else(|| LabError::UnknownDevice(name.to_string()))?;
        instrument.as_power_supply().cloned().ok_or_else(|| {
            LabError::Configuration(format!(
                "device '{}' is a {}, not a power supply",
                name,
                instrument.device_type()
            ))
        })
    }
}
