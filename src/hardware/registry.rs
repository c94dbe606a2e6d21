//! Driver Registry
//!
//! Maps the `driver` string of a configured device to a factory that builds the
//! instrument. The registry is an ordinary value created at startup and handed
//! to configuration validation and to the daemon, so unknown drivers are caught
//! before any instrument is constructed.
//!
//! # Built-in Drivers
//!
//! | Driver | Type | Arguments |
//! |--------|------|-----------|
//! | `virtual.power_supply` | power_supply | `load_in_ohms` |
//! | `virtual.broken_power_supply` | power_supply | `load_in_ohms` |
//! | `tdklambda.zup` | power_supply | `port`, `baudrate`, `address`, `settle_ms`, `timeout_ms` |
//!
//! # Example Usage
//!
//! ```rust,ignore
//! let mut drivers = DriverRegistry::builtin();
//! drivers.register("acme.psu", DeviceType::PowerSupply, |device, _ports| {
//!     Ok(Instrument::power_supply(&device.name, Arc::new(VirtualPowerSupply::new(1.0))))
//! });
//! let instruments = drivers.create_all(&config.devices, &PortRegistry::system())?;
//! ```

use super::instrument::{DeviceType, Instrument, InstrumentSet};
use super::tdk_lambda::{ZupArgs, ZupPowerSupply};
use super::virtual_psu::{BrokenPowerSupply, VirtualPowerSupply, VirtualPowerSupplyArgs};
use crate::config::DeviceDefinition;
use crate::error::{AppResult, LabError};
use crate::serial::PortRegistry;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Builds one instrument from its configuration entry.
pub type DriverFactory =
    Arc<dyn Fn(&DeviceDefinition, &PortRegistry) -> AppResult<Instrument> + Send + Sync>;

#[derive(Clone)]
struct DriverEntry {
    device_type: DeviceType,
    factory: DriverFactory,
}

/// Driver identifier → factory.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, DriverEntry>,
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.driver_ids())
            .finish()
    }
}

impl DriverRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every driver shipped in this crate.
    pub fn builtin() -> Self {
        let mut registry = Self::new();

        registry.register(
            "virtual.power_supply",
            DeviceType::PowerSupply,
            |device, _ports| {
                let args: VirtualPowerSupplyArgs = parse_args(device)?;
                let supply = VirtualPowerSupply::from_args(args)?;
                Ok(Instrument::power_supply(&device.name, Arc::new(supply)))
            },
        );

        registry.register(
            "virtual.broken_power_supply",
            DeviceType::PowerSupply,
            |device, _ports| {
                let args: VirtualPowerSupplyArgs = parse_args(device)?;
                let supply = BrokenPowerSupply::new(args.load_in_ohms);
                Ok(Instrument::power_supply(&device.name, Arc::new(supply)))
            },
        );

        registry.register("tdklambda.zup", DeviceType::PowerSupply, |device, ports| {
            let args: ZupArgs = parse_args(device)?;
            let supply = ZupPowerSupply::new(&args, ports.clone())?;
            Ok(Instrument::power_supply(&device.name, Arc::new(supply)))
        });

        registry
    }

    /// Add or replace a driver.
    pub fn register<F>(&mut self, id: impl Into<String>, device_type: DeviceType, factory: F)
    where
        F: Fn(&DeviceDefinition, &PortRegistry) -> AppResult<Instrument> + Send + Sync + 'static,
    {
        self.drivers.insert(
            id.into(),
            DriverEntry {
                device_type,
                factory: Arc::new(factory),
            },
        );
    }

    /// Capability type a driver provides, `None` if unknown.
    pub fn device_type(&self, id: &str) -> Option<DeviceType> {
        self.drivers.get(id).map(|entry| entry.device_type)
    }

    pub fn driver_ids(&self) -> Vec<&str> {
        let mut ids: Vec<_> = self.drivers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Build a single instrument.
    pub fn create(&self, device: &DeviceDefinition, ports: &PortRegistry) -> AppResult<Instrument> {
        let entry = self.drivers.get(&device.driver).ok_or_else(|| {
            LabError::Configuration(format!(
                "Device '{}' uses unknown driver '{}'",
                device.name, device.driver
            ))
        })?;
        debug!(device = %device.name, driver = %device.driver, "creating instrument");
        (entry.factory)(device, ports)
    }

    /// Build every configured instrument, preserving order.
    pub fn create_all(
        &self,
        devices: &[DeviceDefinition],
        ports: &PortRegistry,
    ) -> AppResult<InstrumentSet> {
        devices
            .iter()
            .map(|device| self.create(device, ports))
            .collect::<AppResult<Vec<_>>>()
            .map(InstrumentSet::new)
    }
}

/// Deserialize a device's `args` map into the driver's argument struct.
pub fn parse_args<T: DeserializeOwned>(device: &DeviceDefinition) -> AppResult<T> {
    serde_json::from_value(serde_json::Value::Object(device.args.clone())).map_err(|e| {
        LabError::Configuration(format!(
            "invalid args for device '{}' ({}): {}",
            device.name, device.driver, e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn device(name: &str, driver: &str, args: serde_json::Value) -> DeviceDefinition {
        DeviceDefinition {
            name: name.into(),
            device_type: DeviceType::PowerSupply,
            driver: driver.into(),
            args: args.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn builtin_drivers_are_known() {
        let drivers = DriverRegistry::builtin();
        assert_eq!(
            drivers.driver_ids(),
            ["tdklambda.zup", "virtual.broken_power_supply", "virtual.power_supply"]
        );
        assert_eq!(
            drivers.device_type("tdklambda.zup"),
            Some(DeviceType::PowerSupply)
        );
        assert_eq!(drivers.device_type("nope"), None);
    }

    #[test]
    fn creates_instruments_in_order() {
        let drivers = DriverRegistry::builtin();
        let devices = vec![
            device("b", "virtual.power_supply", json!({"load_in_ohms": 5})),
            device("a", "virtual.broken_power_supply", json!({})),
        ];
        let set = drivers.create_all(&devices, &PortRegistry::system()).unwrap();
        let names: Vec<_> = set.iter().map(Instrument::name).collect();
        assert_eq!(names, ["b", "a"]);
    }

    #[test]
    fn zup_does_not_touch_the_port_until_opened() {
        let drivers = DriverRegistry::builtin();
        let ports = PortRegistry::system();
        let zup = device(
            "zup",
            "tdklambda.zup",
            json!({"port": "/dev/labd-missing", "baudrate": 9600}),
        );
        drivers.create(&zup, &ports).unwrap();
        assert!(ports.is_empty());
    }

    #[test]
    fn bad_args_are_configuration_errors() {
        let drivers = DriverRegistry::builtin();
        let zup = device("zup", "tdklambda.zup", json!({"baudrate": "fast"}));
        let err = drivers.create(&zup, &PortRegistry::system()).unwrap_err();
        assert_eq!(err.kind(), "ConfigurationError");
        assert!(err.to_string().contains("zup"));
    }
}
