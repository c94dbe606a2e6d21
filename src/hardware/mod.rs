//! Instruments and the drivers behind them.

pub mod capabilities;
pub mod instrument;
pub mod registry;
pub mod tdk_lambda;
pub mod virtual_psu;

pub use capabilities::{
    ConnectionTestable, Openable, PowerSupply, PowerSupplyMode, VoltageCurrentControllable,
};
pub use instrument::{DeviceType, Instrument, InstrumentKind, InstrumentSet};
pub use registry::DriverRegistry;
