//! Instrument Capabilities
//!
//! Narrow traits that drivers implement for the operations they support.
//! Code that uses an instrument depends on the capability, never on the
//! transport behind it: the simulated supply and the TDK-Lambda ZUP satisfy the
//! same traits, one in memory and one through the port arbiter.
//!
//! - Every instrument implements `Openable + ConnectionTestable`
//! - A power supply additionally implements `VoltageCurrentControllable`
//!
//! [`PowerSupply`] is implemented automatically for anything providing all three.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses [`AppResult`] so failures keep their kind on the wire
//! - Takes `&self`; drivers use interior mutability for state
//!
//! # Example
//!
//! ```rust,ignore
//! async fn ramp<P: PowerSupply + ?Sized>(supply: &P, volts: &[f64]) -> AppResult<()> {
//!     supply.open().await?;
//!     supply.set_output_on(true).await?;
//!     for v in volts {
//!         supply.set_target_voltage(*v).await?;
//!     }
//!     supply.close().await
//! }
//! ```

use crate::error::AppResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Regulation mode of a power supply output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PowerSupplyMode {
    ConstantVoltage,
    ConstantCurrent,
}

impl fmt::Display for PowerSupplyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerSupplyMode::ConstantVoltage => write!(f, "CONSTANT_VOLTAGE"),
            PowerSupplyMode::ConstantCurrent => write!(f, "CONSTANT_CURRENT"),
        }
    }
}

/// Capability: Connection Lifecycle
///
/// # Contract
/// - `open` binds whatever transport the instrument needs
/// - opens nest: each successful `open` is undone by exactly one `close`, and
///   only the last `close` releases the transport
/// - `close` without an outstanding `open` is a no-op, including when `open`
///   never ran or failed
#[async_trait]
pub trait Openable: Send + Sync {
    async fn open(&self) -> AppResult<()>;

    async fn close(&self) -> AppResult<()>;
}

/// Capability: Liveness Check
#[async_trait]
pub trait ConnectionTestable: Send + Sync {
    /// Cheap round-trip to the device.
    ///
    /// # Returns
    /// - Ok(()) if the device answered with a well-formed reply
    /// - Err(Connectivity) if it did not answer or the answer was unusable
    async fn test_connection(&self) -> AppResult<()>;
}

/// Capability: Voltage/Current Source
///
/// Each getter and setter corresponds to exactly one exchange with the device.
///
/// # Contract
/// - Voltages in volts, currents in amperes
/// - "target" values are the programmed set points
/// - "actual" values are measured at the output terminals
/// - Replies that do not match the device grammar are `ProtocolParse` errors
#[async_trait]
pub trait VoltageCurrentControllable: Send + Sync {
    async fn get_mode(&self) -> AppResult<PowerSupplyMode>;

    async fn is_output_on(&self) -> AppResult<bool>;

    async fn set_output_on(&self, on: bool) -> AppResult<()>;

    async fn get_target_voltage(&self) -> AppResult<f64>;

    async fn get_actual_voltage(&self) -> AppResult<f64>;

    async fn set_target_voltage(&self, volts: f64) -> AppResult<()>;

    async fn get_target_current(&self) -> AppResult<f64>;

    async fn get_actual_current(&self) -> AppResult<f64>;

    async fn set_target_current(&self, amps: f64) -> AppResult<()>;
}

/// A bench power supply: connection lifecycle plus voltage/current control.
pub trait PowerSupply: Openable + ConnectionTestable + VoltageCurrentControllable {}

impl<T> PowerSupply for T where T: Openable + ConnectionTestable + VoltageCurrentControllable {}
