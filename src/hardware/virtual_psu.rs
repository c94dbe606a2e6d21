//! Simulated Power Supplies
//!
//! In-memory power supplies for running the daemon without hardware. They
//! never touch the port arbiter.
//!
//! # Available Simulations
//!
//! - `VirtualPowerSupply` - ideal supply driving a resistive load
//! - `BrokenPowerSupply` - opens fine but never passes a connection test
//!
//! # Load Model
//!
//! With the output on, the supply regulates whichever limit is hit first:
//! `I = min(V_target / R, I_target)` and `V = I * R`. When the measured voltage
//! equals the target the supply reports constant-voltage mode, otherwise
//! constant-current.

use super::capabilities::{
    ConnectionTestable, Openable, PowerSupplyMode, VoltageCurrentControllable,
};
use crate::error::{AppResult, LabError};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, Default)]
struct SupplyState {
    output_on: bool,
    target_voltage: f64,
    target_current: f64,
}

/// Arguments accepted by the `virtual.power_supply` driver.
#[derive(Debug, Clone, Deserialize)]
pub struct VirtualPowerSupplyArgs {
    /// Resistance seen at the output terminals
    #[serde(default = "default_load")]
    pub load_in_ohms: f64,
}

fn default_load() -> f64 {
    10.0
}

/// Ideal power supply with a resistive load.
///
/// # Example
///
/// ```rust,ignore
/// let psu = VirtualPowerSupply::new(5.0);
/// psu.set_target_voltage(8.0).await?;
/// psu.set_target_current(3.0).await?;
/// psu.set_output_on(true).await?;
/// assert_eq!(psu.get_actual_current().await?, 1.6);
/// ```
#[derive(Debug, Clone)]
pub struct VirtualPowerSupply {
    load_in_ohms: f64,
    state: Arc<RwLock<SupplyState>>,
}

impl VirtualPowerSupply {
    /// New supply, output off and both targets at zero.
    pub fn new(load_in_ohms: f64) -> Self {
        Self {
            load_in_ohms,
            state: Arc::new(RwLock::new(SupplyState::default())),
        }
    }

    pub fn from_args(args: VirtualPowerSupplyArgs) -> AppResult<Self> {
        if !(args.load_in_ohms.is_finite() && args.load_in_ohms > 0.0) {
            return Err(LabError::Configuration(format!(
                "load_in_ohms must be a positive number, got {}",
                args.load_in_ohms
            )));
        }
        Ok(Self::new(args.load_in_ohms))
    }

    pub fn load_in_ohms(&self) -> f64 {
        self.load_in_ohms
    }

    fn output_current(&self, state: &SupplyState) -> f64 {
        if !state.output_on {
            return 0.0;
        }
        (state.target_voltage / self.load_in_ohms).min(state.target_current)
    }
}

#[async_trait]
impl Openable for VirtualPowerSupply {
    async fn open(&self) -> AppResult<()> {
        Ok(())
    }

    async fn close(&self) -> AppResult<()> {
        Ok(())
    }
}

#[async_trait]
impl ConnectionTestable for VirtualPowerSupply {
    async fn test_connection(&self) -> AppResult<()> {
        Ok(())
    }
}

#[async_trait]
impl VoltageCurrentControllable for VirtualPowerSupply {
    async fn get_mode(&self) -> AppResult<PowerSupplyMode> {
        let state = *self.state.read().await;
        let actual = self.output_current(&state) * self.load_in_ohms;
        if is_close(actual, state.target_voltage) {
            Ok(PowerSupplyMode::ConstantVoltage)
        } else {
            Ok(PowerSupplyMode::ConstantCurrent)
        }
    }

    async fn is_output_on(&self) -> AppResult<bool> {
        Ok(self.state.read().await.output_on)
    }

    async fn set_output_on(&self, on: bool) -> AppResult<()> {
        self.state.write().await.output_on = on;
        Ok(())
    }

    async fn get_target_voltage(&self) -> AppResult<f64> {
        Ok(self.state.read().await.target_voltage)
    }

    async fn get_actual_voltage(&self) -> AppResult<f64> {
        let state = *self.state.read().await;
        Ok(self.output_current(&state) * self.load_in_ohms)
    }

    async fn set_target_voltage(&self, volts: f64) -> AppResult<()> {
        self.state.write().await.target_voltage = volts;
        Ok(())
    }

    async fn get_target_current(&self) -> AppResult<f64> {
        Ok(self.state.read().await.target_current)
    }

    async fn get_actual_current(&self) -> AppResult<f64> {
        let state = *self.state.read().await;
        Ok(self.output_current(&state))
    }

    async fn set_target_current(&self, amps: f64) -> AppResult<()> {
        self.state.write().await.target_current = amps;
        Ok(())
    }
}

/// Relative tolerance comparison, exact at zero.
fn is_close(a: f64, b: f64) -> bool {
    a == b || (a - b).abs() <= 1e-9 * a.abs().max(b.abs())
}

/// Simulated supply that is always unreachable.
///
/// Everything except `test_connection` behaves like [`VirtualPowerSupply`].
#[derive(Debug, Clone)]
pub struct BrokenPowerSupply {
    inner: VirtualPowerSupply,
}

impl BrokenPowerSupply {
    pub fn new(load_in_ohms: f64) -> Self {
        Self {
            inner: VirtualPowerSupply::new(load_in_ohms),
        }
    }
}

#[async_trait]
impl Openable for BrokenPowerSupply {
    async fn open(&self) -> AppResult<()> {
        self.inner.open().await
    }

    async fn close(&self) -> AppResult<()> {
        self.inner.close().await
    }
}

#[async_trait]
impl ConnectionTestable for BrokenPowerSupply {
    async fn test_connection(&self) -> AppResult<()> {
        Err(LabError::Unavailable("Unavailable device".into()))
    }
}

#[async_trait]
impl VoltageCurrentControllable for BrokenPowerSupply {
    async fn get_mode(&self) -> AppResult<PowerSupplyMode> {
        self.inner.get_mode().await
    }

    async fn is_output_on(&self) -> AppResult<bool> {
        self.inner.is_output_on().await
    }

    async fn set_output_on(&self, on: bool) -> AppResult<()> {
        self.inner.set_output_on(on).await
    }

    async fn get_target_voltage(&self) -> AppResult<f64> {
        self.inner.get_target_voltage().await
    }

    async fn get_actual_voltage(&self) -> AppResult<f64> {
        self.inner.get_actual_voltage().await
    }

    async fn set_target_voltage(&self, volts: f64) -> AppResult<()> {
        self.inner.set_target_voltage(volts).await
    }

    async fn get_target_current(&self) -> AppResult<f64> {
        self.inner.get_target_current().await
    }

    async fn get_actual_current(&self) -> AppResult<f64> {
        self.inner.get_actual_current().await
    }

    async fn set_target_current(&self, amps: f64) -> AppResult<()> {
        self.inner.set_target_current(amps).await
    }
}
