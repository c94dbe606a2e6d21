//! Experiments shipped with the daemon.

use super::{Experiment, ExperimentContext};
use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

/// Parameters of `power_supply_monitor`.
#[derive(Debug, Clone, Deserialize)]
pub struct PowerSupplyMonitorParams {
    /// Configured name of the supply
    pub device: String,
    #[serde(default = "default_rate")]
    pub sampling_rate_hz: f64,
    pub duration_secs: f64,
    #[serde(default)]
    pub target_voltage: Option<f64>,
    #[serde(default)]
    pub target_current: Option<f64>,
    #[serde(default)]
    pub output_on: Option<bool>,
    /// Turn the output off at the end of the run
    #[serde(default)]
    pub switch_off_on_stop: bool,
}

fn default_rate() -> f64 {
    1.0
}

/// Records the measured voltage and current of one power supply.
///
/// Optionally programs the supply first, so a sequence of monitors doubles as
/// a simple set-point program.
#[derive(Debug, Clone)]
pub struct PowerSupplyMonitor {
    params: PowerSupplyMonitorParams,
    opened: bool,
}

impl PowerSupplyMonitor {
    pub const TYPE_ID: &'static str = "power_supply_monitor";

    pub fn new(params: PowerSupplyMonitorParams) -> Self {
        Self {
            params,
            opened: false,
        }
    }

    pub fn from_params(params: Option<&serde_json::Value>) -> anyhow::Result<Self> {
        let params = params.cloned().unwrap_or(serde_json::Value::Null);
        let params: PowerSupplyMonitorParams = serde_json::from_value(params)
            .context("power_supply_monitor needs at least `device` and `duration_secs`")?;
        Ok(Self::new(params))
    }
}

#[async_trait]
impl Experiment for PowerSupplyMonitor {
    fn sampling_rate_hz(&self) -> f64 {
        self.params.sampling_rate_hz
    }

    fn duration_secs(&self) -> f64 {
        self.params.duration_secs
    }

    fn fields(&self) -> Vec<String> {
        vec!["voltage".to_string(), "current".to_string()]
    }

    async fn start(&mut self, ctx: &ExperimentContext) -> anyhow::Result<()> {
        let supply = ctx.power_supply(&self.params.device)?;
        supply.open().await?;
        self.opened = true;

        if let Some(volts) = self.params.target_voltage {
            supply.set_target_voltage(volts).await?;
        }
        if let Some(amps) = self.params.target_current {
            supply.set_target_current(amps).await?;
        }
        if let Some(on) = self.params.output_on {
            supply.set_output_on(on).await?;
        }
        info!(device = %self.params.device, "power supply monitor started");
        Ok(())
    }

    async fn measure(&mut self, ctx: &ExperimentContext) -> anyhow::Result<Vec<f64>> {
        let supply = ctx.power_supply(&self.params.device)?;
        let voltage = supply.get_actual_voltage().await?;
        let current = supply.get_actual_current().await?;
        Ok(vec![voltage, current])
    }

    async fn stop(&mut self, ctx: &ExperimentContext) -> anyhow::Result<()> {
        // nothing to undo when start never got the supply open
        if !std::mem::take(&mut self.opened) {
            return Ok(());
        }
        let supply = ctx.power_supply(&self.params.device)?;
        let switched_off = if self.params.switch_off_on_stop {
            supply.set_output_on(false).await
        } else {
            Ok(())
        };
        supply.close().await?;
        switched_off?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::virtual_psu::VirtualPowerSupply;
    use crate::hardware::{Instrument, InstrumentSet, VoltageCurrentControllable};
    use serde_json::json;
    use std::sync::Arc;

    fn bench() -> (Arc<VirtualPowerSupply>, ExperimentContext) {
        let supply = Arc::new(VirtualPowerSupply::new(5.0));
        let set = InstrumentSet::new(vec![Instrument::power_supply("bench", supply.clone())]);
        (supply, ExperimentContext::new(set))
    }

    #[tokio::test]
    async fn programs_measures_and_switches_off() {
        let (supply, ctx) = bench();
        let params = json!({
            "device": "bench",
            "duration_secs": 1,
            "target_voltage": 8.0,
            "target_current": 3.0,
            "output_on": true,
            "switch_off_on_stop": true,
        });
        let mut monitor = PowerSupplyMonitor::from_params(Some(&params)).unwrap();

        monitor.start(&ctx).await.unwrap();
        let values = monitor.measure(&ctx).await.unwrap();
        assert_eq!(values.len(), monitor.fields().len());
        assert!((values[0] - 8.0).abs() < 1e-9);
        assert!((values[1] - 1.6).abs() < 1e-9);

        monitor.stop(&ctx).await.unwrap();
        assert!(!supply.is_output_on().await.unwrap());
    }

    #[tokio::test]
    async fn unknown_device_fails_start() {
        let (_supply, ctx) = bench();
        let params = json!({"device": "elsewhere", "duration_secs": 1});
        let mut monitor = PowerSupplyMonitor::from_params(Some(&params)).unwrap();
        let err = monitor.start(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("elsewhere"));
    }

    #[test]
    fn missing_params_are_rejected() {
        assert!(PowerSupplyMonitor::from_params(None).is_err());
    }
}
