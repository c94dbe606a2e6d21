//! The requests the daemon answers, and how it answers them.
//!
//! Each request is a plain serde type implementing [`Request`]; its handler is
//! the [`Handle`] impl next to it. Failures that belong to a single device are
//! reported inside the response (`is_available`, `error_type`) instead of as an
//! error reply, so one broken instrument never hides the others.

use super::core::DaemonCore;
use super::dispatch::Handle;
use super::protocol::Request;
use crate::error::{AppResult, LabError};
use crate::experiment::SequenceStatus;
use crate::hardware::{DeviceType, Instrument, PowerSupply, PowerSupplyMode};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Liveness check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HelloRequest;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloResponse {
    pub content: String,
}

impl Request for HelloRequest {
    const NAME: &'static str = "Hello";
    type Response = HelloResponse;
}

#[async_trait]
impl Handle for HelloRequest {
    async fn handle(self, _core: &Arc<DaemonCore>) -> AppResult<HelloResponse> {
        Ok(HelloResponse {
            content: "Hello world".to_string(),
        })
    }
}

/// Probe every configured instrument.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListDevicesRequest;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListDevicesResponse {
    pub devices: Vec<DeviceStatus>,
}

/// Availability of one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub name: String,
    pub is_available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl DeviceStatus {
    fn from_outcome(name: &str, outcome: AppResult<()>) -> Self {
        match outcome {
            Ok(()) => Self {
                name: name.to_string(),
                is_available: true,
                error_type: None,
                error_message: None,
            },
            Err(err) => Self {
                name: name.to_string(),
                is_available: false,
                error_type: Some(err.kind().to_string()),
                error_message: Some(err.to_string()),
            },
        }
    }
}

impl Request for ListDevicesRequest {
    const NAME: &'static str = "ListDevices";
    type Response = ListDevicesResponse;
}

#[async_trait]
impl Handle for ListDevicesRequest {
    async fn handle(self, core: &Arc<DaemonCore>) -> AppResult<ListDevicesResponse> {
        let mut devices = Vec::with_capacity(core.instruments().len());
        for instrument in core.instruments().iter() {
            let outcome = with_open(instrument, |_| async { Ok(()) }).await;
            debug!(device = instrument.name(), available = outcome.is_ok(), "probed");
            devices.push(DeviceStatus::from_outcome(instrument.name(), outcome));
        }
        Ok(ListDevicesResponse { devices })
    }
}

/// Detailed state of one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfoRequest {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfoResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<DeviceType>,
    pub is_connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_supply_info: Option<PowerSupplyInfo>,
}

/// Readings taken from a power supply while answering `DeviceInfo`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerSupplyInfo {
    pub is_output_on: bool,
    pub mode: PowerSupplyMode,
    pub target_voltage: f64,
    pub target_current: f64,
    pub actual_voltage: f64,
    pub actual_current: f64,
}

impl PowerSupplyInfo {
    async fn read(supply: &Arc<dyn PowerSupply>) -> AppResult<Self> {
        Ok(Self {
            is_output_on: supply.is_output_on().await?,
            mode: supply.get_mode().await?,
            target_voltage: supply.get_target_voltage().await?,
            target_current: supply.get_target_current().await?,
            actual_voltage: supply.get_actual_voltage().await?,
            actual_current: supply.get_actual_current().await?,
        })
    }
}

impl Request for DeviceInfoRequest {
    const NAME: &'static str = "DeviceInfo";
    type Response = DeviceInfoResponse;
}

#[async_trait]
impl Handle for DeviceInfoRequest {
    async fn handle(self, core: &Arc<DaemonCore>) -> AppResult<DeviceInfoResponse> {
        let Some(instrument) = core.instruments().get(&self.name) else {
            let err = LabError::UnknownDevice(self.name);
            return Ok(DeviceInfoResponse {
                device_type: None,
                is_connected: false,
                error_type: Some(err.kind().to_string()),
                error_message: Some(err.to_string()),
                power_supply_info: None,
            });
        };

        let outcome = with_open(instrument, |instrument| async move {
            match instrument.as_power_supply() {
                Some(supply) => PowerSupplyInfo::read(supply).await.map(Some),
                None => Ok(None),
            }
        })
        .await;

        let device_type = Some(instrument.device_type());
        Ok(match outcome {
            Ok(power_supply_info) => DeviceInfoResponse {
                device_type,
                is_connected: true,
                error_type: None,
                error_message: None,
                power_supply_info,
            },
            Err(err) => DeviceInfoResponse {
                device_type,
                is_connected: false,
                error_type: Some(err.kind().to_string()),
                error_message: Some(err.to_string()),
                power_supply_info: None,
            },
        })
    }
}

/// Open, test, run `body`, then close again.
///
/// The close matches this open only, so an instrument a running experiment
/// holds open stays open.
async fn with_open<'a, F, Fut, T>(instrument: &'a Instrument, body: F) -> AppResult<T>
where
    F: FnOnce(&'a Instrument) -> Fut,
    Fut: std::future::Future<Output = AppResult<T>>,
{
    instrument.open().await?;
    let outcome = match instrument.test_connection().await {
        Ok(()) => body(instrument).await,
        Err(err) => Err(err),
    };
    if let Err(err) = instrument.close().await {
        warn!(device = instrument.name(), error = %err, "close failed");
    }
    outcome
}

/// Start the sequence stored at `sequence_path` on the daemon's host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSequenceRequest {
    pub sequence_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSequenceResponse {
    pub sequence: String,
    pub experiments: Vec<String>,
}

impl Request for RunSequenceRequest {
    const NAME: &'static str = "RunSequence";
    type Response = RunSequenceResponse;
}

#[async_trait]
impl Handle for RunSequenceRequest {
    async fn handle(self, core: &Arc<DaemonCore>) -> AppResult<RunSequenceResponse> {
        info!(path = %self.sequence_path.display(), "run sequence requested");
        core.start_sequence(&self.sequence_path)
    }
}

/// Latest status snapshot of the current or last sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentStatusRequest;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentStatusResponse {
    #[serde(default)]
    pub sequence_status: Option<SequenceStatus>,
}

impl Request for ExperimentStatusRequest {
    const NAME: &'static str = "ExperimentStatus";
    type Response = ExperimentStatusResponse;
}

#[async_trait]
impl Handle for ExperimentStatusRequest {
    async fn handle(self, core: &Arc<DaemonCore>) -> AppResult<ExperimentStatusResponse> {
        Ok(ExperimentStatusResponse {
            sequence_status: core.status_snapshot(),
        })
    }
}

/// Ask the daemon to stop. Never answered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HaltRequest;

impl Request for HaltRequest {
    const NAME: &'static str = "Halt";
    const EXPECTS_REPLY: bool = false;
    type Response = ();
}

#[async_trait]
impl Handle for HaltRequest {
    async fn handle(self, core: &Arc<DaemonCore>) -> AppResult<()> {
        info!("halt requested");
        core.request_shutdown();
        Ok(())
    }
}
