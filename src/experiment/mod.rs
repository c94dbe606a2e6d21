//! Timed measurement experiments.
//!
//! An [`Experiment`] declares a sampling rate, a duration and the names of the
//! values it records. The [`runner::SequenceRunner`] calls `start` once,
//! `measure` once per tick and `stop` exactly once, whatever happened before.
//!
//! Experiments are user code and report failures with `anyhow`; the runner
//! records the message in the experiment's status and moves on to the next one.

pub mod builtin;
pub mod runner;
pub mod sequence;
pub mod state;
pub mod storage;

use crate::error::{AppResult, LabError};
use crate::hardware::{InstrumentSet, PowerSupply};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use runner::SequenceRunner;
pub use sequence::{ExperimentRegistry, SequenceDefinition};
pub use state::{ExperimentState, ExperimentStatus, SequenceStatus};
pub use storage::SeriesSink;

/// What an experiment can reach while it runs.
#[derive(Debug, Clone, Default)]
pub struct ExperimentContext {
    instruments: InstrumentSet,
}

impl ExperimentContext {
    pub fn new(instruments: InstrumentSet) -> Self {
        Self { instruments }
    }

    pub fn instruments(&self) -> &InstrumentSet {
        &self.instruments
    }

    pub fn power_supply(&self, name: &str) -> AppResult<Arc<dyn PowerSupply>> {
        self.instruments.power_supply(name)
    }
}

/// A unit of timed measurement work.
#[async_trait]
pub trait Experiment: Send {
    /// Ticks per second. Must be positive.
    fn sampling_rate_hz(&self) -> f64;

    /// Length of the sampling window in seconds.
    fn duration_secs(&self) -> f64;

    /// Names of the values returned by `measure`, in order.
    fn fields(&self) -> Vec<String>;

    async fn start(&mut self, ctx: &ExperimentContext) -> anyhow::Result<()>;

    /// One value per entry of `fields()`.
    async fn measure(&mut self, ctx: &ExperimentContext) -> anyhow::Result<Vec<f64>>;

    async fn stop(&mut self, ctx: &ExperimentContext) -> anyhow::Result<()>;
}

/// One sampling tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub elapsed_seconds: f64,
    pub values: Vec<f64>,
}

/// All records of one experiment run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSeries {
    fields: Vec<String>,
    records: Vec<MeasurementRecord>,
}

impl MeasurementSeries {
    pub fn new(fields: Vec<String>) -> Self {
        Self {
            fields,
            records: Vec::new(),
        }
    }

    /// Append a record; its width must match the declared fields.
    pub fn push(&mut self, elapsed_seconds: f64, values: Vec<f64>) -> AppResult<()> {
        if values.len() != self.fields.len() {
            return Err(LabError::Experiment(format!(
                "measure() returned {} values for {} fields ({})",
                values.len(),
                self.fields.len(),
                self.fields.join(", ")
            )));
        }
        self.records.push(MeasurementRecord {
            elapsed_seconds,
            values,
        });
        Ok(())
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn records(&self) -> &[MeasurementRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn timestamps(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.elapsed_seconds).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn series_rejects_wrong_width() {
        let mut series = MeasurementSeries::new(vec!["voltage".into(), "current".into()]);
        series.push(0.0, vec![1.0, 2.0]).unwrap();
        let err = series.push(0.5, vec![1.0]).unwrap_err();
        assert_eq!(err.kind(), "ExperimentError");
        assert_eq!(series.len(), 1);
        assert_eq!(series.timestamps(), [0.0]);
    }
}
