//! Sequence definitions and the experiment type registry.
//!
//! A sequence file lists experiments by type id:
//!
//! ```yaml
//! sequence:
//!   - experiment_type: power_supply_monitor
//!     params:
//!       device: bench
//!       duration_secs: 10
//!   - experiment_type: power_supply_monitor
//!     name: ramp
//!     params: { device: bench, duration_secs: 5, target_voltage: 4.25 }
//! ```
//!
//! The sequence takes its name from the file stem. Unnamed experiments are
//! named after their position: `000`, `001`, ...

use super::builtin::PowerSupplyMonitor;
use super::Experiment;
use crate::error::{AppResult, LabError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

/// One entry of a sequence file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentDefinition {
    pub experiment_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct SequenceFile {
    sequence: Vec<ExperimentDefinition>,
}

/// An ordered list of experiments to run one after another.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceDefinition {
    pub name: String,
    pub experiments: Vec<ExperimentDefinition>,
}

impl SequenceDefinition {
    /// Read a sequence file; the sequence is named after the file stem.
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| {
                LabError::Configuration(format!("invalid sequence path: {}", path.display()))
            })?;
        let text = std::fs::read_to_string(path).map_err(|e| {
            LabError::Configuration(format!("cannot read sequence {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(name, &text)
    }

    pub fn from_yaml_str(name: impl Into<String>, yaml: &str) -> AppResult<Self> {
        let name = name.into();
        let file: SequenceFile = serde_yaml::from_str(yaml)
            .map_err(|e| LabError::Configuration(format!("invalid sequence '{}': {}", name, e)))?;

        let sequence = Self {
            name,
            experiments: file.sequence,
        };
        sequence.validate()?;
        Ok(sequence)
    }

    /// Experiment names, with positional defaults filled in.
    pub fn experiment_names(&self) -> Vec<String> {
        self.experiments
            .iter()
            .enumerate()
            .map(|(index, def)| def.name.clone().unwrap_or_else(|| format!("{index:03}")))
            .collect()
    }

    fn validate(&self) -> AppResult<()> {
        if self.experiments.is_empty() {
            return Err(LabError::Configuration(format!(
                "sequence '{}' has no experiments",
                self.name
            )));
        }
        let mut seen = HashSet::new();
        for name in self.experiment_names() {
            if !seen.insert(name.clone()) {
                return Err(LabError::Configuration(format!(
                    "sequence '{}' names experiment '{}' twice",
                    self.name, name
                )));
            }
        }
        Ok(())
    }
}

/// Builds an experiment from its optional parameters.
pub type ExperimentFactory =
    Arc<dyn Fn(Option<&serde_json::Value>) -> anyhow::Result<Box<dyn Experiment>> + Send + Sync>;

/// An experiment instance ready to run.
pub struct ScheduledExperiment {
    pub name: String,
    pub experiment: Box<dyn Experiment>,
}

impl std::fmt::Debug for ScheduledExperiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledExperiment")
            .field("name", &self.name)
            .field("sampling_rate_hz", &self.experiment.sampling_rate_hz())
            .field("duration_secs", &self.experiment.duration_secs())
            .finish()
    }
}

/// Experiment type id → factory.
#[derive(Clone, Default)]
pub struct ExperimentRegistry {
    factories: HashMap<String, ExperimentFactory>,
}

impl std::fmt::Debug for ExperimentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentRegistry")
            .field("types", &self.type_ids())
            .finish()
    }
}

impl ExperimentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the experiments shipped in this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(PowerSupplyMonitor::TYPE_ID, |params| {
            Ok(Box::new(PowerSupplyMonitor::from_params(params)?) as Box<dyn Experiment>)
        });
        registry
    }

    pub fn register<F>(&mut self, type_id: impl Into<String>, factory: F)
    where
        F: Fn(Option<&serde_json::Value>) -> anyhow::Result<Box<dyn Experiment>>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(type_id.into(), Arc::new(factory));
    }

    pub fn type_ids(&self) -> Vec<&str> {
        let mut ids: Vec<_> = self.factories.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Build every experiment of `sequence`, in order.
    ///
    /// Fails before anything runs if a type is unknown, parameters are
    /// rejected or an experiment declares an unusable timing.
    pub fn instantiate(&self, sequence: &SequenceDefinition) -> AppResult<Vec<ScheduledExperiment>> {
        sequence
            .experiments
            .iter()
            .zip(sequence.experiment_names())
            .map(|(def, name)| {
                let factory = self.factories.get(&def.experiment_type).ok_or_else(|| {
                    LabError::Configuration(format!(
                        "experiment '{}' has unknown type '{}'",
                        name, def.experiment_type
                    ))
                })?;
                let experiment = factory(def.params.as_ref()).map_err(|e| {
                    LabError::Configuration(format!("experiment '{}': {:#}", name, e))
                })?;
                check_timing(&name, experiment.as_ref())?;
                Ok(ScheduledExperiment { name, experiment })
            })
            .collect()
    }
}

fn check_timing(name: &str, experiment: &dyn Experiment) -> AppResult<()> {
    let rate = experiment.sampling_rate_hz();
    let duration = experiment.duration_secs();
    if !(rate.is_finite() && rate > 0.0) {
        return Err(LabError::Configuration(format!(
            "experiment '{name}' has invalid sampling rate {rate}"
        )));
    }
    if !(duration.is_finite() && duration >= 0.0) {
        return Err(LabError::Configuration(format!(
            "experiment '{name}' has invalid duration {duration}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_MONITORS: &str = r#"
sequence:
  - experiment_type: power_supply_monitor
    params:
      device: bench
      duration_secs: 2
  - experiment_type: power_supply_monitor
    name: ramp
    params: { device: bench, duration_secs: 1, sampling_rate_hz: 4 }
"#;

    #[test]
    fn unnamed_experiments_get_positional_names() {
        let sequence = SequenceDefinition::from_yaml_str("warmup", TWO_MONITORS).unwrap();
        assert_eq!(sequence.name, "warmup");
        assert_eq!(sequence.experiment_names(), ["000", "ramp"]);
    }

    #[test]
    fn load_names_sequence_after_file_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("night-run.yaml");
        std::fs::write(&path, TWO_MONITORS).unwrap();

        let sequence = SequenceDefinition::load(&path).unwrap();
        assert_eq!(sequence.name, "night-run");
        assert_eq!(sequence.experiments.len(), 2);
    }

    #[test]
    fn instantiates_builtin_experiments() {
        let sequence = SequenceDefinition::from_yaml_str("s", TWO_MONITORS).unwrap();
        let scheduled = ExperimentRegistry::with_builtin()
            .instantiate(&sequence)
            .unwrap();
        assert_eq!(scheduled.len(), 2);
        assert_eq!(scheduled[1].name, "ramp");
        assert_eq!(scheduled[1].experiment.sampling_rate_hz(), 4.0);
    }

    #[test]
    fn unknown_type_is_rejected_before_running() {
        let yaml = "sequence:\n  - experiment_type: teleport\n";
        let sequence = SequenceDefinition::from_yaml_str("s", yaml).unwrap();
        let err = ExperimentRegistry::with_builtin()
            .instantiate(&sequence)
            .unwrap_err();
        assert!(err.to_string().contains("teleport"));
    }

    #[test]
    fn duplicate_and_empty_sequences_are_rejected() {
        let duplicate = r#"
sequence:
  - { experiment_type: power_supply_monitor, name: a }
  - { experiment_type: power_supply_monitor, name: a }
"#;
        assert!(SequenceDefinition::from_yaml_str("s", duplicate).is_err());
        assert!(SequenceDefinition::from_yaml_str("s", "sequence: []").is_err());
    }
}
