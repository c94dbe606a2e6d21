//! Experiment progress as seen by the scheduler, the daemon and clients.
//!
//! A [`SequenceStatus`] is a plain value: the scheduler mutates its own copy
//! and publishes clones, so a snapshot held by anyone else never changes.

use serde::{Deserialize, Serialize};

/// Lifecycle state of one experiment.
///
/// # State Machine
///
/// ```text
/// NotStarted ──start()──> Running ──stop()──> Finished
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentState {
    NotStarted,
    Running,
    Finished,
}

impl std::fmt::Display for ExperimentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExperimentState::NotStarted => write!(f, "NOT_STARTED"),
            ExperimentState::Running => write!(f, "RUNNING"),
            ExperimentState::Finished => write!(f, "FINISHED"),
        }
    }
}

/// Progress of one experiment in a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentStatus {
    pub name: String,
    pub state: ExperimentState,
    /// Fraction of the declared duration elapsed, within [0, 1]
    pub progress: f64,
    /// Records collected so far
    #[serde(default)]
    pub samples: usize,
    /// Set when start, measure or stop failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExperimentStatus {
    pub fn not_started(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: ExperimentState::NotStarted,
            progress: 0.0,
            samples: 0,
            error: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state == ExperimentState::Finished
    }
}

/// Per-experiment status, index-aligned with the sequence definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SequenceStatus {
    pub experiments: Vec<ExperimentStatus>,
}

impl SequenceStatus {
    /// Every experiment NOT_STARTED.
    pub fn pending<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            experiments: names.into_iter().map(ExperimentStatus::not_started).collect(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.experiments.iter().all(ExperimentStatus::is_finished)
    }

    pub fn get(&self, name: &str) -> Option<&ExperimentStatus> {
        self.experiments.iter().find(|e| e.name == name)
    }
}

/// `elapsed / duration` clamped to [0, 1]; a zero-length experiment is complete.
pub fn progress_fraction(elapsed_secs: f64, duration_secs: f64) -> f64 {
    if duration_secs <= 0.0 {
        return 1.0;
    }
    (elapsed_secs / duration_secs).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_sequence_is_not_finished() {
        let status = SequenceStatus::pending(["000", "001"]);
        assert_eq!(status.experiments.len(), 2);
        assert!(status
            .experiments
            .iter()
            .all(|e| e.state == ExperimentState::NotStarted && e.progress == 0.0));
        assert!(!status.is_finished());
    }

    #[test]
    fn progress_is_clamped() {
        assert_eq!(progress_fraction(0.5, 1.0), 0.5);
        assert_eq!(progress_fraction(1.0000001, 1.0), 1.0);
        assert_eq!(progress_fraction(-0.1, 1.0), 0.0);
        assert_eq!(progress_fraction(3.0, 0.0), 1.0);
    }

    #[test]
    fn states_serialize_in_wire_form() {
        let json = serde_json::to_string(&ExperimentState::NotStarted).unwrap();
        assert_eq!(json, "\"NOT_STARTED\"");
        assert_eq!(ExperimentState::Finished.to_string(), "FINISHED");
    }
}
