//! Integration tests for the experiment scheduler
//!
//! Sequences are parsed from YAML, instantiated through the experiment
//! registry and run against a simulated power supply on a paused clock.

use labd::experiment::storage::MemorySink;
use labd::experiment::{
    ExperimentContext, ExperimentRegistry, ExperimentState, SequenceDefinition, SequenceRunner,
    SequenceStatus,
};
use labd::hardware::virtual_psu::VirtualPowerSupply;
use labd::hardware::{Instrument, InstrumentSet, VoltageCurrentControllable};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

const TWO_STEPS: &str = r#"
sequence:
  - experiment_type: power_supply_monitor
    name: settle
    params:
      device: bench
      sampling_rate_hz: 2
      duration_secs: 1
      target_voltage: 8.0
      target_current: 3.0
      output_on: true
  - experiment_type: power_supply_monitor
    name: hold
    params:
      device: bench
      sampling_rate_hz: 4
      duration_secs: 0.5
      switch_off_on_stop: true
"#;

fn runner(yaml: &str, sink: &MemorySink) -> (SequenceRunner, Arc<VirtualPowerSupply>) {
    let supply = Arc::new(VirtualPowerSupply::new(5.0));
    let instruments = InstrumentSet::new(vec![Instrument::power_supply("bench", supply.clone())]);
    let sequence = SequenceDefinition::from_yaml_str("bench-check", yaml).unwrap();
    let experiments = ExperimentRegistry::with_builtin()
        .instantiate(&sequence)
        .unwrap();
    let runner = SequenceRunner::new(
        sequence.name.clone(),
        experiments,
        ExperimentContext::new(instruments),
        Arc::new(sink.clone()),
        "output",
        256,
    );
    (runner, supply)
}

#[tokio::test(start_paused = true)]
async fn test_snapshots_progress_monotonically_and_in_order() {
    let sink = MemorySink::new();
    let (runner, supply) = runner(TWO_STEPS, &sink);
    let mut updates = runner.subscribe();

    let initial = runner.status();
    assert!(initial
        .experiments
        .iter()
        .all(|e| e.state == ExperimentState::NotStarted));

    let final_status = tokio::spawn(runner.run()).await.unwrap();

    let mut snapshots: Vec<SequenceStatus> = Vec::new();
    loop {
        match updates.recv().await {
            Ok(status) => snapshots.push(status),
            Err(RecvError::Lagged(_)) => panic!("channel sized for the whole run"),
            Err(RecvError::Closed) => break,
        }
    }

    assert_eq!(snapshots.first(), Some(&initial));
    assert_eq!(snapshots.last(), Some(&final_status));

    for index in 0..2 {
        let progress: Vec<f64> = snapshots
            .iter()
            .map(|s| s.experiments[index].progress)
            .collect();
        assert!(
            progress.windows(2).all(|pair| pair[0] <= pair[1]),
            "progress of experiment {index} went backwards: {progress:?}"
        );
    }

    // the second experiment does not start before the first is finished
    for snapshot in &snapshots {
        if snapshot.experiments[1].state != ExperimentState::NotStarted {
            assert_eq!(snapshot.experiments[0].state, ExperimentState::Finished);
        }
    }

    for experiment in &final_status.experiments {
        assert_eq!(experiment.state, ExperimentState::Finished);
        assert_eq!(experiment.progress, 1.0);
        assert!(experiment.error.is_none(), "{:?}", experiment.error);
    }
    assert_eq!(final_status.get("settle").unwrap().samples, 3);
    assert_eq!(final_status.get("hold").unwrap().samples, 3);
    assert!(!supply.is_output_on().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_series_reach_the_sink_with_readings() {
    let sink = MemorySink::new();
    let (runner, _supply) = runner(TWO_STEPS, &sink);
    runner.run().await;

    let stored = sink.stored();
    let names: Vec<_> = stored.iter().map(|s| s.experiment.as_str()).collect();
    assert_eq!(names, ["settle", "hold"]);

    let settle = &stored[0].series;
    assert_eq!(settle.fields(), ["voltage", "current"]);
    assert_eq!(settle.timestamps(), [0.0, 0.5, 1.0]);
    for record in settle.records() {
        assert!((record.values[0] - 8.0).abs() < 1e-9);
        assert!((record.values[1] - 1.6).abs() < 1e-9);
    }
    assert_eq!(stored[0].directory, std::path::Path::new("output").join("bench-check"));
}

#[tokio::test(start_paused = true)]
async fn test_failing_experiment_does_not_stop_the_sequence() {
    let yaml = r#"
sequence:
  - experiment_type: power_supply_monitor
    name: ghost
    params: { device: missing, duration_secs: 1 }
  - experiment_type: power_supply_monitor
    name: real
    params: { device: bench, duration_secs: 1 }
"#;
    let sink = MemorySink::new();
    let (runner, _supply) = runner(yaml, &sink);
    let status = runner.run().await;

    let ghost = status.get("ghost").unwrap();
    assert_eq!(ghost.state, ExperimentState::Finished);
    assert_eq!(ghost.samples, 0);
    assert!(ghost.error.as_deref().unwrap().contains("missing"));

    let real = status.get("real").unwrap();
    assert_eq!(real.samples, 2);
    assert!(real.error.is_none());
}
