//! Experiment Scheduler
//!
//! Runs the experiments of one sequence in declaration order. For each one:
//!
//! 1. `start()` and mark it RUNNING
//! 2. every `1 / sampling_rate_hz` seconds call `measure()` and append the
//!    values, stamped with the seconds elapsed since the loop began
//! 3. stop ticking once the elapsed time passes the declared duration
//! 4. `stop()`, always, then mark it FINISHED and hand its series to the sink
//!
//! The sleep after a tick is `period - elapsed % period`, so a slow `measure()`
//! shortens the next pause instead of pushing every later tick back.
//!
//! A full [`SequenceStatus`] snapshot is broadcast when the sequence starts,
//! before the first tick, after every tick and after `stop()`. Publishing never
//! waits: with no receivers the snapshot is dropped, and a lagging receiver
//! loses the oldest snapshots rather than slowing the loop.
//!
//! A failure in `start()` or `measure()` ends that experiment's ticks and is
//! recorded in its status; the remaining experiments still run. A panic counts
//! as a failure: it is caught, `stop()` still runs and the sequence goes on.

use super::sequence::ScheduledExperiment;
use super::state::{progress_fraction, ExperimentState, SequenceStatus};
use super::storage::SeriesSink;
use super::{ExperimentContext, MeasurementSeries};
use anyhow::anyhow;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Slack when comparing elapsed time to the declared duration.
const TIME_EPSILON: f64 = 1e-9;

/// Drives one sequence to completion.
pub struct SequenceRunner {
    sequence_name: String,
    experiments: Vec<ScheduledExperiment>,
    status: SequenceStatus,
    context: ExperimentContext,
    sink: Arc<dyn SeriesSink>,
    output_dir: PathBuf,
    updates: broadcast::Sender<SequenceStatus>,
}

impl std::fmt::Debug for SequenceRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceRunner")
            .field("sequence", &self.sequence_name)
            .field("status", &self.status)
            .finish()
    }
}

impl SequenceRunner {
    /// `output_dir` is the root; series land in `output_dir/<sequence_name>/`.
    pub fn new(
        sequence_name: impl Into<String>,
        experiments: Vec<ScheduledExperiment>,
        context: ExperimentContext,
        sink: Arc<dyn SeriesSink>,
        output_dir: impl Into<PathBuf>,
        channel_capacity: usize,
    ) -> Self {
        let (updates, _) = broadcast::channel(channel_capacity.max(1));
        let status = SequenceStatus::pending(experiments.iter().map(|e| e.name.clone()));
        Self {
            sequence_name: sequence_name.into(),
            experiments,
            status,
            context,
            sink,
            output_dir: output_dir.into(),
            updates,
        }
    }

    /// Receive every snapshot published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SequenceStatus> {
        self.updates.subscribe()
    }

    /// Current status; all NOT_STARTED before `run`.
    pub fn status(&self) -> SequenceStatus {
        self.status.clone()
    }

    pub fn sequence_name(&self) -> &str {
        &self.sequence_name
    }

    pub fn output_directory(&self) -> PathBuf {
        self.output_dir.join(&self.sequence_name)
    }

    /// Run every experiment and return the final status.
    pub async fn run(mut self) -> SequenceStatus {
        info!(
            sequence = %self.sequence_name,
            experiments = self.experiments.len(),
            "sequence started"
        );
        self.publish();

        let experiments = std::mem::take(&mut self.experiments);
        for (index, mut scheduled) in experiments.into_iter().enumerate() {
            let series = self.run_experiment(index, &mut scheduled).await;
            self.persist(scheduled.name, series).await;
        }

        info!(sequence = %self.sequence_name, "sequence finished");
        self.status
    }

    async fn run_experiment(
        &mut self,
        index: usize,
        scheduled: &mut ScheduledExperiment,
    ) -> MeasurementSeries {
        let experiment = scheduled.experiment.as_mut();
        let name = scheduled.name.clone();
        let period = 1.0 / experiment.sampling_rate_hz();
        let duration = experiment.duration_secs();
        let mut series = MeasurementSeries::new(experiment.fields());

        info!(experiment = %name, rate_hz = experiment.sampling_rate_hz(), duration_secs = duration, "experiment starting");
        let sampling = AssertUnwindSafe(async {
            if let Err(err) = experiment.start(&self.context).await {
                self.mark_running(index);
                return Some(err);
            }
            self.mark_running(index);

            let started = Instant::now();
            loop {
                let elapsed = started.elapsed().as_secs_f64();
                if elapsed > duration + TIME_EPSILON {
                    return None;
                }

                let recorded = match experiment.measure(&self.context).await {
                    Ok(values) => series.push(elapsed, values).map_err(anyhow::Error::from),
                    Err(err) => Err(err),
                };
                if let Err(err) = recorded {
                    return Some(err);
                }

                let samples = series.len();
                self.update(index, |status| {
                    status.progress = progress_fraction(elapsed, duration);
                    status.samples = samples;
                });
                self.publish();
                debug!(experiment = %name, elapsed, samples, "tick");

                let since_start = started.elapsed().as_secs_f64();
                let pause = period - since_start % period;
                tokio::time::sleep(Duration::from_secs_f64(pause)).await;
            }
        })
        .catch_unwind()
        .await;
        let mut failure = sampling.unwrap_or_else(|panic| Some(panicked("sampling", &*panic)));

        let stopped = AssertUnwindSafe(experiment.stop(&self.context))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(panicked("stop", &*panic)));
        if let Err(err) = stopped {
            warn!(experiment = %name, error = %format!("{err:#}"), "stop failed");
            failure.get_or_insert(err);
        }

        let error = failure.map(|err| format!("{err:#}"));
        if let Some(message) = &error {
            warn!(experiment = %name, error = %message, "experiment aborted");
        }
        self.update(index, |status| {
            status.state = ExperimentState::Finished;
            status.progress = 1.0;
            status.error = error;
        });
        self.publish();
        info!(experiment = %name, samples = series.len(), "experiment finished");

        series
    }

    /// Hand `series` to the sink on the blocking pool; sinks write files.
    async fn persist(&mut self, experiment: String, series: MeasurementSeries) {
        let sink = Arc::clone(&self.sink);
        let directory = self.output_directory();
        let name = experiment.clone();
        let stored =
            tokio::task::spawn_blocking(move || sink.persist(&directory, &name, &series)).await;
        match stored {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(experiment = %experiment, error = %err, "failed to persist series"),
            Err(err) => warn!(experiment = %experiment, error = %err, "persist task failed"),
        }
    }

    fn mark_running(&mut self, index: usize) {
        self.update(index, |status| {
            status.state = ExperimentState::Running;
            status.progress = 0.0;
        });
        self.publish();
    }

    fn update(&mut self, index: usize, apply: impl FnOnce(&mut super::ExperimentStatus)) {
        if let Some(status) = self.status.experiments.get_mut(index) {
            apply(status);
        }
    }

    fn publish(&self) {
        // Err only means nobody is listening
        let _ = self.updates.send(self.status.clone());
    }
}

fn panicked(phase: &str, payload: &(dyn Any + Send)) -> anyhow::Error {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    anyhow!("experiment panicked during {phase}: {message}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::storage::MemorySink;
    use crate::experiment::Experiment;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        rate: f64,
        duration: f64,
        ticks: usize,
        fail_at: Option<usize>,
        stops: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Experiment for Counter {
        fn sampling_rate_hz(&self) -> f64 {
            self.rate
        }

        fn duration_secs(&self) -> f64 {
            self.duration
        }

        fn fields(&self) -> Vec<String> {
            vec!["count".into()]
        }

        async fn start(&mut self, _ctx: &ExperimentContext) -> anyhow::Result<()> {
            Ok(())
        }

        async fn measure(&mut self, _ctx: &ExperimentContext) -> anyhow::Result<Vec<f64>> {
            if self.fail_at == Some(self.ticks) {
                anyhow::bail!("sensor unplugged");
            }
            self.ticks += 1;
            Ok(vec![self.ticks as f64])
        }

        async fn stop(&mut self, _ctx: &ExperimentContext) -> anyhow::Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counter(name: &str, fail_at: Option<usize>, stops: &Arc<AtomicUsize>) -> ScheduledExperiment {
        ScheduledExperiment {
            name: name.into(),
            experiment: Box::new(Counter {
                rate: 2.0,
                duration: 1.0,
                ticks: 0,
                fail_at,
                stops: stops.clone(),
            }),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn samples_at_exact_period() {
        let stops = Arc::new(AtomicUsize::new(0));
        let sink = MemorySink::new();
        let runner = SequenceRunner::new(
            "seq",
            vec![counter("e", None, &stops)],
            ExperimentContext::default(),
            Arc::new(sink.clone()),
            "out",
            64,
        );

        let status = runner.run().await;
        assert!(status.is_finished());
        assert_eq!(status.experiments[0].samples, 3);

        let stored = sink.stored();
        assert_eq!(stored[0].directory, PathBuf::from("out").join("seq"));
        assert_eq!(stored[0].series.timestamps(), [0.0, 0.5, 1.0]);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn measure_failure_aborts_only_that_experiment() {
        let stops = Arc::new(AtomicUsize::new(0));
        let sink = MemorySink::new();
        let runner = SequenceRunner::new(
            "seq",
            vec![counter("flaky", Some(1), &stops), counter("steady", None, &stops)],
            ExperimentContext::default(),
            Arc::new(sink.clone()),
            "out",
            64,
        );

        let status = runner.run().await;
        let flaky = status.get("flaky").unwrap();
        assert_eq!(flaky.state, ExperimentState::Finished);
        assert_eq!(flaky.samples, 1);
        assert!(flaky.error.as_deref().unwrap().contains("sensor unplugged"));

        let steady = status.get("steady").unwrap();
        assert_eq!(steady.samples, 3);
        assert!(steady.error.is_none());
        assert_eq!(stops.load(Ordering::SeqCst), 2);
        assert_eq!(sink.stored().len(), 2);
    }

    struct Brittle {
        panic_in_start: bool,
        stops: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Experiment for Brittle {
        fn sampling_rate_hz(&self) -> f64 {
            2.0
        }

        fn duration_secs(&self) -> f64 {
            1.0
        }

        fn fields(&self) -> Vec<String> {
            vec!["x".into()]
        }

        async fn start(&mut self, _ctx: &ExperimentContext) -> anyhow::Result<()> {
            if self.panic_in_start {
                panic!("driver bug in start");
            }
            Ok(())
        }

        async fn measure(&mut self, _ctx: &ExperimentContext) -> anyhow::Result<Vec<f64>> {
            let readings: Vec<f64> = Vec::new();
            Ok(vec![readings[0]])
        }

        async fn stop(&mut self, _ctx: &ExperimentContext) -> anyhow::Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn brittle(name: &str, panic_in_start: bool, stops: &Arc<AtomicUsize>) -> ScheduledExperiment {
        ScheduledExperiment {
            name: name.into(),
            experiment: Box::new(Brittle {
                panic_in_start,
                stops: stops.clone(),
            }),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_measure_is_stopped_and_the_sequence_goes_on() {
        let stops = Arc::new(AtomicUsize::new(0));
        let sink = MemorySink::new();
        let runner = SequenceRunner::new(
            "seq",
            vec![brittle("brittle", false, &stops), counter("steady", None, &stops)],
            ExperimentContext::default(),
            Arc::new(sink.clone()),
            "out",
            64,
        );
        let mut updates = runner.subscribe();

        let status = tokio::spawn(runner.run()).await.unwrap();

        let brittle = status.get("brittle").unwrap();
        assert_eq!(brittle.state, ExperimentState::Finished);
        assert_eq!(brittle.samples, 0);
        let error = brittle.error.as_deref().unwrap();
        assert!(error.contains("panicked during sampling"), "{error}");
        assert!(error.contains("index out of bounds"), "{error}");

        let steady = status.get("steady").unwrap();
        assert_eq!(steady.samples, 3);
        assert!(steady.error.is_none());

        assert_eq!(stops.load(Ordering::SeqCst), 2);
        assert_eq!(sink.stored().len(), 2);

        let mut last = None;
        while let Ok(snapshot) = updates.try_recv() {
            last = Some(snapshot);
        }
        assert!(last.unwrap().is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_start_still_runs_stop() {
        let stops = Arc::new(AtomicUsize::new(0));
        let sink = MemorySink::new();
        let runner = SequenceRunner::new(
            "seq",
            vec![brittle("brittle", true, &stops)],
            ExperimentContext::default(),
            Arc::new(sink.clone()),
            "out",
            64,
        );

        let status = runner.run().await;
        let brittle = status.get("brittle").unwrap();
        assert_eq!(brittle.state, ExperimentState::Finished);
        assert!(brittle.error.as_deref().unwrap().contains("driver bug in start"));
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert_eq!(sink.stored().len(), 1);
    }

    #[derive(Default)]
    struct ThreadRecorder(std::sync::Mutex<Vec<std::thread::ThreadId>>);

    impl SeriesSink for ThreadRecorder {
        fn persist(
            &self,
            _directory: &std::path::Path,
            _experiment: &str,
            _series: &MeasurementSeries,
        ) -> crate::error::AppResult<()> {
            self.0.lock().unwrap().push(std::thread::current().id());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn series_are_persisted_off_the_runtime_thread() {
        let stops = Arc::new(AtomicUsize::new(0));
        let sink = Arc::new(ThreadRecorder::default());
        let runner = SequenceRunner::new(
            "seq",
            vec![counter("e", None, &stops)],
            ExperimentContext::default(),
            sink.clone(),
            "out",
            64,
        );
        runner.run().await;

        let threads = sink.0.lock().unwrap();
        assert_eq!(threads.len(), 1);
        assert_ne!(threads[0], std::thread::current().id());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_measure_does_not_accumulate_drift() {
        struct Slow;

        #[async_trait]
        impl Experiment for Slow {
            fn sampling_rate_hz(&self) -> f64 {
                1.0
            }
            fn duration_secs(&self) -> f64 {
                3.0
            }
            fn fields(&self) -> Vec<String> {
                vec!["x".into()]
            }
            async fn start(&mut self, _ctx: &ExperimentContext) -> anyhow::Result<()> {
                Ok(())
            }
            async fn measure(&mut self, _ctx: &ExperimentContext) -> anyhow::Result<Vec<f64>> {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(vec![0.0])
            }
            async fn stop(&mut self, _ctx: &ExperimentContext) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let sink = MemorySink::new();
        let runner = SequenceRunner::new(
            "seq",
            vec![ScheduledExperiment {
                name: "slow".into(),
                experiment: Box::new(Slow),
            }],
            ExperimentContext::default(),
            Arc::new(sink.clone()),
            "out",
            64,
        );
        runner.run().await;

        let stamps = sink.stored()[0].series.timestamps();
        assert_eq!(stamps.len(), 4);
        for (i, stamp) in stamps.iter().enumerate() {
            assert!((stamp - i as f64).abs() < 1e-6, "tick {i} at {stamp}");
        }
    }
}
