//! Daemon state shared by every connection.
//!
//! [`DaemonCore`] owns the instruments, the experiment registry and the status
//! cache of the current sequence. Requests are handled one at a time by the
//! server loop; the only concurrent writer of daemon state is the status relay
//! task, which copies snapshots from the running sequence into the cache.

use super::dispatch::Dispatcher;
use super::lifecycle::PidMarker;
use super::requests::RunSequenceResponse;
use crate::config::DaemonConfig;
use crate::error::{AppResult, LabError};
use crate::experiment::storage::default_sink;
use crate::experiment::{
    ExperimentContext, ExperimentRegistry, SequenceDefinition, SequenceRunner, SequenceStatus,
    SeriesSink,
};
use crate::hardware::{DriverRegistry, InstrumentSet};
use crate::serial::PortRegistry;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Tasks belonging to the current sequence.
#[derive(Debug)]
struct ActiveSequence {
    name: String,
    runner: JoinHandle<SequenceStatus>,
    relay: JoinHandle<()>,
}

/// Shared daemon state. Always used behind an `Arc`.
pub struct DaemonCore {
    config: DaemonConfig,
    instruments: InstrumentSet,
    experiments: ExperimentRegistry,
    sink: Arc<dyn SeriesSink>,
    ports: PortRegistry,
    dispatcher: Dispatcher,
    status: Mutex<Option<SequenceStatus>>,
    active: Mutex<Option<ActiveSequence>>,
    pid_marker: Option<PidMarker>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for DaemonCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonCore")
            .field("address", &self.config.daemon.address)
            .field("instruments", &self.instruments)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DaemonCore {
    pub fn builder(config: DaemonConfig) -> DaemonBuilder {
        DaemonBuilder::new(config)
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn instruments(&self) -> &InstrumentSet {
        &self.instruments
    }

    pub fn ports(&self) -> &PortRegistry {
        &self.ports
    }

    /// Handle one request body; `None` for fire-and-forget requests.
    pub async fn dispatch(self: &Arc<Self>, message: &[u8]) -> Option<Vec<u8>> {
        self.dispatcher.dispatch(self, message).await
    }

    /// Copy of the most recent status snapshot, if a sequence was ever started.
    pub fn status_snapshot(&self) -> Option<SequenceStatus> {
        lock(&self.status).clone()
    }

    fn store_status(&self, status: SequenceStatus) {
        *lock(&self.status) = Some(status);
    }

    /// True while a sequence's runner task has not completed.
    pub fn is_sequence_running(&self) -> bool {
        lock(&self.active)
            .as_ref()
            .is_some_and(|active| !active.runner.is_finished())
    }

    /// Load, instantiate and launch a sequence in the background.
    ///
    /// The status cache holds the all-NOT_STARTED snapshot before this returns,
    /// so the next status request already sees the new sequence.
    pub fn start_sequence(self: &Arc<Self>, path: &Path) -> AppResult<RunSequenceResponse> {
        let mut active = lock(&self.active);
        if let Some(current) = active.as_ref() {
            if !current.runner.is_finished() {
                warn!(running = %current.name, "sequence rejected: another one is running");
                return Err(LabError::SequenceBusy);
            }
        }

        let definition = SequenceDefinition::load(path)?;
        let experiments = self.experiments.instantiate(&definition)?;
        let names: Vec<String> = experiments.iter().map(|e| e.name.clone()).collect();

        let runner = SequenceRunner::new(
            definition.name.clone(),
            experiments,
            ExperimentContext::new(self.instruments.clone()),
            Arc::clone(&self.sink),
            self.config.daemon.output_dir.clone(),
            self.config.daemon.status_channel_capacity,
        );
        let updates = runner.subscribe();
        self.store_status(runner.status());

        let relay = tokio::spawn(relay_status(Arc::clone(self), updates));
        let runner = tokio::spawn(runner.run());
        info!(sequence = %definition.name, experiments = names.len(), "sequence launched");

        *active = Some(ActiveSequence {
            name: definition.name.clone(),
            runner,
            relay,
        });

        Ok(RunSequenceResponse {
            sequence: definition.name,
            experiments: names,
        })
    }

    /// Wait until the current sequence, if any, has finished and its final
    /// snapshot is in the status cache.
    pub async fn wait_for_sequence(&self) {
        let active = lock(&self.active).take();
        if let Some(active) = active {
            if let Err(err) = active.runner.await {
                warn!(sequence = %active.name, error = %err, "sequence task failed");
            }
            if let Err(err) = active.relay.await {
                warn!(sequence = %active.name, error = %err, "status relay failed");
            }
        }
    }

    /// Remove the PID marker and tell the server loop to return.
    pub fn request_shutdown(&self) {
        self.remove_pid_marker();
        self.shutdown.send_replace(true);
    }

    pub fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn remove_pid_marker(&self) {
        if let Some(marker) = &self.pid_marker {
            if let Err(err) = marker.remove() {
                warn!(path = %marker.path().display(), error = %err, "failed to remove pid marker");
            }
        }
    }
}

/// Copy snapshots into the status cache until the sequence reports finished.
async fn relay_status(core: Arc<DaemonCore>, mut updates: broadcast::Receiver<SequenceStatus>) {
    loop {
        match updates.recv().await {
            Ok(status) => {
                let finished = status.is_finished();
                core.store_status(status);
                if finished {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "status relay lagged behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Assembles a [`DaemonCore`] from configuration.
pub struct DaemonBuilder {
    config: DaemonConfig,
    drivers: DriverRegistry,
    experiments: ExperimentRegistry,
    sink: Arc<dyn SeriesSink>,
    ports: Option<PortRegistry>,
    instruments: Option<InstrumentSet>,
    pid_marker: Option<PidMarker>,
}

impl DaemonBuilder {
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            config,
            drivers: DriverRegistry::builtin(),
            experiments: ExperimentRegistry::with_builtin(),
            sink: default_sink(),
            ports: None,
            instruments: None,
            pid_marker: None,
        }
    }

    pub fn with_drivers(mut self, drivers: DriverRegistry) -> Self {
        self.drivers = drivers;
        self
    }

    pub fn with_experiments(mut self, experiments: ExperimentRegistry) -> Self {
        self.experiments = experiments;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn SeriesSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_ports(mut self, ports: PortRegistry) -> Self {
        self.ports = Some(ports);
        self
    }

    /// Use these instruments instead of building them from `devices`.
    pub fn with_instruments(mut self, instruments: InstrumentSet) -> Self {
        self.instruments = Some(instruments);
        self
    }

    /// Remove this marker on shutdown.
    pub fn with_pid_marker(mut self, marker: PidMarker) -> Self {
        self.pid_marker = Some(marker);
        self
    }

    pub fn build(self) -> AppResult<Arc<DaemonCore>> {
        self.config.validate(&self.drivers)?;
        let ports = self.ports.unwrap_or_else(PortRegistry::system);
        let instruments = match self.instruments {
            Some(instruments) => instruments,
            None => self.drivers.create_all(&self.config.devices, &ports)?,
        };
        info!(
            instruments = instruments.len(),
            experiment_types = ?self.experiments.type_ids(),
            "daemon core ready"
        );

        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(DaemonCore {
            config: self.config,
            instruments,
            experiments: self.experiments,
            sink: self.sink,
            ports,
            dispatcher: Dispatcher::standard(),
            status: Mutex::new(None),
            active: Mutex::new(None),
            pid_marker: self.pid_marker,
            shutdown,
        }))
    }
}
