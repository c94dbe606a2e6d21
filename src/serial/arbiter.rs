//! Port arbiter: one worker thread per physical serial port.
//!
//! Every open port is owned by exactly one worker thread, which is the only
//! code that touches the underlying [`SerialTransport`]. Callers never hold the
//! port; they hold an [`ArbiterHandle`] and submit jobs (write, query, release)
//! which the worker executes one at a time, HIGH priority first and FIFO within
//! a priority. Each job answers its caller over a oneshot channel.
//!
//! The [`PortRegistry`] maps port paths to their worker and counts how many
//! handles are bound to each one. The last release removes the entry and closes
//! the device while the registry lock is held, so a later `acquire_or_create`
//! for the same path always opens a fresh worker against a closed port.
//!
//! Several units can share one bus. A handle built with
//! [`ArbiterHandle::with_selector`] carries the bytes that address its unit;
//! the worker writes them as part of the same job whenever the bus is not
//! already addressed to that unit, so no other caller can slip in between.
//! Before every query the worker discards unread input, so a reply that
//! arrived after its query timed out is never taken for the next answer.
//!
//! ```no_run
//! use labd::serial::{PortRegistry, SerialSettings};
//!
//! # async fn demo() -> labd::error::AppResult<()> {
//! let ports = PortRegistry::system();
//! let zup = ports.acquire_or_create(&SerialSettings::new("/dev/ttyUSB0", 9600))?;
//! let model = zup.query(":MDL?;").await?;
//! zup.release().await?;
//! # Ok(())
//! # }
//! ```

use super::transport::{PortOpener, SerialSettings, SerialTransport, SystemPortOpener};
use crate::error::{AppResult, LabError};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Scheduling class of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Low,
}

#[derive(Debug)]
enum JobKind {
    Write(Vec<u8>),
    Query(Vec<u8>),
    Select,
    Release,
}

#[derive(Debug)]
enum JobOutput {
    Written,
    Line(String),
    Released,
}

struct Job {
    id: Uuid,
    kind: JobKind,
    selector: Option<Vec<u8>>,
    reply: oneshot::Sender<AppResult<JobOutput>>,
}

/// Two FIFO queues, HIGH drained first.
struct JobQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
}

struct QueueState<T> {
    high: VecDeque<T>,
    low: VecDeque<T>,
    closed: bool,
}

impl<T> JobQueue<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                high: VecDeque::new(),
                low: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands the item back if the queue has been closed.
    fn push(&self, priority: Priority, item: T) -> Result<(), T> {
        let mut state = self.lock();
        if state.closed {
            return Err(item);
        }
        match priority {
            Priority::High => state.high.push_back(item),
            Priority::Low => state.low.push_back(item),
        }
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Blocks until an item is available. `None` once closed.
    fn pop(&self) -> Option<T> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(item) = state.high.pop_front().or_else(|| state.low.pop_front()) {
                return Some(item);
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Refuses further pushes and returns whatever was still queued.
    fn close(&self) -> Vec<T> {
        let mut state = self.lock();
        state.closed = true;
        let QueueState { high, low, .. } = &mut *state;
        high.drain(..).chain(low.drain(..)).collect()
    }
}

struct PortEntry {
    clients: usize,
    queue: Arc<JobQueue<Job>>,
    worker: JoinHandle<()>,
    settings: SerialSettings,
}

struct RegistryInner {
    ports: Mutex<HashMap<String, PortEntry>>,
    opener: Arc<dyn PortOpener>,
}

impl RegistryInner {
    fn lock_ports(&self) -> MutexGuard<'_, HashMap<String, PortEntry>> {
        self.ports.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Process-wide map of open ports to their workers.
///
/// Cloning shares the same registry.
#[derive(Clone)]
pub struct PortRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for PortRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortRegistry")
            .field("ports", &self.open_ports())
            .finish()
    }
}

impl PortRegistry {
    /// Registry opening transports through `opener`.
    pub fn new(opener: Arc<dyn PortOpener>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                ports: Mutex::new(HashMap::new()),
                opener,
            }),
        }
    }

    /// Registry backed by real serial ports.
    pub fn system() -> Self {
        Self::new(Arc::new(SystemPortOpener))
    }

    /// Bind a new handle to the worker for `settings.path`, starting one if needed.
    ///
    /// A live worker is shared and keeps the settings it was created with. When
    /// no live worker exists the port is opened first; if that fails the error
    /// is returned and nothing is registered.
    pub fn acquire_or_create(&self, settings: &SerialSettings) -> AppResult<ArbiterHandle> {
        let mut ports = self.inner.lock_ports();

        if let Some(entry) = ports.get_mut(&settings.path) {
            if !entry.worker.is_finished() {
                if entry.settings != *settings {
                    warn!(
                        port = %settings.path,
                        "port already open with different settings; keeping the original ones"
                    );
                }
                entry.clients += 1;
                debug!(port = %settings.path, clients = entry.clients, "port handle acquired");
                return Ok(ArbiterHandle::new(settings.path.clone(), entry.queue.clone()));
            }
            warn!(port = %settings.path, "discarding entry of a stopped port worker");
            ports.remove(&settings.path);
        }

        let transport = self.inner.opener.open(settings)?;
        let queue = Arc::new(JobQueue::new());
        let worker = PortWorker {
            path: settings.path.clone(),
            settle: settings.settle,
            transport: Some(transport),
            selected: None,
            queue: queue.clone(),
            registry: self.inner.clone(),
        };
        let worker = thread::Builder::new()
            .name(format!("port:{}", settings.path))
            .spawn(move || worker.run())?;

        ports.insert(
            settings.path.clone(),
            PortEntry {
                clients: 1,
                queue: queue.clone(),
                worker,
                settings: settings.clone(),
            },
        );
        info!(port = %settings.path, baud = settings.baud_rate, "port opened");

        Ok(ArbiterHandle::new(settings.path.clone(), queue))
    }

    /// Number of handles bound to `path`, if it is open.
    pub fn client_count(&self, path: &str) -> Option<usize> {
        self.inner.lock_ports().get(path).map(|entry| entry.clients)
    }

    /// Paths with a registered worker.
    pub fn open_ports(&self) -> Vec<String> {
        let mut ports: Vec<_> = self.inner.lock_ports().keys().cloned().collect();
        ports.sort();
        ports
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock_ports().is_empty()
    }
}

/// A caller's binding to one port worker.
///
/// Not `Clone`: each handle accounts for exactly one reference. Dropping a
/// handle without calling [`release`](Self::release) still queues its release.
pub struct ArbiterHandle {
    port: String,
    queue: Arc<JobQueue<Job>>,
    selector: Option<Vec<u8>>,
    released: bool,
}

impl std::fmt::Debug for ArbiterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArbiterHandle")
            .field("port", &self.port)
            .field("released", &self.released)
            .finish()
    }
}

impl ArbiterHandle {
    fn new(port: String, queue: Arc<JobQueue<Job>>) -> Self {
        Self {
            port,
            queue,
            selector: None,
            released: false,
        }
    }

    /// Address a unit on a shared bus with `selector` ahead of this handle's
    /// jobs. The worker skips it while the bus is still addressed to the unit.
    pub fn with_selector(mut self, selector: impl Into<Vec<u8>>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    /// Address this handle's unit now. A no-op job without a selector.
    pub async fn select(&self) -> AppResult<()> {
        match self.submit(JobKind::Select, Priority::Low).await? {
            JobOutput::Written => Ok(()),
            other => Err(self.unexpected(other)),
        }
    }

    /// Write `bytes` at LOW priority.
    pub async fn write(&self, bytes: impl Into<Vec<u8>>) -> AppResult<()> {
        self.submit_write(bytes, Priority::Low).await
    }

    /// Write then read one line at LOW priority.
    pub async fn query(&self, bytes: impl Into<Vec<u8>>) -> AppResult<String> {
        self.submit_query(bytes, Priority::Low).await
    }

    /// Completes once the worker has written `bytes` and waited the settle time.
    pub async fn submit_write(&self, bytes: impl Into<Vec<u8>>, priority: Priority) -> AppResult<()> {
        match self.submit(JobKind::Write(bytes.into()), priority).await? {
            JobOutput::Written => Ok(()),
            other => Err(self.unexpected(other)),
        }
    }

    /// Returns the response line without its terminator.
    pub async fn submit_query(&self, bytes: impl Into<Vec<u8>>, priority: Priority) -> AppResult<String> {
        match self.submit(JobKind::Query(bytes.into()), priority).await? {
            JobOutput::Line(line) => Ok(line),
            other => Err(self.unexpected(other)),
        }
    }

    /// Give up this binding. Runs at HIGH priority, ahead of queued LOW jobs.
    pub async fn release(mut self) -> AppResult<()> {
        self.released = true;
        match self.submit(JobKind::Release, Priority::High).await? {
            JobOutput::Released => Ok(()),
            other => Err(self.unexpected(other)),
        }
    }

    async fn submit(&self, kind: JobKind, priority: Priority) -> AppResult<JobOutput> {
        let (reply, response) = oneshot::channel();
        let id = Uuid::new_v4();
        trace!(port = %self.port, %id, ?priority, ?kind, "job queued");

        let job = Job {
            id,
            kind,
            selector: self.selector.clone(),
            reply,
        };
        self.queue
            .push(priority, job)
            .map_err(|_| LabError::Connectivity(format!("port {} is closed", self.port)))?;

        response.await.map_err(|_| {
            LabError::Connectivity(format!(
                "port {} closed before job {} ran",
                self.port, id
            ))
        })?
    }

    fn unexpected(&self, output: JobOutput) -> LabError {
        LabError::Connectivity(format!(
            "port {} answered with unexpected {:?}",
            self.port, output
        ))
    }
}

impl Drop for ArbiterHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        debug!(port = %self.port, "handle dropped without release");
        let (reply, _) = oneshot::channel();
        let job = Job {
            id: Uuid::new_v4(),
            kind: JobKind::Release,
            selector: None,
            reply,
        };
        let _ = self.queue.push(Priority::High, job);
    }
}

struct PortWorker {
    path: String,
    settle: Duration,
    transport: Option<Box<dyn SerialTransport>>,
    /// Selector last written on the bus
    selected: Option<Vec<u8>>,
    queue: Arc<JobQueue<Job>>,
    registry: Arc<RegistryInner>,
}

impl PortWorker {
    fn run(mut self) {
        debug!(port = %self.path, "port worker started");

        while let Some(job) = self.queue.pop() {
            trace!(port = %self.path, id = %job.id, "job started");
            let selector = job.selector.as_deref();
            let outcome = match job.kind {
                JobKind::Write(bytes) => self
                    .select(selector)
                    .and_then(|()| self.write(&bytes))
                    .map(|()| JobOutput::Written),
                JobKind::Query(bytes) => self
                    .select(selector)
                    .and_then(|()| self.query(&bytes))
                    .map(JobOutput::Line),
                JobKind::Select => self.select(selector).map(|()| JobOutput::Written),
                JobKind::Release => {
                    if self.release_one() {
                        let _ = job.reply.send(Ok(JobOutput::Released));
                        break;
                    }
                    Ok(JobOutput::Released)
                }
            };
            let _ = job.reply.send(outcome);
        }

        debug!(port = %self.path, "port worker stopped");
    }

    /// Returns true when this was the last binding and the port is now closed.
    fn release_one(&mut self) -> bool {
        let mut ports = self.registry.lock_ports();

        let entry = ports.get_mut(&self.path);
        debug_assert!(entry.is_some(), "release on unregistered port {}", self.path);
        let remaining = match entry {
            Some(entry) => {
                debug_assert!(entry.clients > 0, "double release on port {}", self.path);
                entry.clients = entry.clients.saturating_sub(1);
                entry.clients
            }
            None => 0,
        };

        if remaining > 0 {
            debug!(port = %self.path, clients = remaining, "port handle released");
            return false;
        }

        ports.remove(&self.path);
        let stranded = self.queue.close();
        if !stranded.is_empty() {
            warn!(port = %self.path, jobs = stranded.len(), "dropping jobs queued after final release");
        }
        // Close the device before another acquire can see the path as free
        self.transport = None;
        drop(ports);
        info!(port = %self.path, "port closed");
        true
    }

    fn transport(&mut self) -> AppResult<&mut Box<dyn SerialTransport>> {
        let path = &self.path;
        self.transport
            .as_mut()
            .ok_or_else(|| LabError::Connectivity(format!("port {} is closed", path)))
    }

    /// Address the unit a job belongs to unless the bus already is.
    fn select(&mut self, selector: Option<&[u8]>) -> AppResult<()> {
        let Some(selector) = selector else {
            // raw traffic may readdress the bus
            self.selected = None;
            return Ok(());
        };
        if self.selected.as_deref() == Some(selector) {
            return Ok(());
        }
        self.selected = None;
        self.write(selector)?;
        self.selected = Some(selector.to_vec());
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> AppResult<()> {
        let path = self.path.clone();
        self.transport()?
            .write_all(bytes)
            .map_err(|e| LabError::Connectivity(format!("write to {} failed: {}", path, e)))?;
        if !self.settle.is_zero() {
            thread::sleep(self.settle);
        }
        Ok(())
    }

    fn query(&mut self, bytes: &[u8]) -> AppResult<String> {
        let path = self.path.clone();
        if let Err(e) = self.transport()?.discard_input() {
            warn!(port = %path, error = %e, "could not discard stale input");
        }
        self.write(bytes)?;
        let line = self.transport()?.read_line().map_err(|e| match e.kind() {
            io::ErrorKind::TimedOut => LabError::Timeout(format!(
                "no reply to {} on {}",
                String::from_utf8_lossy(bytes).trim_end(),
                path
            )),
            _ => LabError::Connectivity(format!("read from {} failed: {}", path, e)),
        })?;

        let text = String::from_utf8(line)
            .map_err(|e| LabError::ProtocolParse(format!("non-UTF-8 reply on {}: {}", path, e)))?;
        Ok(text.trim_end_matches(['\r', '\n']).to_string())
    }
}
