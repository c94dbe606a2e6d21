//! Singleton daemon lifecycle.
//!
//! A running daemon is recorded by a PID marker file holding its process id as
//! decimal text. [`Supervisor::start`] reuses a daemon whose marker names a live
//! process and otherwise launches a detached one. A marker naming a dead or
//! zombie process is stale and ignored.

use crate::config::DaemonConfig;
use crate::error::{AppResult, LabError};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tracing::{debug, info, warn};

/// The PID marker file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidMarker {
    path: PathBuf,
}

impl PidMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn for_config(config: &DaemonConfig) -> Self {
        Self::new(config.pid_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Recorded PID. A missing or unparsable marker reads as `None`.
    pub fn read(&self) -> AppResult<Option<u32>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match text.trim().parse() {
            Ok(pid) => Ok(Some(pid)),
            Err(_) => {
                warn!(path = %self.path.display(), "ignoring malformed pid marker");
                Ok(None)
            }
        }
    }

    pub fn write(&self, pid: u32) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, pid.to_string())?;
        debug!(path = %self.path.display(), pid, "pid marker written");
        Ok(())
    }

    /// Delete the marker; a missing marker is fine.
    pub fn remove(&self) -> AppResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// PID of a live process recorded in the marker.
    pub fn live_pid(&self, probe: &dyn ProcessProbe) -> AppResult<Option<u32>> {
        Ok(self.read()?.filter(|pid| probe.is_alive(*pid)))
    }

    /// Record `pid` unless another live process already holds the marker.
    pub fn claim(&self, pid: u32, probe: &dyn ProcessProbe) -> AppResult<()> {
        if let Some(holder) = self.live_pid(probe)? {
            if holder != pid {
                return Err(LabError::Configuration(format!(
                    "a daemon is already running with pid {holder} ({})",
                    self.path.display()
                )));
            }
        }
        self.write(pid)
    }
}

/// Answers whether a process id belongs to a running process.
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Process table lookup through `sysinfo`. Zombies count as dead.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoProbe;

impl ProcessProbe for SysinfoProbe {
    fn is_alive(&self, pid: u32) -> bool {
        let pid = Pid::from_u32(pid);
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system
            .process(pid)
            .is_some_and(|process| process.status() != ProcessStatus::Zombie)
    }
}

/// Starts a daemon process and returns its PID.
pub trait Launcher: Send + Sync {
    fn launch(&self) -> AppResult<u32>;
}

/// Re-runs the current executable as `serve`, detached, logging to a file.
#[derive(Debug, Clone)]
pub struct DetachedLauncher {
    program: PathBuf,
    args: Vec<OsString>,
    log_path: PathBuf,
}

impl DetachedLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>, log_path: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            log_path: log_path.into(),
        }
    }

    /// `<current exe> --config <config_path> serve`
    pub fn for_config(config_path: &Path, config: &DaemonConfig) -> AppResult<Self> {
        let program = std::env::current_exe()?;
        let args = vec![
            OsString::from("--config"),
            config_path.as_os_str().to_owned(),
            OsString::from("serve"),
        ];
        Ok(Self::new(program, args, config.log_path()))
    }
}

impl Launcher for DetachedLauncher {
    fn launch(&self) -> AppResult<u32> {
        if let Some(parent) = self.log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let child = command.spawn().map_err(|e| {
            LabError::Connectivity(format!(
                "failed to launch {}: {}",
                self.program.display(),
                e
            ))
        })?;
        info!(pid = child.id(), log = %self.log_path.display(), "daemon launched");
        Ok(child.id())
    }
}

/// Result of [`Supervisor::start`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub address: String,
    /// `true` when an already running daemon was found
    pub existing: bool,
    pub pid: u32,
}

/// Finds or launches the singleton daemon.
#[derive(Debug)]
pub struct Supervisor<L, P = SysinfoProbe> {
    marker: PidMarker,
    address: String,
    launcher: L,
    probe: P,
}

impl<L: Launcher, P: ProcessProbe> Supervisor<L, P> {
    pub fn new(config: &DaemonConfig, launcher: L, probe: P) -> Self {
        Self {
            marker: PidMarker::for_config(config),
            address: config.daemon.address.clone(),
            launcher,
            probe,
        }
    }

    pub fn marker(&self) -> &PidMarker {
        &self.marker
    }

    /// PID of the running daemon, if there is one.
    pub fn running_pid(&self) -> AppResult<Option<u32>> {
        self.marker.live_pid(&self.probe)
    }

    /// Reuse the live daemon or launch a new one and record its PID.
    pub fn start(&self) -> AppResult<ServerInfo> {
        if let Some(pid) = self.running_pid()? {
            info!(pid, address = %self.address, "daemon already running");
            return Ok(ServerInfo {
                address: self.address.clone(),
                existing: true,
                pid,
            });
        }

        if self.marker.read()?.is_some() {
            debug!(path = %self.marker.path().display(), "removing stale pid marker");
        }
        self.marker.remove()?;

        let pid = self.launcher.launch()?;
        self.marker.write(pid)?;
        Ok(ServerInfo {
            address: self.address.clone(),
            existing: false,
            pid,
        })
    }
}
