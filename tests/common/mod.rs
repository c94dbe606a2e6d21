//! Shared fixtures for the integration tests
//!
//! `SimWire` stands in for the serial hardware: it opens fake transports,
//! records every command written to them and answers queries through a
//! responder closure.

#![allow(dead_code)]

use labd::error::{AppResult, LabError};
use labd::serial::{PortOpener, PortRegistry, SerialSettings, SerialTransport};
use std::collections::VecDeque;
use std::io;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Responder = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

struct WireState {
    log: Vec<String>,
    opens: usize,
    closes: usize,
    fail_open: bool,
    responder: Responder,
    gate: Option<mpsc::Receiver<()>>,
    late_prefix: Option<String>,
}

/// Simulated serial bus shared by every port it opens.
#[derive(Clone)]
pub struct SimWire {
    state: Arc<Mutex<WireState>>,
}

impl SimWire {
    /// `responder` maps a written command to the line the device sends back;
    /// `None` means the device stays silent.
    pub fn new(responder: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            state: Arc::new(Mutex::new(WireState {
                log: Vec::new(),
                opens: 0,
                closes: 0,
                fail_open: false,
                responder: Arc::new(responder),
                gate: None,
                late_prefix: None,
            })),
        }
    }

    /// Answers `cmd?` with `re:cmd?`; anything else is a silent write.
    pub fn echo() -> Self {
        Self::new(|cmd| cmd.ends_with('?').then(|| format!("re:{cmd}")))
    }

    /// Behaves like a ZUP at 8 V / 3 A into a 5 Ω load.
    pub fn zup() -> Self {
        Self::new(zup_reply)
    }

    pub fn registry(&self) -> PortRegistry {
        PortRegistry::new(Arc::new(self.clone()))
    }

    pub fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn opens(&self) -> usize {
        self.state.lock().unwrap().opens
    }

    pub fn closes(&self) -> usize {
        self.state.lock().unwrap().closes
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.state.lock().unwrap().fail_open = fail;
    }

    /// Replies to commands starting with `prefix` only show up after the
    /// reader has given up on them.
    pub fn delay_replies_to(&self, prefix: &str) {
        self.state.lock().unwrap().late_prefix = Some(prefix.to_string());
    }

    /// The next write of a command starting with `HOLD` blocks the port worker
    /// until the returned sender fires.
    pub fn hold(&self) -> mpsc::Sender<()> {
        let (release, gate) = mpsc::channel();
        self.state.lock().unwrap().gate = Some(gate);
        release
    }
}

pub fn zup_reply(cmd: &str) -> Option<String> {
    let reply = match cmd {
        ":MDL?;" => "NEMIC-LAMBDA ZUP(36V-6A)",
        ":REV?;" => "Ver 36-6 1.1",
        ":STA?;" => "OS00000000",
        ":OUT?;" => "OT1",
        ":VOL!;" => "SV08.000",
        ":VOL?;" => "AV07.998",
        ":CUR!;" => "SA3.000",
        ":CUR?;" => "AA1.600",
        _ => return None,
    };
    Some(reply.to_string())
}

impl PortOpener for SimWire {
    fn open(&self, settings: &SerialSettings) -> AppResult<Box<dyn SerialTransport>> {
        let mut state = self.state.lock().unwrap();
        if state.fail_open {
            return Err(LabError::Connectivity(format!(
                "cannot open {}: no such device",
                settings.path
            )));
        }
        state.opens += 1;
        Ok(Box::new(SimTransport {
            wire: self.clone(),
            pending: VecDeque::new(),
            late: VecDeque::new(),
        }))
    }
}

struct SimTransport {
    wire: SimWire,
    pending: VecDeque<Vec<u8>>,
    late: VecDeque<Vec<u8>>,
}

impl SerialTransport for SimTransport {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let command = String::from_utf8_lossy(bytes).into_owned();
        let (responder, gate, late) = {
            let mut state = self.wire.state.lock().unwrap();
            state.log.push(command.clone());
            let gate = if command.starts_with("HOLD") {
                state.gate.take()
            } else {
                None
            };
            let late = state
                .late_prefix
                .as_deref()
                .is_some_and(|prefix| command.starts_with(prefix));
            (state.responder.clone(), gate, late)
        };

        if let Some(gate) = gate {
            let _ = gate.recv_timeout(Duration::from_secs(5));
        }
        if let Some(reply) = responder(&command) {
            let line = format!("{reply}\r\n").into_bytes();
            if late {
                self.late.push_back(line);
            } else {
                self.pending.push_back(line);
            }
        }
        Ok(())
    }

    fn read_line(&mut self) -> io::Result<Vec<u8>> {
        match self.pending.pop_front() {
            Some(line) => Ok(line),
            None => {
                // whatever was late arrives right after the deadline
                self.pending.extend(self.late.drain(..));
                Err(io::Error::new(io::ErrorKind::TimedOut, "device did not answer"))
            }
        }
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.pending.clear();
        Ok(())
    }
}

impl Drop for SimTransport {
    fn drop(&mut self) {
        self.wire.state.lock().unwrap().closes += 1;
    }
}

/// Wait up to a second for `condition`, polling every few milliseconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
