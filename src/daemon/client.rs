//! Typed client for the daemon.
//!
//! ```no_run
//! use labd::daemon::Client;
//! use std::time::Duration;
//!
//! # async fn demo() -> labd::error::AppResult<()> {
//! let client = Client::connect("127.0.0.1:14337", Duration::from_secs(5)).await?;
//! println!("{}", client.hello().await?);
//! # Ok(())
//! # }
//! ```

use super::core::DaemonCore;
use super::protocol::{decode_reply, encode_request, read_frame, write_frame, Request};
use super::requests::{
    DeviceInfoRequest, DeviceInfoResponse, DeviceStatus, ExperimentStatusRequest, HaltRequest,
    HelloRequest, ListDevicesRequest, RunSequenceRequest, RunSequenceResponse,
};
use crate::error::{AppResult, LabError};
use crate::experiment::SequenceStatus;
use async_trait::async_trait;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

/// Moves request bodies to a daemon and reply bodies back.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for its reply.
    async fn exchange(&self, message: Vec<u8>) -> AppResult<Vec<u8>>;

    /// Send a request that is never answered.
    async fn send(&self, message: Vec<u8>) -> AppResult<()>;
}

/// Length-prefixed frames over one TCP connection.
///
/// A failed or timed-out exchange drops the connection, since a late reply
/// could still arrive on it; the next exchange connects again.
#[derive(Debug)]
pub struct TcpTransport {
    address: String,
    timeout: Duration,
    stream: Mutex<Option<TcpStream>>,
}

impl TcpTransport {
    /// Connect to `address`; `timeout` bounds the connect and every exchange.
    pub async fn connect(address: &str, timeout: Duration) -> AppResult<Self> {
        let stream = open_stream(address, timeout).await?;
        Ok(Self {
            address: address.to_string(),
            timeout,
            stream: Mutex::new(Some(stream)),
        })
    }

    /// Hand back the connection after an operation, or drop it if the
    /// operation failed.
    fn settle<T>(&self, slot: &mut Option<TcpStream>, stream: TcpStream, outcome: &AppResult<T>) {
        match outcome {
            Ok(_) => *slot = Some(stream),
            Err(err) => debug!(address = %self.address, error = %err, "dropping daemon link"),
        }
    }
}

async fn open_stream(address: &str, timeout: Duration) -> AppResult<TcpStream> {
    let stream = with_deadline(timeout, address, "connect", async {
        TcpStream::connect(address).await.map_err(|e| {
            LabError::Connectivity(format!("cannot reach daemon at {address}: {e}"))
        })
    })
    .await?;
    debug!(address, "connected to daemon");
    Ok(stream)
}

async fn with_deadline<T>(
    timeout: Duration,
    address: &str,
    what: &str,
    operation: impl Future<Output = AppResult<T>>,
) -> AppResult<T> {
    tokio::time::timeout(timeout, operation)
        .await
        .map_err(|_| {
            LabError::Timeout(format!(
                "{what} with daemon at {address} exceeded {timeout:?}"
            ))
        })?
}

fn link_error(address: &str, err: std::io::Error) -> LabError {
    LabError::Connectivity(format!("daemon link {address}: {err}"))
}

#[async_trait]
impl Transport for TcpTransport {
    async fn exchange(&self, message: Vec<u8>) -> AppResult<Vec<u8>> {
        let mut slot = self.stream.lock().await;
        let mut stream = match slot.take() {
            Some(stream) => stream,
            None => open_stream(&self.address, self.timeout).await?,
        };
        let outcome = with_deadline(self.timeout, &self.address, "request", async {
            write_frame(&mut stream, &message)
                .await
                .map_err(|e| link_error(&self.address, e))?;
            read_frame(&mut stream)
                .await
                .map_err(|e| link_error(&self.address, e))?
                .ok_or_else(|| {
                    LabError::Connectivity(format!(
                        "daemon at {} closed the connection",
                        self.address
                    ))
                })
        })
        .await;
        self.settle(&mut slot, stream, &outcome);
        outcome
    }

    async fn send(&self, message: Vec<u8>) -> AppResult<()> {
        let mut slot = self.stream.lock().await;
        let mut stream = match slot.take() {
            Some(stream) => stream,
            None => open_stream(&self.address, self.timeout).await?,
        };
        let outcome = with_deadline(self.timeout, &self.address, "send", async {
            write_frame(&mut stream, &message)
                .await
                .map_err(|e| link_error(&self.address, e))
        })
        .await;
        self.settle(&mut slot, stream, &outcome);
        outcome
    }
}

/// Calls straight into a [`DaemonCore`] in the same process.
#[derive(Debug, Clone)]
pub struct InProcessTransport {
    core: Arc<DaemonCore>,
}

impl InProcessTransport {
    pub fn new(core: Arc<DaemonCore>) -> Self {
        Self { core }
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn exchange(&self, message: Vec<u8>) -> AppResult<Vec<u8>> {
        self.core
            .dispatch(&message)
            .await
            .ok_or_else(|| LabError::ProtocolParse("request produced no reply".into()))
    }

    async fn send(&self, message: Vec<u8>) -> AppResult<()> {
        self.core.dispatch(&message).await;
        Ok(())
    }
}

/// Typed request methods over any [`Transport`].
#[derive(Debug)]
pub struct Client<T = TcpTransport> {
    transport: T,
}

impl Client<TcpTransport> {
    pub async fn connect(address: &str, timeout: Duration) -> AppResult<Self> {
        Ok(Self::new(TcpTransport::connect(address, timeout).await?))
    }
}

impl Client<InProcessTransport> {
    pub fn in_process(core: Arc<DaemonCore>) -> Self {
        Self::new(InProcessTransport::new(core))
    }
}

impl<T: Transport> Client<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Send `request` and decode its reply; error replies become
    /// [`LabError::Remote`] carrying the daemon's error kind.
    pub async fn call<R: Request>(&self, request: &R) -> AppResult<R::Response> {
        if !R::EXPECTS_REPLY {
            return Err(LabError::ProtocolParse(format!(
                "{} is never answered; use notify",
                R::NAME
            )));
        }
        let body = self.transport.exchange(encode_request(request)?).await?;
        decode_reply(&body)
    }

    /// Send `request` without waiting for anything.
    pub async fn notify<R: Request>(&self, request: &R) -> AppResult<()> {
        self.transport.send(encode_request(request)?).await
    }

    pub async fn hello(&self) -> AppResult<String> {
        Ok(self.call(&HelloRequest).await?.content)
    }

    pub async fn list_devices(&self) -> AppResult<Vec<DeviceStatus>> {
        Ok(self.call(&ListDevicesRequest).await?.devices)
    }

    pub async fn device_info(&self, name: &str) -> AppResult<DeviceInfoResponse> {
        self.call(&DeviceInfoRequest {
            name: name.to_string(),
        })
        .await
    }

    /// `sequence_path` is resolved on the daemon's side.
    pub async fn run_sequence(&self, sequence_path: impl Into<PathBuf>) -> AppResult<RunSequenceResponse> {
        self.call(&RunSequenceRequest {
            sequence_path: sequence_path.into(),
        })
        .await
    }

    pub async fn experiment_status(&self) -> AppResult<Option<SequenceStatus>> {
        Ok(self.call(&ExperimentStatusRequest).await?.sequence_status)
    }

    pub async fn halt(&self) -> AppResult<()> {
        self.notify(&HaltRequest).await
    }
}

/// Poll `address` with `Hello` until it answers or `deadline` passes.
pub async fn wait_until_ready(address: &str, deadline: Duration) -> AppResult<()> {
    let started = tokio::time::Instant::now();
    let attempt_timeout = deadline.min(Duration::from_secs(1));
    loop {
        let attempt = async {
            let client = Client::connect(address, attempt_timeout).await?;
            client.hello().await
        };
        match attempt.await {
            Ok(_) => return Ok(()),
            Err(err) if started.elapsed() >= deadline => {
                return Err(LabError::Timeout(format!(
                    "daemon at {address} not ready after {deadline:?}: {err}"
                )))
            }
            Err(err) => {
                debug!(address, error = %err, "daemon not ready yet");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
