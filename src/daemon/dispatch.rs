//! Routes request bodies to typed handlers by request name.

use super::core::DaemonCore;
use super::protocol::{decode_payload, encode_reply, split_message, Request};
use super::requests::{
    DeviceInfoRequest, ExperimentStatusRequest, HaltRequest, HelloRequest, ListDevicesRequest,
    RunSequenceRequest,
};
use crate::error::{AppResult, LabError};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Server-side behaviour of a [`Request`].
#[async_trait]
pub trait Handle: Request {
    async fn handle(self, core: &Arc<DaemonCore>) -> AppResult<Self::Response>;
}

type BoxedHandler =
    Box<dyn Fn(Arc<DaemonCore>, Vec<u8>) -> BoxFuture<'static, Option<Vec<u8>>> + Send + Sync>;

/// Name → handler table.
pub struct Dispatcher {
    handlers: HashMap<&'static str, BoxedHandler>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("requests", &self.names())
            .finish()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::standard()
    }
}

impl Dispatcher {
    /// An empty table.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Every request the daemon ships with.
    pub fn standard() -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register::<HelloRequest>();
        dispatcher.register::<ListDevicesRequest>();
        dispatcher.register::<DeviceInfoRequest>();
        dispatcher.register::<RunSequenceRequest>();
        dispatcher.register::<ExperimentStatusRequest>();
        dispatcher.register::<HaltRequest>();
        dispatcher
    }

    /// Register `R`, replacing any handler already under `R::NAME`.
    pub fn register<R: Handle>(&mut self) {
        let handler: BoxedHandler = Box::new(|core, payload| {
            async move {
                let outcome = match decode_payload::<R>(&payload) {
                    Ok(request) => request.handle(&core).await,
                    Err(err) => Err(err),
                };
                if let Err(err) = &outcome {
                    warn!(request = R::NAME, kind = err.kind(), error = %err, "request failed");
                }
                R::EXPECTS_REPLY.then(|| encode_reply(outcome))
            }
            .boxed()
        });
        self.handlers.insert(R::NAME, handler);
    }

    /// Registered request names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Handle one request body. `None` means no reply is sent.
    ///
    /// Every failure, including a panicking handler, becomes an error reply.
    pub async fn dispatch(&self, core: &Arc<DaemonCore>, message: &[u8]) -> Option<Vec<u8>> {
        let (name, payload) = match split_message(message) {
            Ok(parts) => parts,
            Err(err) => {
                warn!(error = %err, "malformed request");
                return Some(encode_reply::<()>(Err(err)));
            }
        };

        let Some(handler) = self.handlers.get(name) else {
            warn!(request = name, "unknown request type");
            return Some(encode_reply::<()>(Err(LabError::UnknownRequestType(
                name.to_string(),
            ))));
        };

        debug!(request = name, "dispatching");
        match AssertUnwindSafe(handler(Arc::clone(core), payload.to_vec()))
            .catch_unwind()
            .await
        {
            Ok(reply) => reply,
            Err(_) => {
                error!(request = name, "request handler panicked");
                Some(encode_reply::<()>(Err(LabError::Internal(format!(
                    "handler for {name} panicked"
                )))))
            }
        }
    }
}
