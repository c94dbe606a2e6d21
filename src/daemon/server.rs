//! TCP front end of the daemon.
//!
//! Connections are read concurrently, but every request goes through one
//! inbound queue and is dispatched by the server loop itself, so handlers never
//! run in parallel. The loop returns once shutdown has been requested.

use super::core::DaemonCore;
use super::protocol::{read_frame, write_frame};
use crate::error::AppResult;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Requests waiting for the server loop.
const INBOUND_QUEUE_DEPTH: usize = 64;

struct Inbound {
    message: Vec<u8>,
    reply: oneshot::Sender<Option<Vec<u8>>>,
}

/// A bound, not yet serving, daemon endpoint.
#[derive(Debug)]
pub struct DaemonServer {
    listener: TcpListener,
}

impl DaemonServer {
    pub async fn bind(address: &str) -> AppResult<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self { listener })
    }

    /// Actual address, useful after binding port 0.
    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until a `Halt` request (or [`DaemonCore::request_shutdown`]).
    pub async fn serve(self, core: Arc<DaemonCore>) -> AppResult<()> {
        let address = self.local_addr()?;
        let (inbound_tx, mut inbound_rx) = mpsc::channel::<Inbound>(INBOUND_QUEUE_DEPTH);
        let mut shutdown = core.shutdown_signal();
        info!(%address, "daemon listening");

        while !*shutdown.borrow() {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        let inbound = inbound_tx.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_connection(socket, peer, inbound).await {
                                warn!(%peer, error = %err, "client connection failed");
                            }
                        });
                    }
                    Err(err) => error!(error = %err, "accept failed"),
                },
                Some(inbound) = inbound_rx.recv() => {
                    let reply = core.dispatch(&inbound.message).await;
                    // the client may have gone away already
                    let _ = inbound.reply.send(reply);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        core.remove_pid_marker();
        info!(%address, "daemon stopped");
        Ok(())
    }
}

async fn handle_connection(
    mut socket: TcpStream,
    peer: SocketAddr,
    inbound: mpsc::Sender<Inbound>,
) -> io::Result<()> {
    debug!(%peer, "client connected");
    while let Some(message) = read_frame(&mut socket).await? {
        let (reply_tx, reply_rx) = oneshot::channel();
        let queued = Inbound {
            message,
            reply: reply_tx,
        };
        if inbound.send(queued).await.is_err() {
            break;
        }
        match reply_rx.await {
            Ok(Some(body)) => write_frame(&mut socket, &body).await?,
            Ok(None) => {}
            Err(_) => break,
        }
    }
    debug!(%peer, "client disconnected");
    Ok(())
}
