//! The daemon: shared core, request handlers, TCP server, client and the
//! singleton lifecycle.

pub mod client;
pub mod core;
pub mod dispatch;
pub mod lifecycle;
pub mod protocol;
pub mod requests;
pub mod server;

pub use client::{Client, InProcessTransport, TcpTransport, Transport};
pub use self::core::{DaemonBuilder, DaemonCore};
pub use dispatch::{Dispatcher, Handle};
pub use lifecycle::{DetachedLauncher, PidMarker, ServerInfo, Supervisor, SysinfoProbe};
pub use protocol::Request;
pub use server::DaemonServer;
