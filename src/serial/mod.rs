//! Serialized access to serial-connected instruments.

pub mod arbiter;
pub mod transport;

pub use arbiter::{ArbiterHandle, PortRegistry, Priority};
pub use transport::{Parity, PortOpener, SerialSettings, SerialTransport, SystemPortOpener};
