//! # labd Core Library
//!
//! A long-running daemon that owns the lab's instruments and runs timed
//! measurement sequences on behalf of short-lived clients. The `labd` binary
//! (`main.rs`) is a thin CLI over this library.
//!
//! ## Crate Structure
//!
//! - **`config`**: YAML + environment configuration loaded with `figment`,
//!   see `config::DaemonConfig`.
//! - **`error`**: the `LabError` enum and the error kinds sent to clients.
//! - **`tracing_init`**: `tracing-subscriber` setup for the daemon and the CLI.
//! - **`serial`**: the port arbiter. One worker per serial port serializes
//!   writes and queries from every instrument sharing that port.
//! - **`hardware`**: capability traits (`Openable`, `ConnectionTestable`,
//!   `VoltageCurrentControllable`), the simulated and TDK-Lambda ZUP power
//!   supplies, and the driver registry used to build instruments from config.
//! - **`experiment`**: the `Experiment` trait, sequence files, the scheduler
//!   that drives them and CSV storage of the results.
//! - **`daemon`**: request types and handlers, the TCP server, the typed
//!   client and the PID-marker singleton lifecycle.

pub mod config;
pub mod daemon;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod serial;
pub mod tracing_init;
