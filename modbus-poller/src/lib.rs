//! Modbus TCP connection pooling, network discovery and periodic polling based on [tokio-modbus](https://github.com/slowtec/tokio-modbus).

//! ## Building blocks
//!
//! - [`connection::ConnectionManager`] keeps one session per device key (`host:port:unit_id`), dials each key at most once at a time
//!   and serializes requests on a session,
//! - [`discovery::Scanner`] probes every host of the local `/24` networks for an open Modbus TCP port with a bounded number of workers,
//! - [`poller::Poller`] runs fixed-rate poll tasks that never overlap themselves and publish into a [`poller::PollSink`],
//! - [`registry::DeviceRegistry`] is the in-memory device list and the sink the poller publishes into,
//! - [`api::ModbusApi`] is the validated operation surface a presentation layer calls.
//!
//! ## Validation
//!
//! Raw parameters (see [`request`]) use wide integers and are checked before any I/O:
//! - `unit_id` within `1..=247` (default `1`), `port` at least `1` (default `502`),
//! - coils and discrete inputs read at most `200` items, registers at most `125`,
//! - `address + length` stays within the `65536` address space,
//! - register values within `0..=65535`, scan timeout within `100..=5000` ms (default `500`).
//!
//! ## Simulator
//!
//! The `simulator` feature (on by default) provides in-memory devices behind the same connector and prober traits,
//! used by the tests and the command line `--simulated` mode.

/// Validated operation surface and the possibly absent capability handle
pub mod api;
/// Value types of the Modbus data spaces
pub mod codec;
/// TOML configuration with humantime durations
pub mod config;
/// Keyed session pool
pub mod connection;
/// Local network scan for Modbus TCP endpoints
pub mod discovery;
/// Error taxonomy
pub mod error;
/// Endpoint identity and device keys
pub mod identity;
/// Fixed-rate polling tasks
pub mod poller;
/// Device list and latest samples
pub mod registry;
/// Raw parameters and their validation
pub mod request;
/// Session and connector traits with the tokio-modbus TCP implementation
pub mod transport;

/// In-memory devices, connector and prober (based on the tokio-modbus [server examples](https://github.com/slowtec/tokio-modbus/tree/main/examples))
#[cfg(any(test, feature = "simulator"))]
pub mod simulator;

pub use error::{Error, Result};
