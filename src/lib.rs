#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

/// The command line interface.
pub mod cli;

/// Relates to config files and persisted device configurations.
pub mod config;

/// The connection capability: real serial hardware, a loopback mock, and a
/// disabled no-op, plus the factory that picks between them.
pub mod connection;

/// The message and event data types used on the sensor's wire.
pub mod device;

/// Possible errors in this library.
pub mod error;

/// Bridges the active connection's events onto subscriber queues.
pub(crate) mod fanout;

/// Logging/tracing setup.
pub mod logging;

/// The connection manager: owns the active connection, swaps it on reload,
/// supervises its I/O loop.
pub mod manager;

/// Port option validation.
pub mod options;

/// Code relating to setting up the HTTP/websocket surface.
pub mod server;

/// The persistence boundary the reload path reads from.
pub mod store;
