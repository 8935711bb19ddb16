//! # Stream Adapters
//!
//! Front ends that feed lines into dataflows and write the output back:
//!
//! - **[`StdioServer`]**: one dataflow over one ordered input stream.
//! - **[`TcpLineServer`]**: one dataflow per TCP connection.
//!
//! Both stop cooperatively through a `CancellationToken`, which
//! [`cancel_on_signal`] wires to SIGINT and SIGTERM.

/// Signal handling.
pub mod shutdown;
/// Sequential stdin/stdout adapter.
pub mod stdio;
/// Concurrent TCP adapter.
pub mod tcp;

pub use shutdown::{Signal, cancel_on_signal, wait_for_signal};
pub use stdio::{StdioConfig, StdioServer};
pub use tcp::{TcpLineServer, TcpServerConfig};
