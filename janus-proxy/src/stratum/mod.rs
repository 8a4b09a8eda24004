//! Stratum v1 wire protocol.
//!
//! Stratum v1 is line-delimited JSON-RPC over TCP: one JSON object per
//! line, terminated by `\n`. Messages are classified as requests (have a
//! `method` and a non-null `id`), responses (have an `id` matching a prior
//! request), or notifications (`method` present, `id` null or absent).
//!
//! The proxy speaks the protocol in both directions: as a client toward
//! the upstream pools and as a server toward downstream miners. Both
//! directions share the [`JsonRpcMessage`] envelope and the framed
//! [`Connection`] transport.

mod connection;
mod error;
mod messages;

pub use connection::{connect, Connection, Transport};
pub use error::{StratumError, StratumResult};
pub use messages::{error_codes, parse_error_array, JsonRpcMessage};

#[cfg(test)]
pub(crate) use connection::{MockTransport, MockTransportHandle};

/// Maximum accepted line length. Longer lines are a protocol violation
/// and close the connection.
pub const MAX_LINE_BYTES: usize = 64 * 1024;
