//! Transport core for the CQL native protocol.
//!
//! One [`Connection`] owns one long-lived TCP socket and multiplexes up to
//! 128 concurrently outstanding requests over it, one stream id each. The
//! caller supplies a *writer capability* that serializes the request body
//! and a *decode capability* that turns the response body into a lazy
//! finite sequence of items, delivered through a push-based
//! [`ResponseSink`].
//!
//! # Example
//!
//! ```rust,no_run
//! use cql_transport::{Connection, ConnectionConfig, NullInstrumentation, Opcode, RequestToken};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConnectionConfig::default().with_port(9042);
//!     let connection =
//!         Connection::open("127.0.0.1".parse()?, &config, Arc::new(NullInstrumentation)).await?;
//!
//!     // Ask the server which options it supports.
//!     let mut done = false;
//!     let supported = connection
//!         .round_trip(
//!             |w| {
//!                 w.set_opcode(Opcode::Options);
//!                 Ok(())
//!             },
//!             move |r| {
//!                 if done {
//!                     return Ok(None);
//!                 }
//!                 done = true;
//!                 r.read_string_multimap().map(Some)
//!             },
//!             RequestToken(1),
//!         )
//!         .await?;
//!
//!     for (option, values) in supported.into_iter().flatten() {
//!         println!("{option}: {}", values.join(", "));
//!     }
//!
//!     connection.close();
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod instrument;
mod queue;
pub mod sink;
mod streams;


// Re-export the surface most callers touch directly.
pub use codec::{CodecError, FrameHeader, FrameReader, FrameWriter, Opcode, ProtocolVersion};
pub use config::ConnectionConfig;
pub use connection::Connection;
pub use error::{TransportError, TransportResult};
pub use instrument::{
    Instrumentation, LogInstrumentation, NullInstrumentation, RequestToken, TraceEvent,
};
pub use sink::{CollectSink, ResponseSink};
pub use streams::STREAM_IDS;
