// ABOUTME: Transport error taxonomy separating per-request faults from connection-fatal ones
// ABOUTME: Per-request errors leave the connection serving; any I/O or framing fault is terminal

use crate::codec::CodecError;
use std::io;
use thiserror::Error;

/// Errors surfaced by the transport core.
///
/// `Protocol`, `Decoder` and `Encoder` are scoped to a single request and
/// leave the connection serving. `Io` is terminal: every outstanding
/// request is cancelled and the failure is raised to the supervisor once.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The server answered this request with an error frame.
    #[error("server error {code:#06x}: {message}")]
    Protocol { code: i32, message: String },

    /// The caller's decoder rejected a well-formed response body.
    #[error("response decoding failed: {0}")]
    Decoder(#[source] CodecError),

    /// The caller's writer failed before anything reached the socket.
    /// No stream id was consumed.
    #[error("request encoding failed: {0}")]
    Encoder(#[source] CodecError),

    /// Socket fault, configured timeout, or framing desynchronization.
    #[error("connection error: {0}")]
    Io(#[from] io::Error),

    /// The connection closed before this request completed.
    #[error("connection closed")]
    Cancelled,

    /// The server requires authentication and the configuration carries no
    /// credentials.
    #[error("authentication required but no credentials configured")]
    InvalidCredentials,

    /// The admission queue is bounded and full.
    #[error("admission queue full")]
    Overloaded,
}

/// Result type alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
