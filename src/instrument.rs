// ABOUTME: Client-side trace events emitted around the request lifecycle
// ABOUTME: Implement Instrumentation to feed metric or trace sinks; tokens correlate events per request

use std::fmt;
use tracing::debug;
use uuid::Uuid;

/// Opaque request-correlation identifier.
///
/// The caller picks the value; the transport only echoes it with every
/// trace event for the request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RequestToken(pub u64);

impl fmt::Display for RequestToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Lifecycle points crossed by the write and read pumps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceEvent {
    BeginWrite,
    EndWrite,
    BeginRead,
    EndRead,
    Cancellation,
}

/// Sink for per-request trace events.
pub trait Instrumentation: Send + Sync {
    /// A request crossed one of the pump lifecycle points.
    fn client_trace(&self, token: RequestToken, event: TraceEvent);

    /// The server attached a tracing session to this request's response.
    /// The layer above owns the follow-up query that resolves the session;
    /// the default drops the id.
    fn server_trace(&self, token: RequestToken, tracing_id: Uuid) {
        let _ = (token, tracing_id);
    }
}

/// Forwards every event to the `tracing` dispatcher at debug level.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogInstrumentation;

impl Instrumentation for LogInstrumentation {
    fn client_trace(&self, token: RequestToken, event: TraceEvent) {
        debug!(%token, ?event, "client trace");
    }

    fn server_trace(&self, token: RequestToken, tracing_id: Uuid) {
        debug!(%token, %tracing_id, "server trace");
    }
}

/// Discards every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullInstrumentation;

impl Instrumentation for NullInstrumentation {
    fn client_trace(&self, _token: RequestToken, _event: TraceEvent) {}
}
