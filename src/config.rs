// ABOUTME: Connection-level configuration consumed by the transport core
// ABOUTME: Plain data with builder-style setters; loading and parsing live in the layer above

use crate::codec::ProtocolVersion;
use std::time::Duration;

/// Options the transport core reads when opening a connection.
///
/// # Example
///
/// ```rust
/// use cql_transport::ConnectionConfig;
/// use std::time::Duration;
///
/// let config = ConnectionConfig::default()
///     .with_port(9042)
///     .with_receive_timeout(Duration::from_secs(12))
///     .with_keepalive(Duration::from_secs(60))
///     .with_credentials("cassandra", "cassandra");
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server port (default: 9042).
    pub port: u16,

    /// Receive timeout in milliseconds; 0 disables it. A fired timeout is
    /// an I/O fault and brings the whole connection down.
    pub receive_timeout_ms: u64,

    /// Send timeout in milliseconds; 0 disables it.
    pub send_timeout_ms: u64,

    /// Enable TCP keepalive probing.
    pub keepalive: bool,

    /// Keepalive idle time in milliseconds, applied when `keepalive` is on
    /// and the value is non-zero. The probe interval is fixed at 1000 ms.
    pub keepalive_time_ms: u64,

    /// Native protocol version announced in every frame header and during
    /// the handshake.
    pub version: ProtocolVersion,

    /// CQL version string sent in the startup options (default: "3.0.0").
    pub cql_version: String,

    /// Credentials for the authentication exchange, if the server asks.
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port: 9042,
            receive_timeout_ms: 0,
            send_timeout_ms: 0,
            keepalive: false,
            keepalive_time_ms: 0,
            version: ProtocolVersion::V2,
            cql_version: "3.0.0".to_string(),
            user: None,
            password: None,
        }
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Enable keepalive probing with the given idle threshold.
    pub fn with_keepalive(mut self, idle: Duration) -> Self {
        self.keepalive = true;
        self.keepalive_time_ms = idle.as_millis() as u64;
        self
    }

    pub fn with_version(mut self, version: ProtocolVersion) -> Self {
        self.version = version;
        self
    }

    pub fn with_cql_version(mut self, cql_version: impl Into<String>) -> Self {
        self.cql_version = cql_version.into();
        self
    }

    pub fn with_credentials(
        mut self,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    pub(crate) fn receive_timeout(&self) -> Option<Duration> {
        (self.receive_timeout_ms > 0).then(|| Duration::from_millis(self.receive_timeout_ms))
    }

    pub(crate) fn send_timeout(&self) -> Option<Duration> {
        (self.send_timeout_ms > 0).then(|| Duration::from_millis(self.send_timeout_ms))
    }
}
