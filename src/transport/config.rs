use crate::proto::frame::DEFAULT_MAX_FRAME_LENGTH;
use std::net::SocketAddr;
use std::time::Duration;

/// Per-connection tuning shared by clients and servers
///
/// # Examples
///
/// ```
/// use echorpc::transport::ConnectionConfig;
///
/// let config = ConnectionConfig::default().with_call_buffer(4);
/// assert_eq!(config.call_buffer, 4);
/// assert_eq!(config.outbound_buffer, 64);
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Messages each call may have in flight towards this end; also the
    /// size of the call's inbound queue
    pub call_buffer: usize,
    /// Frames queued for the connection writer before senders wait
    pub outbound_buffer: usize,
    /// Largest accepted encoded frame
    pub max_frame_length: usize,
}

impl ConnectionConfig {
    pub fn with_call_buffer(mut self, call_buffer: usize) -> Self {
        self.call_buffer = call_buffer.max(1);
        self
    }

    pub fn with_outbound_buffer(mut self, outbound_buffer: usize) -> Self {
        self.outbound_buffer = outbound_buffer.max(1);
        self
    }

    /// Flow-control window granted to the peer on every call
    pub(crate) fn window(&self) -> u32 {
        u32::try_from(self.call_buffer.max(1)).unwrap_or(u32::MAX)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            call_buffer: 32,
            outbound_buffer: 64,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

/// Configuration for RPC servers
///
/// # Examples
///
/// ```
/// use echorpc::transport::ServerConfig;
///
/// let config = ServerConfig::default();
/// assert_eq!(config.service, "echo");
/// assert_eq!(config.max_connections, 100);
/// ```
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to
    pub bind_addr: SocketAddr,
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Service name that prefixes every method path
    pub service: String,
    /// Per-connection tuning
    pub connection: ConnectionConfig,
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            max_connections: 100,
            service: "echo".to_string(),
            connection: ConnectionConfig::default(),
        }
    }
}

/// Transport security requested when dialing
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SecurityMode {
    #[default]
    Plaintext,
    Tls {
        /// Name to verify the server certificate against instead of the host
        server_name_override: Option<String>,
        /// Accept any server certificate
        skip_verify: bool,
    },
}

/// Options applied when a client dials a server
///
/// # Examples
///
/// ```
/// use echorpc::transport::{DialOptions, SecurityMode};
///
/// let options = DialOptions::default().with_authority("echo.example.com");
/// assert_eq!(options.security, SecurityMode::Plaintext);
/// assert_eq!(options.authority.as_deref(), Some("echo.example.com"));
/// ```
#[derive(Debug, Clone)]
pub struct DialOptions {
    pub security: SecurityMode,
    /// Host name sent with every call in place of the dialed address
    pub authority: Option<String>,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Per-connection tuning
    pub connection: ConnectionConfig,
}

impl DialOptions {
    pub fn with_security(mut self, security: SecurityMode) -> Self {
        self.security = security;
        self
    }

    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = Some(authority.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            security: SecurityMode::Plaintext,
            authority: None,
            connect_timeout: Duration::from_secs(10),
            connection: ConnectionConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_builder() {
        let config = ServerConfig::new("0.0.0.0:8080".parse().unwrap())
            .with_max_connections(200)
            .with_service("ping")
            .with_connection(ConnectionConfig::default().with_call_buffer(0));

        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.max_connections, 200);
        assert_eq!(config.service, "ping");
        // Zero-capacity queues are not allowed
        assert_eq!(config.connection.call_buffer, 1);
    }

    #[test]
    fn test_dial_options_builder() {
        let options = DialOptions::default()
            .with_security(SecurityMode::Tls {
                server_name_override: None,
                skip_verify: true,
            })
            .with_connect_timeout(Duration::from_millis(250));

        assert!(matches!(
            options.security,
            SecurityMode::Tls {
                skip_verify: true,
                ..
            }
        ));
        assert_eq!(options.connect_timeout, Duration::from_millis(250));
    }
}
