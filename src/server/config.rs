//! Listener configuration

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Port the HTTP listener binds when none is given
pub const DEFAULT_HTTP_PORT: u16 = 62080;

/// Listener configuration options
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Maximum concurrent HTTP clients (0 = unlimited)
    pub max_clients: usize,

    /// Enable TCP_NODELAY on accepted sockets
    pub tcp_nodelay: bool,

    /// Time allowed for the client to send its request head
    pub request_timeout: Duration,

    /// Largest request head read before giving up on the terminator
    pub max_request_size: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_HTTP_PORT)),
            max_clients: 0,
            tcp_nodelay: true,
            request_timeout: Duration::from_secs(5),
            max_request_size: 8 * 1024,
        }
    }
}

impl ListenerConfig {
    /// Create a new config with custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set maximum concurrent clients
    pub fn max_clients(mut self, max: usize) -> Self {
        self.max_clients = max;
        self
    }

    /// Set the request head timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ListenerConfig::default();

        assert_eq!(config.bind_addr.port(), DEFAULT_HTTP_PORT);
        assert_eq!(config.max_clients, 0);
        assert!(config.tcp_nodelay);
    }

    #[test]
    fn test_with_addr() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let config = ListenerConfig::with_addr(addr);

        assert_eq!(config.bind_addr, addr);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_builder_chaining() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let config = ListenerConfig::default()
            .bind(addr)
            .max_clients(4)
            .request_timeout(Duration::from_millis(500))
            .tcp_nodelay(false);

        assert_eq!(config.bind_addr, addr);
        assert_eq!(config.max_clients, 4);
        assert_eq!(config.request_timeout, Duration::from_millis(500));
        assert!(!config.tcp_nodelay);
    }
}
