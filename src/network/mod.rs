//! Network module - Readiness-driven TCP reactors
//!
//! Provides:
//! - Server reactor multiplexing many sessions on one thread
//! - Client reactor driving a single outbound connection
//! - Sessions, and the method router that dispatches decoded frames

mod client;
mod router;
mod server;
mod session;

pub use client::*;
pub use router::*;
pub use server::*;
pub use session::*;

#[cfg(test)]
pub(crate) use session::test_support;

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use crate::protocol::DEFAULT_MAX_FRAME_SIZE;

/// Configuration for reactor operations
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Upper bound on each multiplexer wait. `None` blocks until an event
    /// arrives, `Some(Duration::ZERO)` polls without waiting.
    pub poll_timeout: Option<Duration>,
    /// Number of readiness events fetched per wait
    pub events_capacity: usize,
    /// Largest payload accepted from a peer
    pub max_frame_size: usize,
    /// Bytes drained from one socket per servicing step
    pub read_budget: usize,
    /// Timeout for the client's connecting handshake
    pub connect_timeout: Option<Duration>,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            poll_timeout: None,
            events_capacity: 256,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            read_budget: DEFAULT_READ_BUDGET,
            connect_timeout: Some(Duration::from_millis(5000)),
        }
    }
}

impl ReactorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Option<Duration>) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn with_read_budget(mut self, read_budget: usize) -> Self {
        self.read_budget = read_budget;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Option<Duration>) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

/// Resolve a hostname to a socket address
pub fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    let mut addrs = (host, port).to_socket_addrs()?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_loopback() {
        let addr = resolve_host("127.0.0.1", 5555).unwrap();
        assert_eq!(addr.port(), 5555);
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn test_config_builders() {
        let config = ReactorConfig::new()
            .with_poll_timeout(Some(Duration::ZERO))
            .with_max_frame_size(1024)
            .with_read_budget(4096);
        assert_eq!(config.poll_timeout, Some(Duration::ZERO));
        assert_eq!(config.max_frame_size, 1024);
        assert_eq!(config.read_budget, 4096);
        assert_eq!(config.events_capacity, 256);
        assert_eq!(ReactorConfig::default().read_budget, DEFAULT_READ_BUDGET);
    }
}
