//! # Client Configuration
//!
//! Plain configuration structs for the client and the connections it opens.
//! `ClientConfig` deserializes with serde so a host can bind it from
//! whatever configuration source it already uses.

use std::time::Duration;

use serde::Deserialize;

/// Default writer-queue capacity per connection.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Configuration for the client and its single-connection pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server endpoint, `host:port` (DNS name or IPv4 literal).
    pub endpoint: String,
    /// Writer-queue capacity; `enqueue` suspends once it is full.
    pub queue_capacity: usize,
    /// Chunks buffered between the connection loops and the socket pumps.
    pub transport_buffer_chunks: usize,
    /// Initial size of the inbound read buffer, in bytes.
    pub read_buffer_size: usize,
    /// Optional TCP connect timeout in milliseconds.
    pub connect_timeout_ms: Option<u64>,
    /// Disable Nagle on the connection socket.
    pub nodelay: bool,
    /// Enable TCP keepalive on the connection socket.
    pub keepalive: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            endpoint: "127.0.0.1:11211".to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            transport_buffer_chunks: 64,
            read_buffer_size: 8 * 1024,
            connect_timeout_ms: None,
            nodelay: true,
            keepalive: true,
        }
    }
}

impl ClientConfig {
    /// Returns a default configuration pointed at `endpoint`.
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        ClientConfig {
            endpoint: endpoint.into(),
            ..ClientConfig::default()
        }
    }

    /// Connect timeout as a `Duration`.
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    /// Per-connection settings derived from this configuration.
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            queue_capacity: self.queue_capacity.max(1),
            transport_buffer_chunks: self.transport_buffer_chunks.max(1),
            read_buffer_size: self.read_buffer_size.max(64),
        }
    }
}

/// Settings for a single connection and its transport.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionConfig {
    pub queue_capacity: usize,
    pub transport_buffer_chunks: usize,
    pub read_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ClientConfig::default().connection()
    }
}
