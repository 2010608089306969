//! # memmeta Async Client
//!
//! Purpose: Provide an async Memcached meta-protocol client that pipelines
//! every call over one self-healing TCP connection.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `MemcachedClient` hides pooling, pipelining and the codec.
//! 2. **Strict FIFO**: Responses are matched to requests purely by order.
//! 3. **Bounded Queues**: Callers feel backpressure instead of unbounded buffering.
//! 4. **Structured Cancellation**: A root token per pool, a child token per connection.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use memmeta_client::{Bytes, CancellationToken, ClientConfig, MemcachedClient};
//!
//! # async fn run() -> memmeta_client::ClientResult<()> {
//! let client = MemcachedClient::connect(ClientConfig::with_endpoint("127.0.0.1:11211")).await?;
//! let cancel = CancellationToken::new();
//!
//! let version = client
//!     .set("greeting", Bytes::from_static(b"hello"), Duration::from_secs(60), None, &cancel)
//!     .await?;
//! let mut body = Vec::new();
//! assert_eq!(client.get("greeting", &mut body, None, &cancel).await?, version);
//!
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod connection;
mod metrics;
mod operation;
mod pool;
mod transport;

pub use bytes::Bytes;
pub use client::MemcachedClient;
pub use config::{ClientConfig, DEFAULT_QUEUE_CAPACITY};
pub use memmeta_common::{parse_counter, ClientError, ClientResult, Key, Status, MAX_KEY_SIZE};
pub use metrics::{LatencySnapshot, MetricsSnapshot, PoolSnapshot};
pub use pool::{Connect, TcpConnector};
pub use tokio_util::sync::CancellationToken;
