//! # Async Client API
//!
//! Purpose: Expose one async method per meta command, hiding the pool,
//! the pipelined connection and the codec.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `MemcachedClient` builds the command, obtains the
//!    current connection, enqueues and awaits.
//! 2. **Caller-Owned Buffers**: Writes take `Bytes`; reads append into any
//!    `BufMut` sink the caller supplies.
//! 3. **Cooperative Cancellation**: Every call takes a `CancellationToken`
//!    honored while enqueueing and while waiting for the reply.
//! 4. **Versions Out**: Mutations return the server's CAS value for use in
//!    later `*_if_match` calls.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes};
use memmeta_common::{ClientError, ClientResult, Command, Direction, Key, Reply};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ClientConfig;
use crate::metrics::{Metrics, MetricsSnapshot, PoolSnapshot};
use crate::operation::Operation;
use crate::pool::{Connect, ConnectionPool, TcpConnector};

/// Meta-protocol client over a single self-healing connection.
///
/// All methods take `&self`; concurrent calls are pipelined on the same
/// connection.
pub struct MemcachedClient<C: Connect = TcpConnector> {
    pool: ConnectionPool<C>,
    metrics: Metrics,
}

impl MemcachedClient<TcpConnector> {
    /// Resolves `config.endpoint` and creates a client for it.
    ///
    /// The connection itself is opened lazily by the first call.
    ///
    /// # Errors
    /// Returns `ClientError::InvalidAddress` if the endpoint cannot be
    /// resolved.
    pub async fn connect(config: ClientConfig) -> ClientResult<Self> {
        let addr = resolve(&config.endpoint).await?;
        debug!(endpoint = %config.endpoint, %addr, "endpoint resolved");
        Ok(Self::with_connector(TcpConnector::new(addr, &config), &config))
    }
}

impl<C: Connect> MemcachedClient<C> {
    /// Creates a client that opens its streams through `connector`.
    pub fn with_connector(connector: C, config: &ClientConfig) -> Self {
        MemcachedClient {
            pool: ConnectionPool::new(connector, config.connection()),
            metrics: Metrics::new(),
        }
    }

    /// Round-trips a `mn` no-op.
    pub async fn no_op(&self, cancel: &CancellationToken) -> ClientResult<()> {
        self.execute(Command::NoOp, cancel).await.map(|_| ())
    }

    /// Stores `value` under `key` and returns the new version.
    ///
    /// `version` asks the server to use that CAS value for the new item.
    pub async fn set(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
        version: Option<u64>,
        cancel: &CancellationToken,
    ) -> ClientResult<u64> {
        let command = Command::Set { key: Key::new(key)?, value, ttl, version };
        Ok(self.execute(command, cancel).await?.version)
    }

    /// Stores `value` only if the item's current version is `if_match`.
    ///
    /// # Errors
    /// `PreconditionFailed` on a version mismatch, `NotFound` if the item
    /// does not exist.
    pub async fn set_if_match(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
        if_match: u64,
        version: Option<u64>,
        cancel: &CancellationToken,
    ) -> ClientResult<u64> {
        let command = Command::SetIfMatch { key: Key::new(key)?, value, ttl, if_match, version };
        Ok(self.execute(command, cancel).await?.version)
    }

    /// Appends the item's value to `sink` and returns its version.
    ///
    /// A missing key returns version `0` and leaves `sink` untouched.
    /// A `ttl` also refreshes the item's expiry.
    pub async fn get(
        &self,
        key: &str,
        sink: &mut impl BufMut,
        ttl: Option<Duration>,
        cancel: &CancellationToken,
    ) -> ClientResult<u64> {
        let command = Command::Get { key: Key::new(key)?, ttl };
        let reply = self.execute(command, cancel).await?;
        Ok(drain_into(reply, sink))
    }

    /// Refreshes the item's expiry and returns its version (`0` if missing).
    pub async fn touch(&self, key: &str, ttl: Duration, cancel: &CancellationToken) -> ClientResult<u64> {
        let command = Command::Touch { key: Key::new(key)?, ttl };
        Ok(self.execute(command, cancel).await?.version)
    }

    /// Deletes the item; a missing key is not an error.
    pub async fn delete(&self, key: &str, cancel: &CancellationToken) -> ClientResult<()> {
        let command = Command::Delete { key: Key::new(key)? };
        self.execute(command, cancel).await.map(|_| ())
    }

    /// Deletes the item if its version is `if_match`; a missing key is not
    /// an error.
    pub async fn delete_if_match(&self, key: &str, if_match: u64, cancel: &CancellationToken) -> ClientResult<()> {
        let command = Command::DeleteIfMatch { key: Key::new(key)?, if_match };
        self.execute(command, cancel).await.map(|_| ())
    }

    /// Increments the counter by one, creating it at `1` if missing.
    ///
    /// The new value is appended to `sink` as decimal text; the returned
    /// value is the item's version.
    pub async fn increment(
        &self,
        key: &str,
        sink: &mut impl BufMut,
        ttl: Duration,
        version: Option<u64>,
        cancel: &CancellationToken,
    ) -> ClientResult<u64> {
        self.counter(Direction::Increment, key, sink, ttl, version, cancel).await
    }

    /// Decrements the counter by one, creating it at `1` if missing.
    pub async fn decrement(
        &self,
        key: &str,
        sink: &mut impl BufMut,
        ttl: Duration,
        version: Option<u64>,
        cancel: &CancellationToken,
    ) -> ClientResult<u64> {
        self.counter(Direction::Decrement, key, sink, ttl, version, cancel).await
    }

    /// Increments an existing counter if its version is `if_match`.
    pub async fn increment_if_match(
        &self,
        key: &str,
        sink: &mut impl BufMut,
        ttl: Duration,
        if_match: u64,
        version: Option<u64>,
        cancel: &CancellationToken,
    ) -> ClientResult<u64> {
        self.counter_if_match(Direction::Increment, key, sink, ttl, if_match, version, cancel)
            .await
    }

    /// Decrements an existing counter if its version is `if_match`.
    pub async fn decrement_if_match(
        &self,
        key: &str,
        sink: &mut impl BufMut,
        ttl: Duration,
        if_match: u64,
        version: Option<u64>,
        cancel: &CancellationToken,
    ) -> ClientResult<u64> {
        self.counter_if_match(Direction::Decrement, key, sink, ttl, if_match, version, cancel)
            .await
    }

    /// Call metrics recorded by this client.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Connection lifecycle counters.
    pub fn pool_metrics(&self) -> PoolSnapshot {
        self.pool.metrics()
    }

    /// Retires the connection and waits until it is fully torn down.
    ///
    /// Calls still queued resolve as canceled; later calls fail with
    /// `ClientError::Canceled`.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    async fn counter(
        &self,
        direction: Direction,
        key: &str,
        sink: &mut impl BufMut,
        ttl: Duration,
        version: Option<u64>,
        cancel: &CancellationToken,
    ) -> ClientResult<u64> {
        let command = Command::Counter { direction, key: Key::new(key)?, ttl, version };
        let reply = self.execute(command, cancel).await?;
        Ok(drain_into(reply, sink))
    }

    #[allow(clippy::too_many_arguments)]
    async fn counter_if_match(
        &self,
        direction: Direction,
        key: &str,
        sink: &mut impl BufMut,
        ttl: Duration,
        if_match: u64,
        version: Option<u64>,
        cancel: &CancellationToken,
    ) -> ClientResult<u64> {
        let command = Command::CounterIfMatch { direction, key: Key::new(key)?, ttl, if_match, version };
        let reply = self.execute(command, cancel).await?;
        Ok(drain_into(reply, sink))
    }

    async fn execute(&self, command: Command, cancel: &CancellationToken) -> ClientResult<Reply> {
        let name = command.name();
        let started = Instant::now();
        self.metrics.record_request_start();
        let result = self.dispatch(command, cancel).await;
        self.metrics.record_request_end(started.elapsed());

        if let Err(err) = &result {
            self.metrics.record_error();
            debug!(command = name, error = %err, "call failed");
        }
        result
    }

    async fn dispatch(&self, command: Command, cancel: &CancellationToken) -> ClientResult<Reply> {
        if cancel.is_cancelled() {
            return Err(ClientError::Canceled);
        }
        let connection = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::Canceled),
            connection = self.pool.get() => connection?,
        };

        // A connection retired after `get` fails the call with `Canceled`
        // rather than being retried on its replacement.
        let (op, pending) = Operation::new(command);
        connection.enqueue(op, cancel).await?;
        pending.wait(cancel).await
    }
}

fn drain_into(reply: Reply, sink: &mut impl BufMut) -> u64 {
    if let Some(value) = reply.value {
        sink.put_slice(&value);
    }
    reply.version
}

async fn resolve(endpoint: &str) -> ClientResult<SocketAddr> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(endpoint)
        .await
        .map_err(|err| ClientError::InvalidAddress(format!("{}: {}", endpoint, err)))?
        .collect();
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| ClientError::InvalidAddress(format!("{}: no addresses", endpoint)))
}
