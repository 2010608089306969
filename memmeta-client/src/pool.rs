//! # Connection Pool
//!
//! Purpose: Lazily create, cache and replace the single pipelined
//! connection shared by every caller.
//!
//! ## Design Principles
//! 1. **Versioned Slot**: Two counters (`next_id`, `current_id`) decide
//!    whether the cached connection is still valid; equal means valid.
//!    Retiring connection `id` raises `next_id` to at least `id + 1`, so
//!    the watcher and the slow path may both do it.
//! 2. **Lock-Free Fast Path**: Readers load the counters and the `ArcSwap`
//!    slot without taking a lock; only replacement takes the mutex.
//! 3. **Scoped Cancellation**: Each connection runs under a child of the
//!    pool's root token, so shutting the pool down retires everything.
//! 4. **Off-Path Disposal**: Retired connections are torn down by a
//!    background worker, never by a caller.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use memmeta_common::{ClientError, ClientResult};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, ConnectionConfig};
use crate::connection::Connection;
use crate::metrics::{PoolMetrics, PoolSnapshot};

/// Opens the byte streams the pool wraps in connections.
pub trait Connect: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Opens a fresh stream to the server.
    fn connect(&self) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// TCP connector for a pre-resolved endpoint.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: SocketAddr,
    nodelay: bool,
    keepalive: bool,
    connect_timeout: Option<Duration>,
}

impl TcpConnector {
    /// Creates a connector for `addr` using the socket options in `config`.
    pub fn new(addr: SocketAddr, config: &ClientConfig) -> Self {
        TcpConnector {
            addr,
            nodelay: config.nodelay,
            keepalive: config.keepalive,
            connect_timeout: config.connect_timeout(),
        }
    }

    /// The resolved endpoint.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Connect for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> io::Result<TcpStream> {
        let socket = if self.addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(self.keepalive)?;

        let connect = socket.connect(self.addr);
        let stream = match self.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??,
            None => connect.await?,
        };
        stream.set_nodelay(self.nodelay)?;
        Ok(stream)
    }
}

/// A live connection together with its retirement watcher.
///
/// The connection owns the entry's cancellation scope.
struct ConnectionPoolEntry {
    id: i64,
    connection: Arc<Connection>,
    watcher: JoinHandle<()>,
}

impl ConnectionPoolEntry {
    async fn dispose(self) {
        self.connection.retire();
        self.connection.shutdown().await;
        self.watcher.abort();
        debug!(id = self.id, "connection disposed");
    }
}

struct PoolInner<C> {
    connector: C,
    config: ConnectionConfig,
    next_id: AtomicI64,
    current_id: AtomicI64,
    current: ArcSwapOption<Connection>,
    slow_path: tokio::sync::Mutex<()>,
    entries: Mutex<HashMap<i64, ConnectionPoolEntry>>,
    root: CancellationToken,
    finalize_tx: mpsc::UnboundedSender<i64>,
    finalizer: Mutex<Option<JoinHandle<()>>>,
    metrics: PoolMetrics,
}

impl<C> PoolInner<C> {
    /// The cached connection, unless it was invalidated or its scope has
    /// already fired.
    fn current(&self) -> Option<Arc<Connection>> {
        let current_id = self.current_id.load(Ordering::Acquire);
        if current_id != self.next_id.load(Ordering::Acquire) {
            return None;
        }
        self.current
            .load_full()
            .filter(|connection| connection.id() == current_id && !connection.is_retired())
    }

    fn invalidate(&self, id: i64) {
        self.next_id.fetch_max(id + 1, Ordering::AcqRel);
    }
}

/// Self-healing pool holding at most one live connection.
pub struct ConnectionPool<C: Connect> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connect> ConnectionPool<C> {
    /// Creates an empty pool and starts its finalizer worker.
    ///
    /// No connection is opened until the first [`ConnectionPool::get`].
    pub fn new(connector: C, config: ConnectionConfig) -> Self {
        let (finalize_tx, finalize_rx) = mpsc::unbounded_channel();
        let root = CancellationToken::new();
        let inner = Arc::new(PoolInner {
            connector,
            config,
            next_id: AtomicI64::new(0),
            current_id: AtomicI64::new(-1),
            current: ArcSwapOption::empty(),
            slow_path: tokio::sync::Mutex::new(()),
            entries: Mutex::new(HashMap::new()),
            root: root.clone(),
            finalize_tx,
            finalizer: Mutex::new(None),
            metrics: PoolMetrics::default(),
        });

        let worker = tokio::spawn(finalize_retired(Arc::downgrade(&inner), finalize_rx, root));
        *inner.finalizer.lock().expect("pool mutex poisoned") = Some(worker);
        ConnectionPool { inner }
    }

    /// Returns the current connection, opening a replacement if the cached
    /// one was retired.
    pub async fn get(&self) -> ClientResult<Arc<Connection>> {
        if let Some(connection) = self.inner.current() {
            return Ok(connection);
        }
        self.replace().await
    }

    async fn replace(&self) -> ClientResult<Arc<Connection>> {
        let inner = &self.inner;
        let _guard = inner.slow_path.lock().await;
        if let Some(connection) = inner.current() {
            return Ok(connection);
        }
        if inner.root.is_cancelled() {
            return Err(ClientError::Canceled);
        }
        // The scope may have fired before its watcher ran.
        if let Some(stale) = inner.current.load_full() {
            if stale.is_retired() {
                inner.invalidate(stale.id());
            }
        }

        let id = inner.next_id.load(Ordering::Acquire);
        let stream = tokio::select! {
            biased;
            _ = inner.root.cancelled() => return Err(ClientError::Canceled),
            stream = inner.connector.connect() => stream.map_err(|err| {
                warn!(id, error = %err, "connect failed");
                ClientError::Io(err)
            })?,
        };

        let token = inner.root.child_token();
        let connection = Arc::new(Connection::start(id, stream, inner.config, token.clone()));
        let watcher = tokio::spawn(watch_retirement(Arc::downgrade(inner), id, token));
        inner.entries.lock().expect("pool mutex poisoned").insert(
            id,
            ConnectionPoolEntry {
                id,
                connection: connection.clone(),
                watcher,
            },
        );

        // Publish the slot before the id so a matching id never sees a stale slot.
        inner.current.store(Some(connection.clone()));
        inner.current_id.store(id, Ordering::Release);
        inner.metrics.record_opened();
        info!(id, "connection opened");
        Ok(connection)
    }

    /// Lifecycle counters.
    pub fn metrics(&self) -> PoolSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Cancels the root scope, stops the finalizer and disposes every
    /// remaining connection.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.root.cancel();

        let worker = inner.finalizer.lock().expect("pool mutex poisoned").take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }

        // Wait out a replacement that is still starting its connection.
        let _guard = inner.slow_path.lock().await;
        let entries: Vec<ConnectionPoolEntry> = inner
            .entries
            .lock()
            .expect("pool mutex poisoned")
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in entries {
            entry.dispose().await;
            inner.metrics.record_disposed();
        }
        inner.current.store(None);
        debug!("pool shut down");
    }
}

impl<C: Connect> Drop for ConnectionPool<C> {
    fn drop(&mut self) {
        self.inner.root.cancel();
    }
}

async fn watch_retirement<C>(pool: Weak<PoolInner<C>>, id: i64, token: CancellationToken) {
    token.cancelled().await;
    let Some(inner) = pool.upgrade() else {
        return;
    };
    inner.invalidate(id);
    inner.metrics.record_retired();
    debug!(id, "connection retired");
    if inner.finalize_tx.send(id).is_err() {
        warn!(id, "finalizer stopped, retired connection left for pool shutdown");
    }
}

async fn finalize_retired<C>(
    pool: Weak<PoolInner<C>>,
    mut rx: mpsc::UnboundedReceiver<i64>,
    root: CancellationToken,
) {
    loop {
        let id = tokio::select! {
            biased;
            _ = root.cancelled() => break,
            id = rx.recv() => match id {
                Some(id) => id,
                None => break,
            },
        };

        let Some(inner) = pool.upgrade() else {
            break;
        };
        let entry = inner.entries.lock().expect("pool mutex poisoned").remove(&id);
        if let Some(entry) = entry {
            entry.dispose().await;
            inner.metrics.record_disposed();
        }
    }
}
