//! # Pipelined Connection
//!
//! Purpose: Bind one transport to an ordered writer queue and reader queue,
//! so many callers can share a socket without correlation ids.
//!
//! ## Design Principles
//! 1. **FIFO Pipelining**: An operation enters the reader queue only after
//!    its bytes were handed to the transport, in the same order.
//! 2. **Backpressure**: The writer queue is bounded; `enqueue` suspends when
//!    it is full.
//! 3. **Single Use**: Any fault cancels the connection's scope and retires
//!    it for good.
//! 4. **Nothing Dropped Silently**: Teardown resolves every queued operation
//!    as canceled.

use std::sync::Mutex;

use bytes::BytesMut;
use memmeta_common::{ClientError, ClientResult};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::config::ConnectionConfig;
use crate::operation::Operation;
use crate::transport::{self, TransportReader, TransportWriter};

struct ConnectionTasks {
    writer: JoinHandle<mpsc::Receiver<Operation>>,
    reader: JoinHandle<mpsc::UnboundedReceiver<Operation>>,
    transport: JoinHandle<()>,
}

/// One pipelined connection to the server.
pub struct Connection {
    id: i64,
    writer_tx: mpsc::Sender<Operation>,
    token: CancellationToken,
    tasks: Mutex<Option<ConnectionTasks>>,
}

impl Connection {
    /// Starts the transport pumps and both connection loops over `stream`.
    ///
    /// `token` is the connection's cancellation scope; canceling it retires
    /// the connection.
    pub fn start<S>(id: i64, stream: S, config: ConnectionConfig, token: CancellationToken) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer, pumps) = transport::open(id, stream, &config, token.clone());
        let (writer_tx, writer_rx) = mpsc::channel(config.queue_capacity);
        let (reader_tx, reader_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(write_loop(id, writer_rx, writer, reader_tx, token.clone()));
        let reader = tokio::spawn(read_loop(id, reader_rx, reader, token.clone()));
        let pumps_token = token.clone();
        let transport = tokio::spawn(async move {
            pumps_token.cancelled().await;
            pumps.shutdown().await;
        });

        debug!(id, queue_capacity = config.queue_capacity, "connection started");
        Connection {
            id,
            writer_tx,
            token,
            tasks: Mutex::new(Some(ConnectionTasks { writer, reader, transport })),
        }
    }

    /// Pool-assigned identifier.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Returns true once the connection's scope has fired.
    pub fn is_retired(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancels the connection's scope, as an I/O fault would.
    pub fn retire(&self) {
        self.token.cancel();
    }

    /// Appends `op` to the writer queue.
    ///
    /// Suspends while the queue is full, until space frees up, the caller's
    /// `cancel` fires, or the connection retires. On failure the operation
    /// is dropped, which resolves it as canceled.
    pub async fn enqueue(&self, op: Operation, cancel: &CancellationToken) -> ClientResult<()> {
        if self.is_retired() {
            return Err(ClientError::Canceled);
        }
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::Canceled),
            _ = self.token.cancelled() => return Err(ClientError::Canceled),
            permit = self.writer_tx.reserve() => permit.map_err(|_| ClientError::Canceled)?,
        };
        trace!(id = self.id, command = op.command().name(), "enqueued");
        permit.send(op);
        Ok(())
    }

    /// Retires the connection and waits for its tasks to finish.
    ///
    /// Operations still waiting in either queue resolve as canceled.
    /// Later calls return immediately.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let tasks = self.tasks.lock().expect("connection mutex poisoned").take();
        let Some(tasks) = tasks else {
            return;
        };

        let mut drained = 0usize;
        if let Ok(mut writer_rx) = tasks.writer.await {
            writer_rx.close();
            while let Ok(op) = writer_rx.try_recv() {
                op.cancel();
                drained += 1;
            }
        }
        if let Ok(mut reader_rx) = tasks.reader.await {
            reader_rx.close();
            while let Ok(op) = reader_rx.try_recv() {
                op.cancel();
                drained += 1;
            }
        }
        let _ = tasks.transport.await;
        debug!(id = self.id, drained, "connection shut down");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn write_loop(
    id: i64,
    mut rx: mpsc::Receiver<Operation>,
    writer: TransportWriter,
    pending: mpsc::UnboundedSender<Operation>,
    token: CancellationToken,
) -> mpsc::Receiver<Operation> {
    let _retire_on_exit = token.clone().drop_guard();
    let mut scratch = BytesMut::with_capacity(256);
    loop {
        let op = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            op = rx.recv() => match op {
                Some(op) => op,
                None => break,
            },
        };

        op.command().encode(&mut scratch);
        let chunk = scratch.split().freeze();
        if let Err(err) = writer.send(chunk).await {
            if !err.is_canceled() {
                error!(id, error = %err, "writer loop failed");
                token.cancel();
            }
            op.complete(Err(err));
            break;
        }

        trace!(id, command = op.command().name(), "written");
        if let Err(mpsc::error::SendError(op)) = pending.send(op) {
            op.cancel();
            token.cancel();
            break;
        }
    }
    trace!(id, "writer loop stopped");
    rx
}

async fn read_loop(
    id: i64,
    mut rx: mpsc::UnboundedReceiver<Operation>,
    mut reader: TransportReader,
    token: CancellationToken,
) -> mpsc::UnboundedReceiver<Operation> {
    let _retire_on_exit = token.clone().drop_guard();
    loop {
        let op = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            op = rx.recv() => match op {
                Some(op) => op,
                None => break,
            },
        };

        match reader.read(op.command()).await {
            Ok(outcome) => {
                trace!(
                    id,
                    command = op.command().name(),
                    ok = outcome.is_ok(),
                    abandoned = op.is_abandoned(),
                    "resolved"
                );
                op.complete(outcome);
            }
            Err(err) => {
                if !err.is_canceled() {
                    error!(id, command = op.command().name(), error = %err, "connection fault, retiring");
                    token.cancel();
                }
                op.complete(Err(err));
                break;
            }
        }
    }
    trace!(id, "reader loop stopped");
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use bytes::Bytes;
    use memmeta_common::{Command, Key};
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    use crate::operation::Pending;

    fn get(key: &str) -> Command {
        Command::Get { key: Key::new(key).unwrap(), ttl: None }
    }

    fn config(queue_capacity: usize) -> ConnectionConfig {
        ConnectionConfig { queue_capacity, ..ConnectionConfig::default() }
    }

    async fn submit(conn: &Connection, command: Command) -> Pending {
        let (op, pending) = Operation::new(command);
        conn.enqueue(op, &CancellationToken::new()).await.unwrap();
        pending
    }

    /// Answers each `mg <key>` line with the key as the body and the
    /// arrival order as the version.
    fn spawn_echo_server(server: DuplexStream) -> JoinHandle<()> {
        tokio::spawn(async move {
            let (read_half, mut write_half) = tokio::io::split(server);
            let mut lines = BufReader::new(read_half).lines();
            let mut served = 0u64;
            while let Ok(Some(line)) = lines.next_line().await {
                served += 1;
                let key = line.split(' ').nth(1).unwrap_or_default().to_string();
                let response = format!("VA {} c{}\r\n{}\r\n", key.len(), served, key);
                if write_half.write_all(response.as_bytes()).await.is_err() {
                    break;
                }
            }
        })
    }

    #[tokio::test]
    async fn responses_follow_submission_order() {
        let (client, server) = duplex(64 * 1024);
        let _server = spawn_echo_server(server);
        let conn = std::sync::Arc::new(Connection::start(0, client, config(8), CancellationToken::new()));

        let mut handles = Vec::new();
        for idx in 0..64u64 {
            let conn = conn.clone();
            handles.push(tokio::spawn(async move {
                let pending = submit(&conn, get(&format!("k{}", idx))).await;
                (idx, pending.wait(&CancellationToken::new()).await.unwrap())
            }));
        }

        let mut versions = Vec::new();
        for handle in handles {
            let (idx, reply) = handle.await.unwrap();
            let expected = format!("k{}", idx);
            assert_eq!(reply.value.as_deref(), Some(expected.as_bytes()));
            versions.push(reply.version);
        }
        versions.sort_unstable();
        assert_eq!(versions, (1..=64).collect::<Vec<_>>());
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn sequential_submissions_match_wire_order() {
        let (client, server) = duplex(64 * 1024);
        let _server = spawn_echo_server(server);
        let conn = Connection::start(1, client, config(16), CancellationToken::new());

        let mut pendings = Vec::new();
        for idx in 0..10 {
            pendings.push(submit(&conn, get(&format!("key{}", idx))).await);
        }
        for (idx, pending) in pendings.into_iter().enumerate() {
            let reply = pending.wait(&CancellationToken::new()).await.unwrap();
            assert_eq!(reply.version, idx as u64 + 1);
        }
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn full_queue_suspends_until_caller_cancels() {
        // A tiny duplex buffer and a silent server stall the writer loop, so
        // the writer queue fills up.
        let (client, _server) = duplex(8);
        let connection_config = ConnectionConfig {
            queue_capacity: 1,
            transport_buffer_chunks: 1,
            ..ConnectionConfig::default()
        };
        let conn = Connection::start(2, client, connection_config, CancellationToken::new());

        let value = Bytes::from(vec![b'x'; 64]);
        let set = |key: &str| Command::Set {
            key: Key::new(key).unwrap(),
            value: value.clone(),
            ttl: Duration::from_secs(1),
            version: None,
        };

        let never = CancellationToken::new();
        let mut pendings = Vec::new();
        let mut blocked = None;
        for idx in 0..8 {
            let (op, pending) = Operation::new(set(&format!("k{}", idx)));
            let enqueue = conn.enqueue(op, &never);
            match tokio::time::timeout(Duration::from_millis(100), enqueue).await {
                Ok(result) => {
                    result.unwrap();
                    pendings.push(pending);
                }
                Err(_) => {
                    blocked = Some(idx);
                    break;
                }
            }
        }
        assert!(blocked.is_some(), "writer queue never applied backpressure");

        let cancel = CancellationToken::new();
        let (op, pending) = Operation::new(set("late"));
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let err = conn.enqueue(op, &cancel).await.unwrap_err();
        assert!(err.is_canceled());
        assert!(pending.wait(&CancellationToken::new()).await.unwrap_err().is_canceled());
        assert!(!conn.is_retired());

        conn.shutdown().await;
        for pending in pendings {
            assert!(pending.wait(&CancellationToken::new()).await.unwrap_err().is_canceled());
        }
    }

    #[tokio::test]
    async fn full_queue_resumes_once_drained() {
        let (client, server) = duplex(64 * 1024);
        let _server = spawn_echo_server(server);
        let conn = Connection::start(3, client, config(1), CancellationToken::new());

        let mut pendings = Vec::new();
        for idx in 0..16 {
            pendings.push(submit(&conn, get(&format!("k{}", idx))).await);
        }
        for pending in pendings {
            pending.wait(&CancellationToken::new()).await.unwrap();
        }
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_cancels_in_flight_operations() {
        let (client, _server) = duplex(64 * 1024);
        let conn = Connection::start(4, client, config(16), CancellationToken::new());

        let mut pendings = Vec::new();
        for idx in 0..4 {
            pendings.push(submit(&conn, get(&format!("k{}", idx))).await);
        }
        conn.shutdown().await;
        conn.shutdown().await;

        for pending in pendings {
            assert!(pending.wait(&CancellationToken::new()).await.unwrap_err().is_canceled());
        }
        assert!(conn.is_retired());
        let (op, _pending) = Operation::new(Command::NoOp);
        assert!(conn.enqueue(op, &CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn protocol_fault_retires_connection() {
        let (client, mut server) = duplex(1024);
        let conn = Connection::start(5, client, config(16), CancellationToken::new());

        let first = submit(&conn, get("a")).await;
        let second = submit(&conn, get("b")).await;
        server.write_all(b"VA nope c1\r\n").await.unwrap();

        let err = first.wait(&CancellationToken::new()).await.unwrap_err();
        assert!(err.is_transport_fault());
        conn.shutdown().await;
        assert!(second.wait(&CancellationToken::new()).await.unwrap_err().is_canceled());
    }

    #[tokio::test]
    async fn caller_cancel_keeps_pipeline_in_sync() {
        let (client, mut server) = duplex(1024);
        let conn = Connection::start(6, client, config(16), CancellationToken::new());

        let first = submit(&conn, get("a")).await;
        let second = submit(&conn, get("b")).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(first.wait(&cancel).await.unwrap_err().is_canceled());

        server.write_all(b"VA 1 c1\r\na\r\nVA 1 c2\r\nb\r\n").await.unwrap();
        let reply = second.wait(&CancellationToken::new()).await.unwrap();
        assert_eq!(reply.value.as_deref(), Some(&b"b"[..]));
        assert!(!conn.is_retired());
        conn.shutdown().await;
    }
}
