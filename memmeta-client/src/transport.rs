//! # Duplex Transport
//!
//! Purpose: Own one socket and move bytes between it and two bounded chunk
//! channels, so the connection loops never touch the socket directly.
//!
//! ## Design Principles
//! 1. **Exclusive Ownership**: Exactly one read pump and one write pump per
//!    socket; nothing else holds a half.
//! 2. **Shared Scope**: Both pumps and both protocol-side handles observe the
//!    owning connection's cancellation token.
//! 3. **Fault vs Cancel**: A pump that hits EOF or an I/O error records it
//!    in a shared fault slot before canceling the scope; a scope canceled
//!    with an empty slot reads as `Canceled`.
//!
//! ## Data Flow
//!
//! ```text
//! TransportWriter --Bytes--> [outbound pump] --> socket
//! socket --> [inbound pump] --Bytes--> TransportReader
//! ```

use std::io;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use memmeta_common::{ClientError, ClientResult, Command, Outcome};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::ConnectionConfig;

/// First socket error seen by either pump.
type FaultSlot = Arc<Mutex<Option<io::Error>>>;

/// Protocol-side handle for decoding responses from the inbound buffer.
pub struct TransportReader {
    rx: mpsc::Receiver<Bytes>,
    buf: BytesMut,
    token: CancellationToken,
    fault: FaultSlot,
}

/// Protocol-side handle for handing request bytes to the outbound pump.
pub struct TransportWriter {
    tx: mpsc::Sender<Bytes>,
    token: CancellationToken,
}

/// The two socket pumps; joined to close the socket.
pub struct TransportPumps<S> {
    id: i64,
    inbound: JoinHandle<ReadHalf<S>>,
    outbound: JoinHandle<WriteHalf<S>>,
}

/// Splits `stream` and starts its pumps under `token`.
pub fn open<S>(
    id: i64,
    stream: S,
    config: &ConnectionConfig,
    token: CancellationToken,
) -> (TransportReader, TransportWriter, TransportPumps<S>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let (inbound_tx, inbound_rx) = mpsc::channel(config.transport_buffer_chunks);
    let (outbound_tx, outbound_rx) = mpsc::channel(config.transport_buffer_chunks);
    let fault = FaultSlot::default();

    let inbound = tokio::spawn(inbound_pump(
        id,
        read_half,
        inbound_tx,
        config.read_buffer_size,
        token.clone(),
        fault.clone(),
    ));
    let outbound = tokio::spawn(outbound_pump(
        id,
        write_half,
        outbound_rx,
        token.clone(),
        fault.clone(),
    ));

    let reader = TransportReader {
        rx: inbound_rx,
        buf: BytesMut::with_capacity(config.read_buffer_size),
        token: token.clone(),
        fault,
    };
    let writer = TransportWriter { tx: outbound_tx, token };
    (reader, writer, TransportPumps { id, inbound, outbound })
}

impl TransportReader {
    /// Decodes the response to `command`, waiting for more bytes as needed.
    ///
    /// The outer result is a transport fault, or `Canceled` when the scope
    /// fired without one; the inner outcome is the command's protocol result.
    pub async fn read(&mut self, command: &Command) -> ClientResult<Outcome> {
        loop {
            if let Some(outcome) = command.decode(&mut self.buf)? {
                return Ok(outcome);
            }

            // Bytes already forwarded by the pump win over a concurrent cancel.
            let chunk = tokio::select! {
                biased;
                chunk = self.rx.recv() => chunk,
                _ = self.token.cancelled() => None,
            };

            match chunk {
                Some(chunk) => self.buf.extend_from_slice(&chunk),
                None => return Err(self.closed()),
            }
        }
    }

    /// Explains why no more bytes will arrive.
    fn closed(&self) -> ClientError {
        match self.fault.lock().expect("transport mutex poisoned").take() {
            Some(err) if err.kind() == io::ErrorKind::UnexpectedEof => ClientError::EndOfStream,
            Some(err) => ClientError::Io(err),
            None => ClientError::Canceled,
        }
    }
}

impl TransportWriter {
    /// Hands a chunk to the outbound pump.
    ///
    /// Suspends while the outbound buffer is full.
    pub async fn send(&self, chunk: Bytes) -> ClientResult<()> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(ClientError::Canceled),
            sent = self.tx.send(chunk) => sent.map_err(|_| ClientError::Canceled),
        }
    }
}

impl<S> TransportPumps<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Waits for both pumps to stop, then shuts the socket down.
    ///
    /// The pumps only stop once the scope is canceled, so callers cancel
    /// first.
    pub async fn shutdown(self) {
        let read_half = self.inbound.await;
        let write_half = self.outbound.await;
        match (read_half, write_half) {
            (Ok(read_half), Ok(write_half)) => {
                let mut stream = read_half.unsplit(write_half);
                if let Err(err) = stream.shutdown().await {
                    trace!(id = self.id, error = %err, "socket shutdown failed");
                }
                debug!(id = self.id, "transport closed");
            }
            (read_half, write_half) => {
                warn!(
                    id = self.id,
                    inbound_ok = read_half.is_ok(),
                    outbound_ok = write_half.is_ok(),
                    "transport pump panicked"
                );
            }
        }
    }
}

fn record_fault(fault: &FaultSlot, token: &CancellationToken, err: io::Error) {
    {
        let mut slot = fault.lock().expect("transport mutex poisoned");
        if slot.is_none() {
            *slot = Some(err);
        }
    }
    token.cancel();
}

async fn inbound_pump<S>(
    id: i64,
    mut half: ReadHalf<S>,
    tx: mpsc::Sender<Bytes>,
    buffer_size: usize,
    token: CancellationToken,
    fault: FaultSlot,
) -> ReadHalf<S>
where
    S: AsyncRead + Send + Unpin,
{
    let mut buf = BytesMut::with_capacity(buffer_size);
    loop {
        buf.reserve(buffer_size);
        let read = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            read = half.read_buf(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                debug!(id, "server closed the connection");
                let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "end of stream");
                record_fault(&fault, &token, eof);
                break;
            }
            Ok(n) => {
                trace!(id, bytes = n, "inbound");
                let chunk = buf.split().freeze();
                let sent = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    sent = tx.send(chunk) => sent,
                };
                if sent.is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!(id, error = %err, "socket read failed");
                record_fault(&fault, &token, err);
                break;
            }
        }
    }
    half
}

async fn outbound_pump<S>(
    id: i64,
    mut half: WriteHalf<S>,
    mut rx: mpsc::Receiver<Bytes>,
    token: CancellationToken,
    fault: FaultSlot,
) -> WriteHalf<S>
where
    S: AsyncWrite + Send + Unpin,
{
    loop {
        let chunk = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            chunk = rx.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };

        let written = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            written = write_batch(&mut half, chunk, &mut rx) => written,
        };

        if let Err(err) = written {
            warn!(id, error = %err, "socket write failed");
            record_fault(&fault, &token, err);
            break;
        }
    }
    half
}

/// Writes `first` plus every chunk already queued behind it, then flushes.
async fn write_batch<W>(half: &mut W, first: Bytes, rx: &mut mpsc::Receiver<Bytes>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    half.write_all(&first).await?;
    let mut total = first.len();
    while let Ok(chunk) = rx.try_recv() {
        half.write_all(&chunk).await?;
        total += chunk.len();
    }
    half.flush().await?;
    trace!(bytes = total, "outbound");
    Ok(())
}
