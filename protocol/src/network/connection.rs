//! A single duplex peer connection.
//!
//! The transport is any `AsyncRead + AsyncWrite` stream. Outbound envelopes
//! are queued on an unbounded channel drained by a writer task, so callers
//! never await a slow peer. Inbound envelopes are read line by line by the
//! gossip network.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tracing::{trace, warn};

use super::message::Message;

pub type ConnectionId = u64;

#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    /// Transport-level label of the remote end, for logs only.
    remote: String,
    outbound: mpsc::UnboundedSender<String>,
    open: AtomicBool,
    closed: Notify,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        remote: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let conn = Self {
            id,
            remote: remote.into(),
            outbound,
            open: AtomicBool::new(true),
            closed: Notify::new(),
        };
        (conn, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.outbound.is_closed()
    }

    /// Queues `message`. Returns `false` (and logs) when the connection is
    /// not open; the message is dropped.
    pub fn send(&self, message: &Message) -> bool {
        match message.encode() {
            Ok(line) => self.send_line(line),
            Err(e) => {
                warn!(conn = self.id, kind = message.kind(), error = %e, "cannot encode message");
                false
            }
        }
    }

    pub(crate) fn send_line(&self, line: String) -> bool {
        if !self.is_open() {
            warn!(conn = self.id, remote = %self.remote, "dropping send on closed connection");
            return false;
        }
        self.outbound.send(line).is_ok()
    }

    /// Marks the connection closed and wakes its reader and writer tasks.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            trace!(conn = self.id, "closing connection");
        }
        self.closed.notify_waiters();
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        let notified = self.closed.notified();
        if !self.open.load(Ordering::Acquire) {
            return;
        }
        notified.await;
    }
}

/// Drains `rx` into `writer`, one envelope per line, until the channel or
/// the stream closes.
pub(crate) async fn write_envelopes<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            trace!(error = %e, "peer write failed");
            break;
        }
        if let Err(e) = writer.flush().await {
            trace!(error = %e, "peer flush failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Reads the next envelope line. `Ok(None)` means the stream ended; a line
/// longer than `max_bytes` is an `InvalidData` error.
pub(crate) async fn read_envelope<R>(
    reader: &mut R,
    max_bytes: usize,
) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let read = reader.take(max_bytes as u64 + 1).read_line(&mut line).await?;
    if read == 0 {
        return Ok(None);
    }
    if read > max_bytes {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("envelope exceeds {max_bytes} bytes"),
        ));
    }
    let trimmed = line.trim_end_matches(['\r', '\n']);
    Ok(Some(trimmed.to_string()))
}
