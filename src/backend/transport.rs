//! JSON-RPC over stdio transport.
//!
//! Line-delimited JSON (one JSON object per line) in both directions.
//! A background reader task demultiplexes responses by request id, so any
//! number of requests can be in flight on one provider at a time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::errors::BackendError;
use super::types::{
    error_codes, Incoming, IncomingFrame, JsonRpcError, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse,
};

type Waiter = oneshot::Sender<Result<JsonRpcResponse, BackendError>>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Out-of-band events raised by the reader task.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The provider sent a notification.
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
    /// The stream ended or broke. No further responses will arrive.
    Closed { reason: String },
}

/// In-flight requests of one transport. Ids are only meaningful here.
#[derive(Default)]
struct PendingTable {
    waiters: HashMap<u64, Waiter>,
    /// Set once the stream is gone; new requests fail fast.
    closed: Option<String>,
}

/// Removes a pending entry if the awaiting future is dropped (e.g. timeout).
struct PendingGuard {
    table: Arc<Mutex<PendingTable>>,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.table.lock().waiters.remove(&self.id);
    }
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    provider: String,
    writer: tokio::sync::Mutex<BoxedWriter>,
    pending: Arc<Mutex<PendingTable>>,
    next_id: AtomicU64,
    reader_handle: JoinHandle<()>,
}

impl StdioTransport {
    /// Wrap a writer (child stdin) and reader (child stdout).
    ///
    /// Spawns the reader task; notifications and stream closure are reported
    /// on the returned channel.
    pub fn new<W, R>(
        provider: &str,
        writer: W,
        reader: R,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>)
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let pending = Arc::new(Mutex::new(PendingTable::default()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let reader_handle = tokio::spawn(reader_loop(
            provider.to_string(),
            BufReader::new(reader),
            Arc::clone(&pending),
            events_tx,
        ));

        let transport = Self {
            provider: provider.to_string(),
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending,
            next_id: AtomicU64::new(1),
            reader_handle,
        };
        (transport, events_rx)
    }

    /// Send a JSON-RPC request and wait for the response with the same id.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, BackendError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut table = self.pending.lock();
            if let Some(reason) = &table.closed {
                return Err(self.protocol_error(reason.clone()));
            }
            table.waiters.insert(id, tx);
        }
        let _guard = PendingGuard {
            table: Arc::clone(&self.pending),
            id,
        };

        let req = JsonRpcRequest::new(id, method, params);
        let line = serde_json::to_string(&req)
            .map_err(|e| self.protocol_error(format!("failed to serialize request: {e}")))?;
        self.write_line(line).await?;

        tracing::trace!(provider = %self.provider, id, method, "request sent");

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(self.protocol_error("transport dropped before response".into())),
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), BackendError> {
        let notification = JsonRpcNotification::new(method, params);
        let line = serde_json::to_string(&notification)
            .map_err(|e| self.protocol_error(format!("failed to serialize notification: {e}")))?;
        self.write_line(line).await
    }

    /// Close the provider's stdin. Well-behaved providers exit on EOF.
    pub async fn close_input(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(provider = %self.provider, error = %e, "closing provider stdin failed");
        }
    }

    /// Fail every in-flight request and refuse new ones.
    pub fn fail_all(&self, reason: &str) {
        close_table(&self.provider, &self.pending, reason);
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.pending.lock().waiters.len()
    }

    async fn write_line(&self, mut line: String) -> Result<(), BackendError> {
        line.push('\n');
        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| self.protocol_error(format!("failed to write to stdin: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| self.protocol_error(format!("failed to flush stdin: {e}")))
    }

    fn protocol_error(&self, reason: String) -> BackendError {
        BackendError::Protocol {
            provider: self.provider.clone(),
            reason,
        }
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

// ─── Reader Loop ────────────────────────────────────────────────────────────

async fn reader_loop<R>(
    provider: String,
    mut reader: BufReader<R>,
    pending: Arc<Mutex<PendingTable>>,
    events: mpsc::UnboundedSender<TransportEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();

    let reason = loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break "provider stdout closed".to_string(),
            Ok(_) => {}
            Err(e) => break format!("failed to read from stdout: {e}"),
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let frame = match serde_json::from_str::<IncomingFrame>(trimmed) {
            Ok(frame) => frame,
            Err(e) => break format!("malformed frame: {e}"),
        };

        match frame.classify() {
            Some(Incoming::Response(resp)) => {
                let waiter = pending.lock().waiters.remove(&resp.id);
                match waiter {
                    Some(tx) => {
                        // Receiver gone means the caller stopped waiting.
                        let _ = tx.send(Ok(resp));
                    }
                    None => {
                        tracing::warn!(
                            provider = %provider,
                            id = resp.id,
                            "response for unknown request id, dropping"
                        );
                    }
                }
            }
            Some(Incoming::Notification { method, params }) => {
                tracing::debug!(provider = %provider, method = %method, "provider notification");
                let _ = events.send(TransportEvent::Notification { method, params });
            }
            Some(Incoming::Request { id, method }) => {
                tracing::debug!(
                    provider = %provider,
                    id = %id,
                    method = %method,
                    "ignoring provider-initiated request"
                );
            }
            None => break "frame is not a JSON-RPC message".to_string(),
        }
    };

    close_table(&provider, &pending, &reason);
    let _ = events.send(TransportEvent::Closed { reason });
}

fn close_table(provider: &str, pending: &Mutex<PendingTable>, reason: &str) {
    let waiters: Vec<Waiter> = {
        let mut table = pending.lock();
        if table.closed.is_none() {
            table.closed = Some(reason.to_string());
        }
        table.waiters.drain().map(|(_, tx)| tx).collect()
    };

    if !waiters.is_empty() {
        tracing::debug!(provider, count = waiters.len(), reason, "failing in-flight requests");
    }
    for tx in waiters {
        let _ = tx.send(Err(BackendError::Protocol {
            provider: provider.to_string(),
            reason: reason.to_string(),
        }));
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, JsonRpcError> {
    if let Some(err) = response.error {
        return Err(err);
    }

    response.result.ok_or(JsonRpcError {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
