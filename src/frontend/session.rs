//! Front-end session — one connected client.
//!
//! Each session owns its outbound queue and its pending-call table. Closing
//! a session abandons its pending calls; results that arrive afterwards are
//! dropped with a debug log and never reach another session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::protocol::{parse_request, CapabilityResult, ClientRequest, ServerNotification};
use super::router::Router;
use crate::catalog::{CatalogAggregator, QualifiedName};

/// A call submitted by this session and not yet answered.
#[derive(Debug, Clone)]
pub struct PendingCall {
    pub target: QualifiedName,
    pub submitted_at: DateTime<Utc>,
}

/// State shared between a session's reader, writer, and in-flight calls.
pub struct Session {
    id: Uuid,
    peer: String,
    outbound: mpsc::Sender<ServerNotification>,
    pending: Mutex<HashMap<String, PendingCall>>,
    subscribed: AtomicBool,
    closed: watch::Sender<bool>,
}

impl Session {
    /// Create a session with a bounded outbound queue.
    pub fn new(
        peer: impl Into<String>,
        queue_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<ServerNotification>) {
        let (outbound, rx) = mpsc::channel(queue_capacity.max(1));
        let (closed, _) = watch::channel(false);
        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            peer: peer.into(),
            outbound,
            pending: Mutex::new(HashMap::new()),
            subscribed: AtomicBool::new(true),
            closed,
        });
        (session, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    pub fn set_subscribed(&self, enabled: bool) {
        self.subscribed.store(enabled, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    // ─── Pending calls ───────────────────────────────────────────────────

    /// Register a call. Returns `false` if the id is already in flight or the
    /// session is closed.
    pub fn begin_call(&self, correlation_id: &str, target: QualifiedName) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut pending = self.pending.lock();
        if pending.contains_key(correlation_id) {
            return false;
        }
        pending.insert(
            correlation_id.to_string(),
            PendingCall {
                target,
                submitted_at: Utc::now(),
            },
        );
        true
    }

    /// Deliver the outcome of a call, at most once per registration.
    ///
    /// Returns whether the result was queued for the client.
    pub async fn complete(&self, result: CapabilityResult) -> bool {
        let Some(call) = self.pending.lock().remove(&result.correlation_id) else {
            tracing::debug!(
                session = %self.id,
                correlation_id = %result.correlation_id,
                "discarding result for a call that is no longer pending"
            );
            return false;
        };

        if self.is_closed() {
            tracing::debug!(session = %self.id, correlation_id = %result.correlation_id, "session closed, discarding late result");
            return false;
        }

        let age_ms = (Utc::now() - call.submitted_at).num_milliseconds();
        tracing::debug!(
            session = %self.id,
            correlation_id = %result.correlation_id,
            target = %call.target,
            success = result.success,
            age_ms,
            "delivering capability result"
        );
        self.send(ServerNotification::CapabilityResult(result)).await
    }

    // ─── Outbound ────────────────────────────────────────────────────────

    /// Queue a notification, waiting for room if the client is slow.
    pub async fn send(&self, notification: ServerNotification) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.outbound.try_send(notification) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(notification)) => {
                tracing::warn!(session = %self.id, "outbound queue full, waiting for the client to catch up");
                let mut closed = self.closed.subscribe();
                tokio::select! {
                    sent = self.outbound.send(notification) => sent.is_ok(),
                    () = closed_signal(&mut closed) => false,
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Close the session and abandon its pending calls. Returns how many
    /// calls were abandoned.
    pub fn close(&self) -> usize {
        let was_closed = self.closed.send_replace(true);
        let abandoned = self.pending.lock().drain().count();
        if !was_closed {
            tracing::info!(session = %self.id, peer = %self.peer, abandoned, "session closed");
        }
        abandoned
    }

    fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

/// Resolves once the session is closed.
async fn closed_signal(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|c| *c).await;
}

// ─── Driver ─────────────────────────────────────────────────────────────────

/// Serve one client until it disconnects or sends a non-JSON line.
pub async fn run_session<R, W>(
    reader: R,
    writer: W,
    peer: String,
    aggregator: Arc<CatalogAggregator>,
    router: Router,
    queue_capacity: usize,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (session, outbound_rx) = Session::new(peer, queue_capacity);
    tracing::info!(session = %session.id(), peer = %session.peer(), "session opened");

    let writer_task = tokio::spawn(write_loop(
        Arc::clone(&session),
        writer,
        outbound_rx,
        session.subscribe_closed(),
    ));

    // Initial snapshot, even if the catalog is empty.
    let mut catalog_rx = aggregator.subscribe();
    let initial = catalog_rx.borrow_and_update().to_snapshot();
    session
        .send(ServerNotification::CapabilitiesSnapshot(initial))
        .await;

    let watcher_task = tokio::spawn(watch_catalog(Arc::clone(&session), catalog_rx));

    read_loop(&session, reader, &aggregator, &router).await;

    session.close();
    watcher_task.abort();
    if let Err(e) = writer_task.await {
        tracing::debug!(session = %session.id(), error = %e, "session writer ended abnormally");
    }
}

async fn read_loop<R>(
    session: &Arc<Session>,
    reader: R,
    aggregator: &CatalogAggregator,
    router: &Router,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::debug!(session = %session.id(), "client disconnected");
                return;
            }
            Err(e) => {
                tracing::debug!(session = %session.id(), error = %e, "client read failed");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let request = match parse_request(&line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(session = %session.id(), error = %e, "rejected client request");
                session.send(ServerNotification::error(e.to_string())).await;
                if e.is_fatal() {
                    return;
                }
                continue;
            }
        };

        match request {
            ClientRequest::ListCapabilities => {
                let snapshot = aggregator.get().to_snapshot();
                session
                    .send(ServerNotification::CapabilitiesSnapshot(snapshot))
                    .await;
            }
            ClientRequest::SetSubscription { enabled } => {
                tracing::debug!(session = %session.id(), enabled, "catalog subscription changed");
                session.set_subscribed(enabled);
            }
            ClientRequest::InvokeCapability {
                provider,
                name,
                arguments,
                correlation_id,
            } => {
                let target = QualifiedName::new(provider, name);
                if !session.begin_call(&correlation_id, target.clone()) {
                    session
                        .send(ServerNotification::Error {
                            message: format!("correlation id '{correlation_id}' is already in flight"),
                            correlation_id: Some(correlation_id),
                        })
                        .await;
                    continue;
                }
                router
                    .dispatch(session, target, arguments, correlation_id)
                    .await;
            }
        }
    }
}

/// Drain the outbound queue onto the wire until the session closes.
async fn write_loop<W>(
    session: Arc<Session>,
    writer: W,
    mut rx: mpsc::Receiver<ServerNotification>,
    mut closed: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin,
{
    let mut writer = writer;

    loop {
        let notification = tokio::select! {
            biased;
            next = rx.recv() => match next {
                Some(n) => n,
                None => break,
            },
            () = closed_signal(&mut closed) => {
                // Flush what was queued before the close (e.g. a final error).
                while let Ok(n) = rx.try_recv() {
                    if write_line(&session, &mut writer, &n).await.is_err() {
                        break;
                    }
                }
                break;
            }
        };
        if write_line(&session, &mut writer, &notification).await.is_err() {
            session.close();
            break;
        }
    }

    let _ = writer.shutdown().await;
}

async fn write_line<W>(
    session: &Session,
    writer: &mut W,
    notification: &ServerNotification,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = match notification.to_line() {
        Ok(line) => line,
        Err(e) => {
            tracing::warn!(session = %session.id(), error = %e, "failed to serialize notification");
            return Ok(());
        }
    };
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

/// Push a fresh snapshot to subscribed clients whenever the catalog changes.
async fn watch_catalog(
    session: Arc<Session>,
    mut catalog_rx: watch::Receiver<Arc<crate::catalog::Catalog>>,
) {
    while catalog_rx.changed().await.is_ok() {
        if session.is_closed() {
            break;
        }
        if !session.is_subscribed() {
            continue;
        }
        let snapshot = catalog_rx.borrow_and_update().to_snapshot();
        session
            .send(ServerNotification::CapabilitiesSnapshot(snapshot))
            .await;
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn result(correlation_id: &str) -> CapabilityResult {
        CapabilityResult {
            correlation_id: correlation_id.into(),
            provider: "a".into(),
            name: "echo".into(),
            success: true,
            result: Some(serde_json::json!("ok")),
            error: None,
            error_kind: None,
            execution_time_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_duplicate_correlation_id_rejected() {
        let (session, _rx) = Session::new("test", 4);
        assert!(session.begin_call("c1", QualifiedName::new("a", "echo")));
        assert!(!session.begin_call("c1", QualifiedName::new("a", "other")));
        assert_eq!(session.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_complete_delivers_at_most_once() {
        let (session, mut rx) = Session::new("test", 4);
        session.begin_call("c1", QualifiedName::new("a", "echo"));

        assert!(session.complete(result("c1")).await);
        assert!(!session.complete(result("c1")).await);

        match rx.recv().await.unwrap() {
            ServerNotification::CapabilityResult(r) => assert_eq!(r.correlation_id, "c1"),
            other => panic!("unexpected notification: {other:?}"),
        }
        assert!(rx.try_recv().is_err());

        // Once answered, the id may be reused.
        assert!(session.begin_call("c1", QualifiedName::new("a", "echo")));
    }

    #[tokio::test]
    async fn test_close_abandons_pending_calls() {
        let (session, mut rx) = Session::new("test", 4);
        session.begin_call("c1", QualifiedName::new("a", "slow"));
        session.begin_call("c2", QualifiedName::new("b", "slow"));

        assert_eq!(session.close(), 2);
        assert!(session.is_closed());
        assert!(!session.complete(result("c1")).await);
        assert!(!session.begin_call("c3", QualifiedName::new("a", "echo")));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_queue_waits_for_capacity() {
        let (session, mut rx) = Session::new("test", 1);
        assert!(session.send(ServerNotification::error("first")).await);

        let sender = Arc::clone(&session);
        let blocked =
            tokio::spawn(async move { sender.send(ServerNotification::error("second")).await });

        assert_eq!(rx.recv().await.unwrap(), ServerNotification::error("first"));
        assert!(blocked.await.unwrap());
        assert_eq!(rx.recv().await.unwrap(), ServerNotification::error("second"));
    }

    #[tokio::test]
    async fn test_close_releases_blocked_sender() {
        let (session, _rx) = Session::new("test", 1);
        assert!(session.send(ServerNotification::error("fill")).await);

        let sender = Arc::clone(&session);
        let blocked =
            tokio::spawn(async move { sender.send(ServerNotification::error("stuck")).await });
        tokio::task::yield_now().await;

        session.close();
        assert!(!blocked.await.unwrap());
    }

    #[test]
    fn test_subscription_defaults_on() {
        let (session, _rx) = Session::new("test", 1);
        assert!(session.is_subscribed());
        session.set_subscribed(false);
        assert!(!session.is_subscribed());
    }
}
