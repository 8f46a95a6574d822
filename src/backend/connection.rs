//! Backend connection — one provider process and its protocol session.
//!
//! State machine: `connecting → ready | failed`, `ready → failed | closed`,
//! `failed → closed`. Every transition is reported to the catalog
//! aggregator, which rebuilds the catalog. A failed connection is never
//! revived; its tools stay out of the catalog until the proxy restarts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot, watch};

use super::errors::BackendError;
use super::lifecycle::{self, ProcessExit, StderrTail, SHUTDOWN_TIMEOUT};
use super::transport::{extract_result, StdioTransport, TransportEvent};
use super::types::{
    error_codes, methods, BackendEvent, ConnectionState, InitializeResult, ProviderSpec,
    ProviderToolDefinition, ToolsCallResult, ToolsListResult, PROTOCOL_VERSION,
};

// ─── Settings ───────────────────────────────────────────────────────────────

/// Default bound for the handshake and for capability discovery.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeouts applied by a connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    /// Bound for `initialize` and `tools/list`.
    pub discovery_timeout: Duration,
    /// Optional ceiling for `tools/call`. `None` means unbounded.
    pub invocation_timeout: Option<Duration>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            invocation_timeout: None,
        }
    }
}

// ─── BackendConnection ──────────────────────────────────────────────────────

/// Live protocol session of a started connection.
struct LiveSession {
    transport: Arc<StdioTransport>,
    stderr_tail: StderrTail,
    /// Tools advertised in the `initialize` result, if any.
    handshake_tools: Option<Vec<ProviderToolDefinition>>,
}

/// Owns exactly one provider process and its request/response protocol.
pub struct BackendConnection {
    spec: ProviderSpec,
    settings: ConnectionSettings,
    state: watch::Sender<ConnectionState>,
    live: Mutex<Option<LiveSession>>,
    tools: RwLock<Arc<Vec<ProviderToolDefinition>>>,
    /// Serializes discovery: at most one `tools/list` in flight.
    discovery_lock: tokio::sync::Mutex<()>,
    events: mpsc::UnboundedSender<BackendEvent>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    shutting_down: AtomicBool,
    exited: AtomicBool,
}

impl BackendConnection {
    /// Create a connection in the `connecting` state. Nothing is spawned yet.
    pub fn new(
        spec: ProviderSpec,
        settings: ConnectionSettings,
        events: mpsc::UnboundedSender<BackendEvent>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Arc::new(Self {
            spec,
            settings,
            state,
            live: Mutex::new(None),
            tools: RwLock::new(Arc::new(Vec::new())),
            discovery_lock: tokio::sync::Mutex::new(()),
            events,
            shutdown_tx: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
            exited: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Last capability list reported by the provider.
    pub fn tools(&self) -> Arc<Vec<ProviderToolDefinition>> {
        Arc::clone(&self.tools.read())
    }

    // ─── Start ──────────────────────────────────────────────────────────

    /// Launch the process and perform the `initialize` handshake.
    ///
    /// The connection stays `connecting` until `list_capabilities` succeeds.
    pub async fn start(self: &Arc<Self>) -> Result<(), BackendError> {
        let spawned = match lifecycle::spawn_process(&self.spec) {
            Ok(spawned) => spawned,
            Err(e) => {
                self.exited.store(true, Ordering::SeqCst);
                self.set_state(ConnectionState::Failed);
                return Err(e);
            }
        };

        let (transport, transport_events) =
            StdioTransport::new(&self.spec.name, spawned.stdin, spawned.stdout);
        let transport = Arc::new(transport);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        *self.shutdown_tx.lock() = Some(shutdown_tx);
        let exit_rx = lifecycle::watch_exit(self.spec.name.clone(), spawned.child, shutdown_rx);

        *self.live.lock() = Some(LiveSession {
            transport: Arc::clone(&transport),
            stderr_tail: spawned.stderr_tail.clone(),
            handshake_tools: None,
        });

        tokio::spawn(supervise(Arc::downgrade(self), transport_events, exit_rx));

        let init = match tokio::time::timeout(
            self.settings.discovery_timeout,
            self.initialize(&transport),
        )
        .await
        {
            Ok(Ok(init)) => init,
            Ok(Err(reason)) => return Err(self.fail_protocol(reason, &spawned.stderr_tail)),
            Err(_) => {
                let reason = format!(
                    "initialization timed out after {}ms",
                    self.settings.discovery_timeout.as_millis()
                );
                return Err(self.fail_protocol(reason, &spawned.stderr_tail));
            }
        };

        if let Some(info) = &init.server_info {
            tracing::info!(
                provider = %self.spec.name,
                server_name = info.name.as_deref().unwrap_or("unknown"),
                server_version = info.version.as_deref().unwrap_or("unknown"),
                protocol = init.protocol_version.as_deref().unwrap_or("unknown"),
                "provider handshake complete"
            );
        }

        if let Some(live) = self.live.lock().as_mut() {
            live.handshake_tools = init.tools;
        }

        Ok(())
    }

    async fn initialize(&self, transport: &StdioTransport) -> Result<InitializeResult, String> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
        });

        let response = transport
            .request(methods::INITIALIZE, Some(params))
            .await
            .map_err(|e| e.to_string())?;
        let result = extract_result(response)
            .map_err(|e| format!("initialize rejected [{}]: {}", e.code, e.message))?;
        let init: InitializeResult = serde_json::from_value(result)
            .map_err(|e| format!("failed to parse initialize response: {e}"))?;

        transport
            .notify(methods::INITIALIZED, None)
            .await
            .map_err(|e| e.to_string())?;

        Ok(init)
    }

    // ─── Discovery ──────────────────────────────────────────────────────

    /// Ask the provider for its tools.
    ///
    /// On success the list is stored and the connection becomes `ready`.
    /// On timeout or error the connection becomes `failed`; there is no retry.
    pub async fn list_capabilities(&self) -> Result<Vec<ProviderToolDefinition>, BackendError> {
        let _discovery = self.discovery_lock.lock().await;

        let state = self.state();
        if !matches!(state, ConnectionState::Connecting | ConnectionState::Ready) {
            return Err(self.capability_error(format!("connection is {state}")));
        }

        let live = self.live.lock().as_ref().map(|l| {
            (
                Arc::clone(&l.transport),
                l.stderr_tail.clone(),
                l.handshake_tools.clone(),
            )
        });
        let Some((transport, stderr_tail, handshake_tools)) = live else {
            return Err(self.capability_error("connection was never started".into()));
        };

        let outcome = match tokio::time::timeout(
            self.settings.discovery_timeout,
            transport.request(methods::TOOLS_LIST, None),
        )
        .await
        {
            Err(_) => Err(format!(
                "tools/list timed out after {}ms",
                self.settings.discovery_timeout.as_millis()
            )),
            Ok(Err(e)) => Err(e.to_string()),
            Ok(Ok(response)) => match extract_result(response) {
                Ok(value) => serde_json::from_value::<ToolsListResult>(value)
                    .map(|r| r.tools)
                    .map_err(|e| format!("failed to parse tools/list response: {e}")),
                Err(e) if e.code == error_codes::METHOD_NOT_FOUND && handshake_tools.is_some() => {
                    Ok(handshake_tools.unwrap_or_default())
                }
                Err(e) => Err(format!("tools/list rejected [{}]: {}", e.code, e.message)),
            },
        };

        match outcome {
            Ok(tools) => {
                // A crash during discovery wins over a late tools/list reply.
                let state = self.state();
                if !matches!(state, ConnectionState::Connecting | ConnectionState::Ready) {
                    return Err(self.capability_error(format!(
                        "connection became {state} during discovery"
                    )));
                }
                tracing::info!(provider = %self.spec.name, tools = tools.len(), "capabilities discovered");
                *self.tools.write() = Arc::new(tools.clone());
                if !self.set_state(ConnectionState::Ready) && self.state() == ConnectionState::Ready {
                    // Already ready: the list itself changed.
                    self.emit(ConnectionState::Ready);
                }
                Ok(tools)
            }
            Err(reason) => {
                let reason = format!("{reason}{}", stderr_tail.suffix());
                tracing::warn!(provider = %self.spec.name, reason = %reason, "capability discovery failed");
                self.fail(&reason);
                Err(self.capability_error(reason))
            }
        }
    }

    /// Re-run discovery after the provider announced a tool list change.
    async fn refresh(&self) {
        if self.state() != ConnectionState::Ready {
            return;
        }
        tracing::info!(provider = %self.spec.name, "provider tool list changed, rediscovering");
        if let Err(e) = self.list_capabilities().await {
            tracing::warn!(provider = %self.spec.name, error = %e, "rediscovery failed");
        }
    }

    // ─── Invocation ─────────────────────────────────────────────────────

    /// Call one tool on this provider.
    ///
    /// Provider error replies, results flagged `isError`, and transport
    /// failures during the call all come back as `BackendError::Invocation`.
    pub async fn invoke(
        &self,
        local_name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, BackendError> {
        let state = self.state();
        if state != ConnectionState::Ready {
            return Err(BackendError::NotReady {
                provider: self.spec.name.clone(),
                state: state.to_string(),
            });
        }

        let transport = self
            .live
            .lock()
            .as_ref()
            .map(|l| Arc::clone(&l.transport))
            .ok_or_else(|| BackendError::NotReady {
                provider: self.spec.name.clone(),
                state: state.to_string(),
            })?;

        let params = serde_json::json!({
            "name": local_name,
            "arguments": arguments,
        });
        let call = transport.request(methods::TOOLS_CALL, Some(params));

        let response = match self.settings.invocation_timeout {
            Some(ceiling) => tokio::time::timeout(ceiling, call).await.map_err(|_| {
                BackendError::InvocationTimeout {
                    provider: self.spec.name.clone(),
                    tool: local_name.to_string(),
                    timeout_ms: ceiling.as_millis() as u64,
                }
            })?,
            None => call.await,
        }
        .map_err(|e| e.into_invocation(&self.spec.name))?;

        let value = extract_result(response).map_err(|e| BackendError::Invocation {
            provider: self.spec.name.clone(),
            message: format!("[{}] {}", e.code, e.message),
        })?;

        // Providers that do not follow the content/isError shape are passed through.
        if let Ok(call_result) = ToolsCallResult::deserialize(&value) {
            if call_result.is_error {
                let text = call_result.text();
                let message = if text.is_empty() {
                    format!("tool '{local_name}' reported an error")
                } else {
                    text
                };
                return Err(BackendError::Invocation {
                    provider: self.spec.name.clone(),
                    message,
                });
            }
        }

        Ok(value)
    }

    // ─── Shutdown ───────────────────────────────────────────────────────

    /// Stop the provider process and move to `closed`.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let transport = self.live.lock().as_ref().map(|l| Arc::clone(&l.transport));
        if self.exited.load(Ordering::SeqCst) || transport.is_none() {
            self.set_state(ConnectionState::Closed);
            return;
        }
        if let Some(transport) = transport {
            transport.close_input().await;
        }

        let mut state_rx = self.subscribe_state();
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }

        let wait = state_rx.wait_for(|s| *s == ConnectionState::Closed);
        if tokio::time::timeout(SHUTDOWN_TIMEOUT + Duration::from_secs(1), wait)
            .await
            .is_err()
        {
            tracing::warn!(provider = %self.spec.name, "provider did not report exit during shutdown");
            self.set_state(ConnectionState::Closed);
        }
    }

    // ─── Internals ──────────────────────────────────────────────────────

    /// Apply a legal transition. Returns whether the state changed.
    fn set_state(&self, next: ConnectionState) -> bool {
        let mut previous = next;
        let changed = self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                previous = *current;
                *current = next;
                true
            } else {
                false
            }
        });

        if changed {
            tracing::info!(
                provider = %self.spec.name,
                from = %previous,
                to = %next,
                "connection state changed"
            );
            self.emit(next);
        }
        changed
    }

    fn emit(&self, state: ConnectionState) {
        let _ = self.events.send(BackendEvent {
            provider: self.spec.name.clone(),
            state,
        });
    }

    /// Mark the connection failed and let go of its process.
    fn fail(&self, reason: &str) {
        self.set_state(ConnectionState::Failed);

        let transport = self.live.lock().as_ref().map(|l| Arc::clone(&l.transport));
        let shutdown_tx = self.shutdown_tx.lock().take();
        if let Some(transport) = transport {
            transport.fail_all(reason);
            tokio::spawn(async move {
                transport.close_input().await;
                if let Some(tx) = shutdown_tx {
                    let _ = tx.send(());
                }
            });
        }
    }

    fn fail_protocol(&self, reason: String, stderr_tail: &StderrTail) -> BackendError {
        let reason = format!("{reason}{}", stderr_tail.suffix());
        tracing::warn!(provider = %self.spec.name, reason = %reason, "provider handshake failed");
        self.fail(&reason);
        BackendError::Protocol {
            provider: self.spec.name.clone(),
            reason,
        }
    }

    fn capability_error(&self, reason: String) -> BackendError {
        BackendError::CapabilityList {
            provider: self.spec.name.clone(),
            reason,
        }
    }

    fn on_stream_closed(&self, reason: &str) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        if matches!(
            self.state(),
            ConnectionState::Connecting | ConnectionState::Ready
        ) {
            tracing::warn!(provider = %self.spec.name, reason, "provider stream closed");
            self.fail(reason);
        }
    }

    fn on_process_exit(&self, exit: Option<ProcessExit>) {
        self.exited.store(true, Ordering::SeqCst);

        // A stop started by `fail` does not make a non-zero exit clean.
        let (clean, description) = match &exit {
            Some(exit) => (
                exit.success || self.shutting_down.load(Ordering::SeqCst),
                exit.description.clone(),
            ),
            None => (false, "exit status unavailable".to_string()),
        };

        if let Some(live) = self.live.lock().as_ref() {
            live.transport
                .fail_all(&format!("provider process exited ({description})"));
        }

        if clean {
            self.set_state(ConnectionState::Closed);
        } else {
            tracing::warn!(provider = %self.spec.name, status = %description, "provider process crashed");
            self.set_state(ConnectionState::Failed);
        }
    }
}

/// Route transport events and the process exit into the connection.
async fn supervise(
    conn: Weak<BackendConnection>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    mut exit_rx: oneshot::Receiver<ProcessExit>,
) {
    let mut events_open = true;
    loop {
        tokio::select! {
            event = events.recv(), if events_open => match event {
                Some(TransportEvent::Notification { method, .. }) => {
                    if method == methods::TOOLS_LIST_CHANGED {
                        if let Some(conn) = conn.upgrade() {
                            tokio::spawn(async move { conn.refresh().await });
                        }
                    }
                }
                Some(TransportEvent::Closed { reason }) => {
                    if let Some(conn) = conn.upgrade() {
                        conn.on_stream_closed(&reason);
                    }
                }
                None => events_open = false,
            },
            exit = &mut exit_rx => {
                if let Some(conn) = conn.upgrade() {
                    conn.on_process_exit(exit.ok());
                }
                break;
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
