//! Router — resolves a qualified name against the current catalog and
//! forwards the call to the owning backend.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use thiserror::Error;

use super::protocol::CapabilityResult;
use super::session::Session;
use crate::backend::{BackendConnection, BackendError};
use crate::catalog::{CatalogAggregator, QualifiedName};

/// Why a call did not produce a value.
#[derive(Debug, Clone, Error)]
pub enum RouteError {
    /// No ready provider exposes this capability.
    #[error("unknown capability '{provider}.{name}'")]
    UnknownCapability { provider: String, name: String },

    /// Required top-level arguments are missing.
    #[error("invalid arguments for '{provider}.{name}': missing required field(s): {missing}")]
    InvalidArguments {
        provider: String,
        name: String,
        missing: String,
    },

    /// The backend failed the call.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl RouteError {
    /// Short machine-readable kind, sent as `error_kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownCapability { .. } => "unknown_capability_error",
            Self::InvalidArguments { .. } => "invalid_arguments_error",
            Self::Backend(e) => e.kind(),
        }
    }
}

/// Dispatches capability calls from sessions to backends.
#[derive(Clone)]
pub struct Router {
    aggregator: Arc<CatalogAggregator>,
}

impl Router {
    pub fn new(aggregator: Arc<CatalogAggregator>) -> Self {
        Self { aggregator }
    }

    /// Resolve `target` to the connection that serves it.
    ///
    /// Validation happens here so a rejected call never reaches a backend.
    pub fn resolve(
        &self,
        target: &QualifiedName,
        arguments: &Value,
    ) -> Result<Arc<BackendConnection>, RouteError> {
        let unknown = || RouteError::UnknownCapability {
            provider: target.provider.clone(),
            name: target.name.clone(),
        };

        let catalog = self.aggregator.get();
        let descriptor = catalog.get(target).ok_or_else(unknown)?;

        let missing = descriptor.missing_required(arguments);
        if !missing.is_empty() {
            return Err(RouteError::InvalidArguments {
                provider: target.provider.clone(),
                name: target.name.clone(),
                missing: missing.join(", "),
            });
        }

        self.aggregator.backend(&target.provider).ok_or_else(unknown)
    }

    /// Route one call and deliver exactly one result to `session`.
    ///
    /// The call itself runs in its own task; this returns as soon as it is
    /// handed off (or rejected).
    pub async fn dispatch(
        &self,
        session: &Arc<Session>,
        target: QualifiedName,
        arguments: Value,
        correlation_id: String,
    ) {
        let backend = match self.resolve(&target, &arguments) {
            Ok(backend) => backend,
            Err(e) => {
                tracing::info!(
                    session = %session.id(),
                    correlation_id = %correlation_id,
                    target = %target,
                    error = %e,
                    "call rejected"
                );
                session
                    .complete(failure(correlation_id, &target, &e, 0))
                    .await;
                return;
            }
        };

        tracing::debug!(
            session = %session.id(),
            correlation_id = %correlation_id,
            target = %target,
            "dispatching call"
        );

        let session = Arc::clone(session);
        tokio::spawn(async move {
            let start = Instant::now();
            let outcome = backend.invoke(&target.name, arguments).await;
            let elapsed = start.elapsed().as_millis() as u64;

            let result = match outcome {
                Ok(value) => {
                    tracing::info!(
                        correlation_id = %correlation_id,
                        target = %target,
                        execution_time_ms = elapsed,
                        "call succeeded"
                    );
                    CapabilityResult {
                        correlation_id,
                        provider: target.provider,
                        name: target.name,
                        success: true,
                        result: Some(value),
                        error: None,
                        error_kind: None,
                        execution_time_ms: elapsed,
                    }
                }
                Err(e) => {
                    let e = RouteError::from(e);
                    tracing::warn!(
                        correlation_id = %correlation_id,
                        target = %target,
                        execution_time_ms = elapsed,
                        error = %e,
                        "call failed"
                    );
                    failure(correlation_id, &target, &e, elapsed)
                }
            };

            session.complete(result).await;
        });
    }
}

fn failure(
    correlation_id: String,
    target: &QualifiedName,
    error: &RouteError,
    execution_time_ms: u64,
) -> CapabilityResult {
    CapabilityResult {
        correlation_id,
        provider: target.provider.clone(),
        name: target.name.clone(),
        success: false,
        result: None,
        error: Some(error.to_string()),
        error_kind: Some(error.kind()),
        execution_time_ms,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
