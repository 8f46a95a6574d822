//! Backend connections — tool provider processes spoken to over stdio.
//!
//! This module handles:
//! - Spawning provider child processes and observing their exit
//! - Line-delimited JSON-RPC 2.0 over process stdio, many calls in flight
//! - The `initialize` handshake, capability discovery, and tool calls
//! - The per-connection state machine (`connecting → ready|failed → closed`)

pub mod connection;
pub mod errors;
pub mod lifecycle;
pub mod transport;
pub mod types;

pub use connection::{BackendConnection, ConnectionSettings};
pub use errors::BackendError;
pub use types::{BackendEvent, ConnectionState, ProviderSpec, ProviderToolDefinition};
