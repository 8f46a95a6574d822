//! Front end — line-delimited JSON over TCP.
//!
//! This module handles:
//! - The wire protocol spoken with front-end clients
//! - Sessions: outbound queue, pending calls, catalog subscription
//! - Routing calls by qualified name to the owning backend
//! - The TCP accept loop

pub mod protocol;
pub mod router;
pub mod server;
pub mod session;

pub use protocol::{CapabilityResult, ClientRequest, ServerNotification};
pub use router::{RouteError, Router};
pub use server::FrontendServer;
pub use session::Session;
