//! Capability catalog — normalized tool descriptors across all providers.
//!
//! - `schema`: provider tool definition → capability descriptor
//! - `registry`: immutable catalog snapshot keyed by `(provider, name)`
//! - `aggregator`: owns the connections, rebuilds and publishes snapshots

pub mod aggregator;
pub mod registry;
pub mod schema;

pub use aggregator::CatalogAggregator;
pub use registry::{Catalog, CatalogSnapshot};
pub use schema::{CapabilityDescriptor, QualifiedName};
