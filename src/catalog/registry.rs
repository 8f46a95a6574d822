//! Catalog — one immutable snapshot of every ready provider's capabilities.
//!
//! Capabilities are keyed by `(provider, local name)`, so two providers may
//! expose the same local tool name without colliding.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use super::schema::{self, CapabilityDescriptor, QualifiedName};
use crate::backend::ProviderToolDefinition;

/// Aggregated, normalized capabilities across all ready providers.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    revision: u64,
    entries: BTreeMap<QualifiedName, CapabilityDescriptor>,
}

impl Catalog {
    /// An empty catalog at revision 0.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a catalog from each provider's raw tool list.
    ///
    /// A provider reporting the same local name twice keeps the first entry.
    pub fn from_providers<'a, I>(revision: u64, providers: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a [ProviderToolDefinition])>,
    {
        let mut entries = BTreeMap::new();
        for (provider, tools) in providers {
            for tool in tools {
                let descriptor = schema::normalize(provider, tool);
                let key = descriptor.qualified_name();
                if entries.contains_key(&key) {
                    tracing::warn!(
                        provider,
                        tool = %tool.name,
                        "provider reported duplicate tool name, keeping the first"
                    );
                    continue;
                }
                entries.insert(key, descriptor);
            }
        }
        Self { revision, entries }
    }

    /// Monotonic rebuild counter.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Look up a capability by its qualified name.
    pub fn get(&self, name: &QualifiedName) -> Option<&CapabilityDescriptor> {
        self.entries.get(name)
    }

    /// All descriptors, ordered by provider then local name.
    pub fn descriptors(&self) -> impl Iterator<Item = &CapabilityDescriptor> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Count capabilities belonging to one provider.
    pub fn tools_for_provider(&self, provider: &str) -> usize {
        self.entries
            .keys()
            .filter(|key| key.provider == provider)
            .count()
    }

    /// Providers contributing at least one capability, sorted.
    pub fn provider_names(&self) -> Vec<String> {
        self.entries
            .keys()
            .map(|key| key.provider.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// One-line summary for logs: `"5 capabilities across 2 providers: a (3), b (2)"`.
    pub fn summary(&self) -> String {
        let providers = self.provider_names();
        let parts: Vec<String> = providers
            .iter()
            .map(|name| format!("{name} ({})", self.tools_for_provider(name)))
            .collect();
        format!(
            "{} capabilities across {} providers: {}",
            self.len(),
            providers.len(),
            if parts.is_empty() {
                "none".to_string()
            } else {
                parts.join(", ")
            }
        )
    }

    /// Wire form of the catalog.
    pub fn to_snapshot(&self) -> CatalogSnapshot {
        CatalogSnapshot {
            revision: self.revision,
            capabilities: self.descriptors().cloned().collect(),
        }
    }
}

/// Serializable copy of a catalog, detached from the snapshot it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogSnapshot {
    pub revision: u64,
    pub capabilities: Vec<CapabilityDescriptor>,
}

// ─── Tests ───────────────────────────────────────────────────────────────────
