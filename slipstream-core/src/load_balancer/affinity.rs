//! Client-to-node affinity bindings.

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// How long a binding stays preferred after its last use.
pub const DEFAULT_AFFINITY_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
struct Binding {
    url: String,
    last_used: Instant,
}

/// Soft client-to-node bindings with a freshness window.
///
/// A binding is a preference, never a guarantee: selection still enforces
/// availability and capacity, and stale or dangling bindings simply fall
/// through to scored selection.
#[derive(Debug)]
pub struct AffinityTable {
    bindings: DashMap<String, Binding>,
    ttl: Duration,
}

impl AffinityTable {
    /// Creates a table with the default one-hour freshness window.
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_AFFINITY_TTL)
    }

    /// Creates a table with a custom freshness window.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            bindings: DashMap::new(),
            ttl,
        }
    }

    /// The node URL this client is bound to, if the binding is fresh.
    pub fn bound_node(&self, client_key: &str) -> Option<String> {
        let binding = self.bindings.get(client_key)?;
        if binding.last_used.elapsed() <= self.ttl {
            Some(binding.url.clone())
        } else {
            drop(binding);
            self.bindings.remove(client_key);
            None
        }
    }

    /// Binds a client to a node, refreshing the freshness window.
    pub fn bind(&self, client_key: &str, url: &str) {
        self.bindings.insert(
            client_key.to_string(),
            Binding {
                url: url.to_string(),
                last_used: Instant::now(),
            },
        );
    }

    /// Number of live bindings (stale entries included until touched).
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether the table holds no bindings.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

impl Default for AffinityTable {
    fn default() -> Self {
        Self::new()
    }
}
