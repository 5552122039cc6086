//! Realtime configuration.

use crate::error::{CoreError, CoreResult};
use crate::node::Node;
use std::time::Duration;

/// Cache policy of a realtime database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Backend default (usually corresponds to `InMemory`).
    #[default]
    Default,
    /// No cache is used.
    NoCache,
    /// Data is kept in memory.
    InMemory,
    /// Data is persisted to on-device storage.
    Persistence,
}

/// Configuration shared by transactions, the in-memory database and
/// collection views.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Maximum depth of a staged location (the root is depth 0).
    pub max_node_depth: usize,

    /// Characters that must not appear in a key.
    pub unavailable_symbols: String,

    /// Key of the branch node that stores the links index.
    pub links_node_key: String,

    /// Timeout for single loads made on behalf of collections.
    pub load_timeout: Duration,

    /// Cache policy of the database.
    pub cache_policy: CachePolicy,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            max_node_depth: 32,
            unavailable_symbols: ".#$[]".to_string(),
            links_node_key: crate::node::InternalKeys::LINKS.to_string(),
            load_timeout: Duration::from_secs(10),
            cache_policy: CachePolicy::Default,
        }
    }
}

impl RealtimeConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum node depth.
    #[must_use]
    pub fn max_node_depth(mut self, depth: usize) -> Self {
        self.max_node_depth = depth;
        self
    }

    /// Sets the characters that are not allowed in keys.
    #[must_use]
    pub fn unavailable_symbols(mut self, symbols: impl Into<String>) -> Self {
        self.unavailable_symbols = symbols.into();
        self
    }

    /// Sets the key of the links branch.
    #[must_use]
    pub fn links_node_key(mut self, key: impl Into<String>) -> Self {
        self.links_node_key = key.into();
        self
    }

    /// Sets the load timeout.
    #[must_use]
    pub fn load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout = timeout;
        self
    }

    /// Sets the cache policy.
    #[must_use]
    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    /// Returns the links branch node.
    pub fn links_node(&self) -> Node {
        Node::branch(self.links_node_key.clone())
    }

    /// Checks a location against the depth limit and the key alphabet.
    pub fn validate(&self, node: &Node) -> CoreResult<()> {
        let depth = node.depth();
        if depth > self.max_node_depth {
            return Err(CoreError::DepthExceeded {
                depth,
                max: self.max_node_depth,
            });
        }
        for ancestor in node.ancestors().filter(|n| !n.is_root()) {
            if ancestor
                .key()
                .split('/')
                .any(|part| part.chars().any(|c| self.unavailable_symbols.contains(c)))
            {
                return Err(CoreError::InvalidKey {
                    key: ancestor.key().to_string(),
                });
            }
        }
        Ok(())
    }
}
