//! Read-side view of a database location.

use crate::node::Node;
use crate::value::DatabaseValue;
use std::collections::BTreeMap;

/// Data loaded from a location.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Location of the data.
    pub node: Node,
    /// Value at the location, `None` if nothing is stored.
    pub value: Option<DatabaseValue>,
}

impl Snapshot {
    /// Creates a snapshot.
    pub fn new(node: Node, value: Option<DatabaseValue>) -> Self {
        Self { node, value }
    }

    /// Creates a snapshot of a missing location.
    pub fn missing(node: Node) -> Self {
        Self { node, value: None }
    }

    /// Key of the location.
    pub fn key(&self) -> &str {
        self.node.key()
    }

    /// True if a value is stored at the location.
    pub fn exists(&self) -> bool {
        self.value.is_some()
    }

    fn map(&self) -> Option<&BTreeMap<String, DatabaseValue>> {
        self.value.as_ref().and_then(DatabaseValue::as_map)
    }

    /// True if the location is an object with at least one child.
    pub fn has_children(&self) -> bool {
        self.map().map(|m| !m.is_empty()).unwrap_or(false)
    }

    /// Number of direct children.
    pub fn children_count(&self) -> usize {
        self.map().map(BTreeMap::len).unwrap_or(0)
    }

    /// Direct children in key order.
    pub fn children(&self) -> Vec<Snapshot> {
        self.map()
            .map(|m| {
                m.iter()
                    .map(|(k, v)| Snapshot::new(self.node.child(k), Some(v.clone())))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Snapshot of a descendant. Missing descendants have no value.
    pub fn child(&self, path: &str) -> Snapshot {
        let value = self.value.as_ref().and_then(|v| v.get_path(path)).cloned();
        Snapshot::new(self.node.child(path), value)
    }

    /// True if a descendant exists.
    pub fn has_child(&self, path: &str) -> bool {
        self.value
            .as_ref()
            .and_then(|v| v.get_path(path))
            .is_some()
    }

    /// Returns a copy without the given direct children.
    pub fn excluding<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> Snapshot {
        let value = match &self.value {
            Some(DatabaseValue::Map(map)) => {
                let mut map = map.clone();
                for key in keys {
                    map.remove(key);
                }
                Some(DatabaseValue::Map(map))
            }
            other => other.clone(),
        };
        Snapshot::new(self.node.clone(), value)
    }
}
