use super::{FileNode, StagingNode, StagingRef};
use crate::node::Node;
use crate::value::DatabaseValue;
use std::collections::BTreeMap;

/// Interior node of the staging tree.
///
/// Holds one child per distinct key. Children keep insertion order, which is
/// also the order merges visit them.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectNode {
    pub(super) location: Node,
    pub(crate) children: Vec<StagingNode>,
}

impl ObjectNode {
    /// Creates an object without children.
    pub fn new(location: Node) -> Self {
        Self {
            location,
            children: Vec::new(),
        }
    }

    /// Creates an object with the given children.
    pub fn with_children(location: Node, children: Vec<StagingNode>) -> Self {
        Self { location, children }
    }

    /// Location of the object.
    pub fn location(&self) -> &Node {
        &self.location
    }

    /// Direct children.
    pub fn children(&self) -> &[StagingNode] {
        &self.children
    }

    /// Number of direct children.
    pub fn children_count(&self) -> usize {
        self.children.len()
    }

    /// True if the object has no children.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Removes all children.
    pub fn clear(&mut self) {
        self.children.clear();
    }

    /// Drops deleted leaves and objects left without children.
    pub fn prune(&mut self) {
        self.children.retain_mut(|child| {
            if let StagingNode::Object(o) = child {
                o.prune();
            }
            !child.is_empty()
        });
    }

    pub(crate) fn position(&self, node: &Node) -> Option<usize> {
        self.children.iter().position(|c| c.location() == node)
    }

    fn position_by_key(&self, key: &str) -> Option<usize> {
        self.children.iter().position(|c| c.location().key() == key)
    }

    /// Looks up a node by keys relative to this object.
    ///
    /// An empty path returns the object itself. Walking past a leaf returns
    /// `None`.
    pub fn child_by_path<S: AsRef<str>>(&self, path: &[S]) -> Option<StagingRef<'_>> {
        let Some((first, rest)) = path.split_first() else {
            return Some(StagingRef::Object(self));
        };
        let child = &self.children[self.position_by_key(first.as_ref())?];
        match child {
            StagingNode::Object(o) => o.child_by_path(rest),
            leaf if rest.is_empty() => Some(leaf.view()),
            _ => None,
        }
    }

    /// Looks up a node by its location.
    pub fn child_by_node(&self, node: &Node) -> Option<StagingRef<'_>> {
        if node == &self.location {
            return Some(StagingRef::Object(self));
        }
        if !node.has_ancestor(&self.location) {
            return None;
        }
        let mut current = self;
        for next in node.after(&self.location) {
            let child = &current.children[current.position(&next)?];
            if &next == node {
                return Some(child.view());
            }
            match child {
                StagingNode::Object(o) => current = o,
                _ => return None,
            }
        }
        None
    }

    /// Walks `path` until a leaf or a missing child.
    ///
    /// Returns the deepest node found and the keys that could not be resolved.
    pub fn nearest_child<S: AsRef<str>>(&self, path: &[S]) -> (StagingRef<'_>, Vec<String>) {
        let mut current = self;
        for (i, key) in path.iter().enumerate() {
            let Some(index) = current.position_by_key(key.as_ref()) else {
                return (StagingRef::Object(current), to_owned(&path[i..]));
            };
            match &current.children[index] {
                StagingNode::Object(o) => current = o,
                leaf => return (leaf.view(), to_owned(&path[i + 1..])),
            }
        }
        (StagingRef::Object(current), Vec::new())
    }

    /// Returns the deepest staged node on the way to `node`.
    ///
    /// Stops at the first leaf. Falls back to this object.
    pub fn nearest_common_node(&self, node: &Node) -> StagingRef<'_> {
        if node == &self.location || !node.has_ancestor(&self.location) {
            return StagingRef::Object(self);
        }
        let mut current = self;
        for next in node.after(&self.location) {
            let Some(index) = current.position(&next) else {
                break;
            };
            match &current.children[index] {
                StagingNode::Object(o) if &next == node => return StagingRef::Object(o),
                StagingNode::Object(o) => current = o,
                leaf => return leaf.view(),
            }
        }
        StagingRef::Object(current)
    }

    /// All file leaves of the tree.
    pub fn files(&self) -> Vec<&FileNode> {
        let mut files = Vec::new();
        self.collect_files(&mut files);
        files
    }

    fn collect_files<'a>(&'a self, files: &mut Vec<&'a FileNode>) {
        for child in &self.children {
            match child {
                StagingNode::File(f) => files.push(f),
                StagingNode::Object(o) => o.collect_files(files),
                StagingNode::Value(_) => {}
            }
        }
    }

    /// Flattens value leaves into `(location, value)` pairs. Files are skipped.
    pub fn reduce_values(&self) -> Vec<(Node, Option<DatabaseValue>)> {
        let mut values = Vec::new();
        self.collect_values(&mut values);
        values
    }

    fn collect_values(&self, values: &mut Vec<(Node, Option<DatabaseValue>)>) {
        for child in &self.children {
            match child {
                StagingNode::Value(v) => values.push((v.location.clone(), v.value.clone())),
                StagingNode::Object(o) => o.collect_values(values),
                StagingNode::File(_) => {}
            }
        }
    }

    /// Nested map of written values. Empty subtrees and deletes are omitted.
    pub fn to_wire(&self) -> Option<DatabaseValue> {
        let map: BTreeMap<String, DatabaseValue> = self
            .children
            .iter()
            .filter_map(|c| c.to_wire().map(|v| (c.location().key().to_string(), v)))
            .collect();
        if map.is_empty() {
            None
        } else {
            Some(DatabaseValue::Map(map))
        }
    }
}

fn to_owned<S: AsRef<str>>(path: &[S]) -> Vec<String> {
    path.iter().map(|s| s.as_ref().to_string()).collect()
}
