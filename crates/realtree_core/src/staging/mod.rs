//! Staging tree of not yet committed (or cached) writes.
//!
//! Interior locations are [`ObjectNode`]s, leaves are [`ValueNode`]s
//! (raw payloads) or [`FileNode`]s (binary data with metadata). A location
//! holds at most one of them at any time.

mod merge;
mod object;

pub use merge::{AppendObserver, ConflictResolver};
pub use object::ObjectNode;

use crate::node::Node;
use crate::value::DatabaseValue;
use std::collections::BTreeMap;

/// Metadata attached to a file write.
pub type FileMetadata = BTreeMap<String, DatabaseValue>;

/// Which side wins when two staged trees write the same location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeStrategy {
    /// Keep the receiving tree's node.
    Old,
    /// Take the merged tree's node.
    #[default]
    New,
}

/// Leaf holding a raw value. `None` deletes the location.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueNode {
    /// Location of the value.
    pub location: Node,
    /// Value to write.
    pub value: Option<DatabaseValue>,
}

impl ValueNode {
    /// Creates a value leaf.
    pub fn new(location: Node, value: Option<DatabaseValue>) -> Self {
        Self { location, value }
    }
}

/// Leaf holding file data. `None` deletes the file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileNode {
    /// Location of the file.
    pub location: Node,
    /// File contents.
    pub data: Option<Vec<u8>>,
    /// Metadata sent along with the contents.
    pub metadata: FileMetadata,
}

impl FileNode {
    /// Creates a file leaf.
    pub fn new(location: Node, data: Option<Vec<u8>>, metadata: FileMetadata) -> Self {
        Self {
            location,
            data,
            metadata,
        }
    }
}

/// A node of the staging tree.
#[derive(Debug, Clone, PartialEq)]
pub enum StagingNode {
    /// Raw value leaf.
    Value(ValueNode),
    /// File leaf.
    File(FileNode),
    /// Container of child nodes.
    Object(ObjectNode),
}

impl StagingNode {
    /// Creates a value leaf.
    pub fn value(location: Node, value: Option<DatabaseValue>) -> Self {
        StagingNode::Value(ValueNode::new(location, value))
    }

    /// Creates a file leaf.
    pub fn file(location: Node, data: Option<Vec<u8>>, metadata: FileMetadata) -> Self {
        StagingNode::File(FileNode::new(location, data, metadata))
    }

    /// Location of the node.
    pub fn location(&self) -> &Node {
        match self {
            StagingNode::Value(v) => &v.location,
            StagingNode::File(f) => &f.location,
            StagingNode::Object(o) => o.location(),
        }
    }

    /// True for value and file leaves.
    pub fn is_leaf(&self) -> bool {
        !matches!(self, StagingNode::Object(_))
    }

    /// True if the node writes nothing: a deleted leaf or an object without
    /// children.
    pub fn is_empty(&self) -> bool {
        match self {
            StagingNode::Value(v) => v.value.is_none(),
            StagingNode::File(f) => f.data.is_none(),
            StagingNode::Object(o) => o.is_empty(),
        }
    }

    /// Value the node represents once written.
    pub fn to_wire(&self) -> Option<DatabaseValue> {
        self.view().to_wire()
    }

    /// Borrows the node.
    pub fn view(&self) -> StagingRef<'_> {
        match self {
            StagingNode::Value(v) => StagingRef::Value(v),
            StagingNode::File(f) => StagingRef::File(f),
            StagingNode::Object(o) => StagingRef::Object(o),
        }
    }
}

/// Borrowed view of a staging node, including the tree root.
#[derive(Debug, Clone, Copy)]
pub enum StagingRef<'a> {
    /// Raw value leaf.
    Value(&'a ValueNode),
    /// File leaf.
    File(&'a FileNode),
    /// Container of child nodes.
    Object(&'a ObjectNode),
}

impl<'a> StagingRef<'a> {
    /// Location of the node.
    pub fn location(&self) -> &'a Node {
        match self {
            StagingRef::Value(v) => &v.location,
            StagingRef::File(f) => &f.location,
            StagingRef::Object(o) => o.location(),
        }
    }

    /// True for value and file leaves.
    pub fn is_leaf(&self) -> bool {
        !matches!(self, StagingRef::Object(_))
    }

    /// Value the node represents once written.
    ///
    /// File leaves have none; their contents go through blob storage.
    pub fn to_wire(&self) -> Option<DatabaseValue> {
        match self {
            StagingRef::Value(v) => v.value.clone(),
            StagingRef::File(_) => None,
            StagingRef::Object(o) => o.to_wire(),
        }
    }
}

impl<'a> From<&'a StagingNode> for StagingRef<'a> {
    fn from(node: &'a StagingNode) -> Self {
        node.view()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_nodes() {
        let node = Node::root().child("a");
        assert!(StagingNode::value(node.clone(), None).is_empty());
        assert!(!StagingNode::value(node.clone(), Some(1i64.into())).is_empty());
        assert!(StagingNode::file(node.clone(), None, FileMetadata::new()).is_empty());
        assert!(StagingNode::Object(ObjectNode::new(node)).is_empty());
    }

    #[test]
    fn files_stay_out_of_the_value_wire() {
        let file = StagingNode::file(
            Node::root().child("profile/avatar"),
            Some(vec![1, 2]),
            FileMetadata::new(),
        );
        assert_eq!(file.to_wire(), None);
        assert!(file.is_leaf());
        assert!(!file.is_empty());

        let mut profile = ObjectNode::new(Node::root().child("profile"));
        profile
            .add_value_as_in_single_transaction(StagingNode::value(
                Node::root().child("profile/name"),
                Some("Alice".into()),
            ))
            .unwrap();
        profile.add_value_as_in_single_transaction(file).unwrap();
        let wire = profile.to_wire().unwrap();
        assert_eq!(wire.get_path("name"), Some(&"Alice".into()));
        assert_eq!(wire.get_path("avatar"), None);
        assert_eq!(profile.files().len(), 1);
    }
}
