//! Locations in the remote database tree.
//!
//! A [`Node`] is a key plus a link to its parent. Nodes are cheap to clone
//! (`Arc` inside) and compare by walking their key chains, so two nodes built
//! independently for the same path are equal.
//!
//! ```
//! use realtree_core::Node;
//!
//! let a = Node::root().child("users/alice/name");
//! let b = Node::root().child("users").child("alice").child("name");
//! assert_eq!(a, b);
//! assert_eq!(a.absolute_path(), "users/alice/name");
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

/// Reserved keys used by the realtime layout.
pub struct InternalKeys;

impl InternalKeys {
    /// Model version of a stored value.
    pub const MODEL_VERSION: &'static str = "__mv";
    /// Root key of the links hierarchy.
    pub const LINKS: &'static str = "__lnks";
    /// Key in the links branch storing external links of a value.
    pub const LINK_ITEMS: &'static str = "__l_itms";
    /// Key in the links branch storing collection element prototypes.
    pub const ITEMS: &'static str = "__itms";
    /// Priority of a collection element prototype.
    pub const INDEX: &'static str = "__i";
    /// User payload.
    pub const PAYLOAD: &'static str = "__pl";
    /// Key of an associated collection element.
    pub const KEY: &'static str = "__key";
    /// Value of an associated collection element.
    pub const VALUE: &'static str = "__val";
    /// Link key of a collection element prototype.
    pub const LINK: &'static str = "__lnk";
    /// Raw value of an enum or subclass.
    pub const RAW: &'static str = "__raw";
    /// Reference to a source location.
    pub const SOURCE: &'static str = "__src";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Root,
    Branch,
    Service,
    Regular,
}

struct NodeRepr {
    key: String,
    parent: OnceLock<Node>,
    kind: NodeKind,
}

impl Drop for NodeRepr {
    fn drop(&mut self) {
        // unlink uniquely owned parents one by one so long chains drop flat
        let mut next = self.parent.take();
        while let Some(node) = next {
            next = match Arc::try_unwrap(node.0) {
                Ok(mut repr) => repr.parent.take(),
                Err(_) => None,
            };
        }
    }
}

/// Reference to a location of the database tree.
#[derive(Clone)]
pub struct Node(Arc<NodeRepr>);

static ROOT: OnceLock<Node> = OnceLock::new();

impl Node {
    fn make(key: String, parent: Option<Node>, kind: NodeKind) -> Self {
        let cell = OnceLock::new();
        if let Some(parent) = parent {
            let _ = cell.set(parent);
        }
        Node(Arc::new(NodeRepr {
            key,
            parent: cell,
            kind,
        }))
    }

    /// Returns the database root.
    pub fn root() -> Node {
        ROOT.get_or_init(|| Node::make(String::new(), None, NodeKind::Root))
            .clone()
    }

    /// Creates a node with an optional parent.
    pub fn new(key: impl Into<String>, parent: Option<Node>) -> Node {
        Node::make(key.into(), parent, NodeKind::Regular)
    }

    /// Creates a standalone node that may later be attached with
    /// [`Node::move_to`].
    pub fn standalone(key: impl Into<String>) -> Node {
        Node::new(key, None)
    }

    /// Creates a branch node pinned directly under the root.
    ///
    /// The key may span several levels (`"a/b"`); branch nodes are anchors
    /// and can never be moved.
    pub fn branch(key: impl Into<String>) -> Node {
        Node::make(key.into(), Some(Node::root()), NodeKind::Branch)
    }

    /// Creates a node for internal database services, pinned under the root.
    pub fn service(key: impl Into<String>) -> Node {
        Node::make(key.into(), Some(Node::root()), NodeKind::Service)
    }

    /// Returns the node key.
    pub fn key(&self) -> &str {
        &self.0.key
    }

    /// Returns the parent node.
    pub fn parent(&self) -> Option<&Node> {
        self.0.parent.get()
    }

    /// True if this node is the database root.
    pub fn is_root(&self) -> bool {
        self.0.kind == NodeKind::Root
    }

    /// True if this node starts a path (root, branch or service node).
    pub fn is_anchor(&self) -> bool {
        self.0.kind != NodeKind::Regular
    }

    /// True if walking the parents ends at the database root.
    pub fn is_rooted(&self) -> bool {
        self.ancestors().last().map(|n| n.is_root()).unwrap_or(false)
    }

    /// Returns the most senior node. It is not necessarily the database root.
    pub fn top(&self) -> Option<Node> {
        self.ancestors().skip(1).last()
    }

    /// Returns the most senior node below the root, or `None` if not rooted.
    pub fn first(&self) -> Option<Node> {
        self.ancestors()
            .find(|n| n.parent().is_some_and(Node::is_root))
    }

    /// Returns the nearest anchor node, including this node.
    pub fn anchor(&self) -> Option<Node> {
        self.ancestors().find(Node::is_anchor)
    }

    /// Iterates this node and then its ancestors up to the top.
    pub fn ancestors(&self) -> Ancestors {
        Ancestors {
            current: Some(self.clone()),
        }
    }

    /// Number of levels below the root (or below the top for standalone chains).
    pub fn depth(&self) -> usize {
        self.ancestors().filter(|n| !n.is_root()).count()
    }

    /// Keys from the top down to this node, excluding the root.
    pub fn components(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .ancestors()
            .filter(|n| !n.is_root())
            .map(|n| n.key().to_string())
            .collect();
        keys.reverse();
        keys
    }

    /// Returns the path from the most senior node.
    pub fn absolute_path(&self) -> String {
        self.joined_until(Node::is_root)
    }

    /// Returns the path from the nearest anchor, or from the most senior node
    /// if there is no anchor.
    pub fn path(&self) -> String {
        self.joined_until(Node::is_anchor)
    }

    /// Joins the keys from below the first ancestor matching `stop` down to
    /// this node.
    fn joined_until(&self, stop: impl Fn(&Node) -> bool) -> String {
        let mut keys = vec![self.key()];
        let mut current = self;
        while let Some(parent) = current.parent() {
            if stop(parent) {
                break;
            }
            keys.push(parent.key());
            current = parent;
        }
        keys.reverse();
        keys.join("/")
    }

    /// Returns the path from `ancestor` to this node.
    ///
    /// # Panics
    ///
    /// Panics if `ancestor` is this node or is not an ancestor of it.
    pub fn path_from(&self, ancestor: &Node) -> String {
        assert!(ancestor != self, "path does not exist for the same nodes");
        let mut path = self.key().to_string();
        let mut current = self.clone();
        while let Some(next) = current.parent().cloned() {
            if &next == ancestor {
                return path;
            }
            path = format!("{}/{}", next.key(), path);
            current = next;
        }
        panic!("path cannot be taken from non parent node {ancestor}");
    }

    /// Returns the child of `ancestor` on the way down to this node.
    ///
    /// # Panics
    ///
    /// Panics if `ancestor` is this node or is not an ancestor of it.
    pub fn first_after(&self, ancestor: &Node) -> Node {
        assert!(ancestor != self, "cannot get node after the same node");
        let mut current = self.clone();
        while let Some(next) = current.parent().cloned() {
            if &next == ancestor {
                return current;
            }
            current = next;
        }
        panic!("{ancestor} is not an ancestor of {self}");
    }

    /// Returns nodes from just below `ancestor` down to this node.
    ///
    /// # Panics
    ///
    /// Panics if `ancestor` is this node or is not an ancestor of it.
    pub fn after(&self, ancestor: &Node) -> Vec<Node> {
        assert!(ancestor != self, "cannot get nodes after the same node");
        let mut result = vec![self.clone()];
        let mut current = self.clone();
        while let Some(next) = current.parent().cloned() {
            if &next == ancestor {
                result.reverse();
                return result;
            }
            result.push(next.clone());
            current = next;
        }
        panic!("{ancestor} is not an ancestor of {self}");
    }

    /// Returns the ancestor `level` levels up.
    ///
    /// # Panics
    ///
    /// Panics if `level` is zero.
    pub fn ancestor(&self, level: usize) -> Option<Node> {
        assert!(level > 0, "level must be more than 0");
        self.ancestors().nth(level)
    }

    /// Returns the path starting `level` levels up.
    ///
    /// # Panics
    ///
    /// Panics if the chain is shorter than `level`.
    pub fn path_from_level_up(&self, level: usize) -> String {
        let mut path = self.key().to_string();
        let mut current = self.clone();
        for _ in 0..level {
            let next = current
                .parent()
                .cloned()
                .unwrap_or_else(|| panic!("path cannot be taken from level {level}"));
            path = format!("{}/{}", next.key(), path);
            current = next;
        }
        path
    }

    /// True if `node` is a strict ancestor of this node.
    pub fn has_ancestor(&self, node: &Node) -> bool {
        self.ancestors().skip(1).any(|a| &a == node)
    }

    /// Returns the deepest node shared by both key chains, or `None` if the
    /// chains start at different places.
    pub fn nearest_common_prefix(&self, other: &Node) -> Option<Node> {
        if Arc::ptr_eq(&self.0, &other.0) {
            return Some(self.clone());
        }
        let mut this_nodes: Vec<Node> = self.ancestors().collect();
        let mut other_nodes: Vec<Node> = other.ancestors().collect();
        this_nodes.reverse();
        other_nodes.reverse();

        let mut prefix = None;
        for (this, other) in this_nodes.iter().zip(other_nodes.iter()) {
            if this.key() != other.key() || this.is_root() != other.is_root() {
                break;
            }
            prefix = Some(this.clone());
        }
        prefix
    }

    /// Returns a child node. `path` is split on `/`, empty segments are skipped.
    pub fn child(&self, path: &str) -> Node {
        path.split('/')
            .filter(|s| !s.is_empty())
            .fold(self.clone(), |parent, key| Node::new(key, Some(parent)))
    }

    /// Attaches a standalone node to `parent`.
    ///
    /// # Panics
    ///
    /// Panics if this node is an anchor, already has a parent, or `parent`
    /// is this node or one of its descendants.
    pub fn move_to(&self, parent: &Node) {
        assert!(
            !self.is_anchor(),
            "{} node cannot be moved",
            self.kind_name()
        );
        assert!(
            !Arc::ptr_eq(&self.0, &parent.0) && !parent.ancestors().any(|a| Arc::ptr_eq(&a.0, &self.0)),
            "parent cannot be equal to child"
        );
        if self.0.parent.set(parent.clone()).is_err() {
            panic!("node {self} already has a parent");
        }
    }

    /// Copies the full chain of this node (root excluded) under `node`.
    pub fn copy_to(&self, node: &Node) -> Node {
        self.components()
            .into_iter()
            .fold(node.clone(), |parent, key| Node::new(key, Some(parent)))
    }

    /// Returns the location of this node inside the links branch.
    ///
    /// # Panics
    ///
    /// Panics if the node is not rooted.
    pub fn links_location(&self, links: &Node) -> Node {
        assert!(self.is_rooted(), "links node of not rooted node: {self}");
        self.copy_to(links)
    }

    /// Location inside the links branch that stores external links to this node.
    pub fn link_items_location(&self, links: &Node) -> Node {
        self.child(InternalKeys::LINK_ITEMS).links_location(links)
    }

    /// Splits off the first `count` levels.
    ///
    /// Returns the last dropped node and the remaining chain, rebuilt on the
    /// root if this node was rooted.
    pub fn sliced_first(&self, count: usize) -> Option<(Node, Node)> {
        if count == 0 || self.parent().is_none() {
            return None;
        }
        let mut chain: Vec<Node> = self.ancestors().filter(|n| !n.is_root()).collect();
        chain.reverse();
        if count >= chain.len() {
            return None;
        }
        let dropped = chain[count - 1].clone();
        let base = if self.is_rooted() {
            Some(Node::root())
        } else {
            None
        };
        let mut sliced = base;
        for node in &chain[count..] {
            sliced = Some(Node::new(node.key(), sliced));
        }
        sliced.map(|s| (dropped, s))
    }

    /// True if a regular node in the chain has a key spanning several levels.
    pub fn has_multi_level_key(&self) -> bool {
        self.ancestors().any(|n| {
            n.0.kind == NodeKind::Regular && n.key().split('/').filter(|s| !s.is_empty()).count() > 1
        })
    }

    fn kind_name(&self) -> &'static str {
        match self.0.kind {
            NodeKind::Root => "root",
            NodeKind::Branch => "branch",
            NodeKind::Service => "service",
            NodeKind::Regular => "regular",
        }
    }
}

/// Iterator over a node and its ancestors.
pub struct Ancestors {
    current: Option<Node>,
}

impl Iterator for Ancestors {
    type Item = Node;

    fn next(&mut self) -> Option<Node> {
        let node = self.current.take()?;
        self.current = node.parent().cloned();
        Some(node)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.0, &other.0) {
            return true;
        }
        let mut left = Some(self.clone());
        let mut right = Some(other.clone());
        loop {
            match (left, right) {
                (Some(l), Some(r)) => {
                    if Arc::ptr_eq(&l.0, &r.0) {
                        return true;
                    }
                    if l.key() != r.key() || l.is_root() != r.is_root() {
                        return false;
                    }
                    left = l.parent().cloned();
                    right = r.parent().cloned();
                }
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for node in self.ancestors() {
            node.key().hash(state);
        }
    }
}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Node {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.components().cmp(&other.components()) {
            Ordering::Equal => self.is_rooted().cmp(&other.is_rooted()),
            ord => ord,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.kind {
            NodeKind::Root => write!(f, "root"),
            NodeKind::Branch => write!(f, "branch: {}", self.key()),
            NodeKind::Service => write!(f, "service: {}", self.key()),
            NodeKind::Regular => write!(f, "{}", self.absolute_path()),
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn independently_built_paths_are_equal() {
        let a = Node::root().child("users/alice/name");
        let b = Node::root().child("users").child("alice/name");
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn rooted_and_standalone_differ() {
        let rooted = Node::root().child("a");
        let standalone = Node::standalone("a");
        assert_ne!(rooted, standalone);
        assert!(rooted.is_rooted());
        assert!(!standalone.is_rooted());
    }

    #[test]
    fn paths() {
        let node = Node::root().child("a/b/c");
        assert_eq!(node.absolute_path(), "a/b/c");
        assert_eq!(node.path_from(&Node::root().child("a")), "b/c");
        assert_eq!(node.path_from(&Node::root()), "a/b/c");
        assert_eq!(node.depth(), 3);
        assert_eq!(node.components(), vec!["a", "b", "c"]);
        assert_eq!(node.path_from_level_up(1), "b/c");
    }

    #[test]
    #[should_panic(expected = "non parent node")]
    fn path_from_non_ancestor_panics() {
        let node = Node::root().child("a/b");
        node.path_from(&Node::root().child("x"));
    }

    #[test]
    fn after_ancestor() {
        let node = Node::root().child("a/b/c");
        let after = node.after(&Node::root().child("a"));
        let keys: Vec<&str> = after.iter().map(|n| n.key()).collect();
        assert_eq!(keys, vec!["b", "c"]);
        assert_eq!(node.first_after(&Node::root()).key(), "a");
    }

    #[test]
    fn ancestors_and_prefix() {
        let a = Node::root().child("users/alice/name");
        let b = Node::root().child("users/bob");
        assert!(a.has_ancestor(&Node::root().child("users")));
        assert!(!a.has_ancestor(&a));
        assert_eq!(
            a.nearest_common_prefix(&b),
            Some(Node::root().child("users"))
        );
        assert_eq!(
            a.nearest_common_prefix(&Node::standalone("users")),
            None
        );
        assert_eq!(a.ancestor(2), Some(Node::root().child("users")));
    }

    #[test]
    fn branch_node_is_anchor() {
        let links = Node::branch("__lnks");
        let item = links.child("users/alice");
        assert!(links.is_rooted());
        assert_eq!(item.path(), "users/alice");
        assert_eq!(item.absolute_path(), "__lnks/users/alice");
        assert_eq!(item.anchor(), Some(links));
    }

    #[test]
    #[should_panic(expected = "branch node cannot be moved")]
    fn branch_node_cannot_move() {
        Node::branch("__lnks").move_to(&Node::root().child("a"));
    }

    #[test]
    fn standalone_moves_once() {
        let item = Node::standalone("item");
        let field = item.child("name");
        item.move_to(&Node::root().child("list"));
        assert!(field.is_rooted());
        assert_eq!(field.absolute_path(), "list/item/name");
    }

    #[test]
    #[should_panic(expected = "already has a parent")]
    fn second_move_panics() {
        let item = Node::standalone("item");
        item.move_to(&Node::root().child("a"));
        item.move_to(&Node::root().child("b"));
    }

    #[test]
    fn long_chains_are_walked_without_recursion() {
        let mut node = Node::root();
        for _ in 0..200_000 {
            node = node.child("k");
        }
        assert_eq!(node.depth(), 200_000);
        assert_eq!(node.absolute_path().len(), 200_000 * 2 - 1);
        assert_eq!(node.path(), node.absolute_path());
        assert_eq!(node.first(), Some(Node::root().child("k")));
        assert_eq!(node.anchor(), Some(Node::root()));
        drop(node);
    }

    #[test]
    fn copy_and_slice() {
        let node = Node::root().child("users/alice");
        let links = Node::branch("__lnks");
        assert_eq!(
            node.links_location(&links).absolute_path(),
            "__lnks/users/alice"
        );

        let (dropped, sliced) = node.child("name").sliced_first(1).unwrap();
        assert_eq!(dropped.key(), "users");
        assert_eq!(sliced, Node::root().child("alice/name"));
    }

    #[test]
    fn multi_level_keys() {
        assert!(Node::new("a/b", Some(Node::root())).has_multi_level_key());
        assert!(!Node::root().child("a/b").has_multi_level_key());
        assert!(!Node::branch("a/b").child("c").has_multi_level_key());
    }

    #[test]
    fn ordering_follows_key_chain() {
        let mut nodes = vec![
            Node::root().child("b"),
            Node::root().child("a/z"),
            Node::root().child("a"),
        ];
        nodes.sort();
        let paths: Vec<String> = nodes.iter().map(|n| n.absolute_path()).collect();
        assert_eq!(paths, vec!["a", "a/z", "b"]);
    }
}
