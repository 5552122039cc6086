use super::{FileNode, MergeStrategy, ObjectNode, StagingNode};
use crate::error::{CoreError, CoreResult};
use crate::node::Node;
use tracing::{debug, error};

/// Chooses between the node already staged and the incoming one.
pub type ConflictResolver<'a> = dyn FnMut(&StagingNode, &StagingNode) -> MergeStrategy + 'a;

/// Called with the parent location and the node appended under it.
pub type AppendObserver<'a> = dyn FnMut(&Node, &StagingNode) + 'a;

fn conflict(location: &Node, message: &str) -> CoreError {
    error!(node = %location, message, "staging tree structural conflict");
    CoreError::structural(location.absolute_path(), message)
}

impl ObjectNode {
    /// Merges `other` into this tree.
    ///
    /// Objects at the same location merge child by child. Where both trees
    /// hold a node at the same location and one of them is a leaf, `resolver`
    /// decides which one stays; leaves never merge deeper. Nodes that only
    /// exist in `other` are appended and reported to `on_appended`.
    ///
    /// # Errors
    ///
    /// * [`CoreError::RequiresReplace`] if `other` is a leaf at this location.
    /// * [`CoreError::UnrelatedLocation`] if `other` is not at or below this
    ///   location.
    /// * [`CoreError::StructuralConflict`] if a leaf of this tree sits above
    ///   the location of `other`.
    pub fn merge(
        &mut self,
        other: StagingNode,
        resolver: &mut ConflictResolver<'_>,
        on_appended: &mut AppendObserver<'_>,
    ) -> CoreResult<()> {
        let target = other.location().clone();
        if target == self.location {
            return match other {
                StagingNode::Object(o) => self.merge_same_location(o, resolver, on_appended),
                _ => Err(CoreError::requires_replace(target.absolute_path())),
            };
        }
        if !target.has_ancestor(&self.location) {
            error!(node = %target, location = %self.location, "merge into unrelated location");
            return Err(CoreError::unrelated_location(
                self.location.absolute_path(),
                target.absolute_path(),
            ));
        }

        let path = target.after(&self.location);
        let mut current = self;
        for next in path {
            match current.position(&next) {
                Some(index) if next == target => {
                    return current.merge_child(index, other, resolver, on_appended);
                }
                Some(index) => match &mut current.children[index] {
                    StagingNode::Object(o) => current = o,
                    _ => {
                        return Err(conflict(
                            &next,
                            "a value is staged above the merged location",
                        ))
                    }
                },
                None if next == target => {
                    on_appended(&current.location, &other);
                    current.children.push(other);
                    return Ok(());
                }
                None => {
                    current.children.push(StagingNode::Object(ObjectNode::new(next)));
                    let index = current.children.len() - 1;
                    on_appended(&current.location, &current.children[index]);
                    current = match &mut current.children[index] {
                        StagingNode::Object(o) => o,
                        _ => return Err(conflict(&target, "intermediate node is not an object")),
                    };
                }
            }
        }
        Ok(())
    }

    /// Merges `other`, resolving every conflict with `strategy`.
    pub fn merge_with_strategy(&mut self, other: StagingNode, strategy: MergeStrategy) -> CoreResult<()> {
        self.merge(other, &mut |_, _| strategy, &mut |_, _| {})
    }

    fn merge_same_location(
        &mut self,
        other: ObjectNode,
        resolver: &mut ConflictResolver<'_>,
        on_appended: &mut AppendObserver<'_>,
    ) -> CoreResult<()> {
        for child in other.children {
            match self.position(child.location()) {
                Some(index) => self.merge_child(index, child, resolver, on_appended)?,
                None => {
                    on_appended(&self.location, &child);
                    self.children.push(child);
                }
            }
        }
        Ok(())
    }

    fn merge_child(
        &mut self,
        index: usize,
        update: StagingNode,
        resolver: &mut ConflictResolver<'_>,
        on_appended: &mut AppendObserver<'_>,
    ) -> CoreResult<()> {
        if let StagingNode::Object(current) = &mut self.children[index] {
            if let StagingNode::Object(update) = update {
                return current.merge_same_location(update, resolver, on_appended);
            }
        }
        let resolved = match resolver(&self.children[index], &update) {
            MergeStrategy::Old => return Ok(()),
            MergeStrategy::New => update,
        };
        if resolved.is_empty() {
            self.children.remove(index);
        } else {
            self.children[index] = resolved;
        }
        Ok(())
    }

    /// Inserts a leaf written by the transaction that owns this tree.
    ///
    /// A second write to the same location overwrites the first.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StructuralConflict`] when the leaf would be
    /// written above or below an earlier write, when a value would replace a
    /// file (or the reverse), or when `leaf` is an object node.
    pub fn add_value_as_in_single_transaction(&mut self, leaf: StagingNode) -> CoreResult<()> {
        if !leaf.is_leaf() {
            return Err(conflict(leaf.location(), "object node cannot be added to transaction"));
        }
        let target = leaf.location().clone();
        if !target.has_ancestor(&self.location) {
            return Err(CoreError::unrelated_location(
                self.location.absolute_path(),
                target.absolute_path(),
            ));
        }

        let path = target.after(&self.location);
        let mut current = self;
        for next in path {
            let is_target = next == target;
            match current.position(&next) {
                Some(index) if is_target => {
                    return match (&mut current.children[index], leaf) {
                        (StagingNode::Object(_), _) => Err(conflict(
                            &target,
                            "tries to insert value higher than earlier written values",
                        )),
                        (StagingNode::Value(old), StagingNode::Value(new)) => {
                            debug!(node = %target, value = ?new.value, "replaced staged value");
                            old.value = new.value;
                            Ok(())
                        }
                        (StagingNode::File(old), StagingNode::File(new)) => {
                            debug!(node = %target, "replaced staged file");
                            *old = new;
                            Ok(())
                        }
                        _ => Err(conflict(
                            &target,
                            "tries to insert database value to storage node or conversely",
                        )),
                    };
                }
                Some(index) => match &mut current.children[index] {
                    StagingNode::Object(o) => current = o,
                    _ => {
                        return Err(conflict(
                            &target,
                            "tries to insert value lower than earlier written single value",
                        ))
                    }
                },
                None if is_target => {
                    current.children.push(leaf);
                    return Ok(());
                }
                None => {
                    current.children.push(StagingNode::Object(ObjectNode::new(next)));
                    let index = current.children.len() - 1;
                    current = match &mut current.children[index] {
                        StagingNode::Object(o) => o,
                        _ => return Err(conflict(&target, "intermediate node is not an object")),
                    };
                }
            }
        }
        Ok(())
    }

    /// Replaces the node staged at the location of `node`.
    ///
    /// Empty nodes remove the location.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StructuralConflict`] if the parent of `node` is
    /// not an object of this tree or nothing is staged at the location.
    pub fn replace_node(&mut self, node: StagingNode) -> CoreResult<()> {
        let location = node.location().clone();
        let parent = location
            .parent()
            .cloned()
            .ok_or_else(|| conflict(&location, "replaced node has no parent"))?;
        let parent = self
            .object_mut(&parent)
            .ok_or_else(|| conflict(&location, "parent of replaced node is not staged"))?;
        let index = parent
            .position(&location)
            .ok_or_else(|| conflict(&location, "replaced node is not staged"))?;
        if node.is_empty() {
            parent.children.remove(index);
        } else {
            parent.children[index] = node;
        }
        Ok(())
    }

    fn object_mut(&mut self, node: &Node) -> Option<&mut ObjectNode> {
        if node == &self.location {
            return Some(self);
        }
        if !node.has_ancestor(&self.location) {
            return None;
        }
        let path = node.after(&self.location);
        let mut current = self;
        for next in path {
            let index = current.position(&next)?;
            current = match &mut current.children[index] {
                StagingNode::Object(o) => o,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Writes a file under the nearest staged object, creating intermediate
    /// objects and turning leaves on the way into objects.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnrelatedLocation`] if the file is not below this
    /// location.
    pub fn graft_file(&mut self, file: FileNode) -> CoreResult<()> {
        let target = file.location.clone();
        if !target.has_ancestor(&self.location) {
            return Err(CoreError::unrelated_location(
                self.location.absolute_path(),
                target.absolute_path(),
            ));
        }

        let path = target.after(&self.location);
        let mut current = self;
        for next in path {
            let index = match current.position(&next) {
                Some(index) if next == target => {
                    if file.data.is_none() {
                        current.children.remove(index);
                    } else {
                        current.children[index] = StagingNode::File(file);
                    }
                    return Ok(());
                }
                None if next == target => {
                    if file.data.is_some() {
                        current.children.push(StagingNode::File(file));
                    }
                    return Ok(());
                }
                Some(index) => {
                    if current.children[index].is_leaf() {
                        current.children[index] = StagingNode::Object(ObjectNode::new(next));
                    }
                    index
                }
                None => {
                    current.children.push(StagingNode::Object(ObjectNode::new(next)));
                    current.children.len() - 1
                }
            };
            current = match &mut current.children[index] {
                StagingNode::Object(o) => o,
                _ => return Err(conflict(&target, "intermediate node is not an object")),
            };
        }
        Ok(())
    }
}
