//! Property-based test generators using proptest.
//!
//! Provides strategies for generating keys, paths and values that respect
//! the default key alphabet.

use proptest::prelude::*;
use realtree_core::{DatabaseValue, Node};

/// Strategy for generating valid single-level keys.
pub fn key_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_-]{0,7}").expect("Invalid regex")
}

/// Strategy for generating slash-separated paths of one to five keys.
pub fn path_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec(key_strategy(), 1..5).prop_map(|keys| keys.join("/"))
}

/// Strategy for generating rooted nodes.
pub fn node_strategy() -> impl Strategy<Value = Node> {
    path_strategy().prop_map(|path| Node::root().child(&path))
}

/// Strategy for generating scalar database values.
pub fn scalar_value_strategy() -> impl Strategy<Value = DatabaseValue> {
    prop_oneof![
        any::<bool>().prop_map(DatabaseValue::Bool),
        any::<i64>().prop_map(DatabaseValue::Int),
        "[a-zA-Z0-9 ]{0,16}".prop_map(DatabaseValue::Text),
        prop::collection::vec(any::<u8>(), 0..16).prop_map(DatabaseValue::Bytes),
    ]
}

/// Strategy for generating writes to distinct top-level keys.
///
/// Keys are unique so the writes never overlap.
pub fn distinct_writes_strategy() -> impl Strategy<Value = Vec<(String, DatabaseValue)>> {
    prop::collection::btree_map(key_strategy(), scalar_value_strategy(), 1..8)
        .prop_map(|writes| writes.into_iter().collect())
}

/// Strategy for generating sorted, distinct integers.
pub fn sorted_distinct_strategy() -> impl Strategy<Value = Vec<i64>> {
    prop::collection::btree_set(-1000i64..1000, 0..32).prop_map(|set| set.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn generated_nodes_are_rooted(node in node_strategy()) {
            prop_assert!(node.is_rooted());
            prop_assert!(node.depth() >= 1);
        }

        #[test]
        fn generated_writes_are_distinct(writes in distinct_writes_strategy()) {
            let mut keys: Vec<_> = writes.iter().map(|(k, _)| k.clone()).collect();
            keys.dedup();
            prop_assert_eq!(keys.len(), writes.len());
        }
    }
}
