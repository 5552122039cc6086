//! Sorted storage of collection elements.

use std::cmp::Ordering;
use std::slice::Iter;

/// A vector kept sorted in ascending or descending order.
///
/// Equal elements keep insertion order: a new element goes after the ones
/// comparing equal to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortedArray<T> {
    elements: Vec<T>,
    ascending: bool,
}

fn directed<T: Ord>(ascending: bool, a: &T, b: &T) -> Ordering {
    if ascending {
        a.cmp(b)
    } else {
        b.cmp(a)
    }
}

impl<T: Ord> SortedArray<T> {
    /// Creates an empty array.
    pub fn new(ascending: bool) -> Self {
        Self {
            elements: Vec::new(),
            ascending,
        }
    }

    /// Creates an array from elements in any order.
    pub fn from_unsorted(items: impl IntoIterator<Item = T>, ascending: bool) -> Self {
        let mut elements: Vec<T> = items.into_iter().collect();
        elements.sort_by(|a, b| directed(ascending, a, b));
        Self {
            elements,
            ascending,
        }
    }

    /// True if the smallest element comes first.
    pub fn is_ascending(&self) -> bool {
        self.ascending
    }

    /// Changes the direction, re-sorting in place if it differs.
    pub fn set_ascending(&mut self, ascending: bool) {
        if self.ascending != ascending {
            self.ascending = ascending;
            self.elements.reverse();
            let ascending = self.ascending;
            self.elements.sort_by(|a, b| directed(ascending, a, b));
        }
    }

    /// Index at which `item` would be inserted.
    pub fn insertion_index(&self, item: &T) -> usize {
        let ascending = self.ascending;
        self.elements
            .partition_point(|e| directed(ascending, e, item) != Ordering::Greater)
    }

    /// Inserts an element, returning its index.
    pub fn insert(&mut self, item: T) -> usize {
        let index = self.insertion_index(&item);
        self.elements.insert(index, item);
        index
    }

    /// Removes the element at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn remove_at(&mut self, index: usize) -> T {
        self.elements.remove(index)
    }

    /// Replaces the element at `index` and moves it to its sorted position.
    ///
    /// Returns the new index.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn reposition(&mut self, index: usize, item: T) -> usize {
        self.elements.remove(index);
        self.insert(item)
    }

    /// Index of the first element matching `predicate`.
    pub fn position(&self, predicate: impl FnMut(&T) -> bool) -> Option<usize> {
        self.elements.iter().position(predicate)
    }

    /// Removes every element.
    pub fn clear(&mut self) {
        self.elements.clear();
    }

    /// Replaces the contents with elements in any order.
    pub fn reset(&mut self, items: impl IntoIterator<Item = T>) {
        self.elements = items.into_iter().collect();
        let ascending = self.ascending;
        self.elements.sort_by(|a, b| directed(ascending, a, b));
    }
}

impl<T> SortedArray<T> {
    /// Number of elements.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// True if there are no elements.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Element at `index`.
    pub fn get(&self, index: usize) -> Option<&T> {
        self.elements.get(index)
    }

    /// First element in sort order.
    pub fn first(&self) -> Option<&T> {
        self.elements.first()
    }

    /// Last element in sort order.
    pub fn last(&self) -> Option<&T> {
        self.elements.last()
    }

    /// Iterates in sort order.
    pub fn iter(&self) -> Iter<'_, T> {
        self.elements.iter()
    }

    /// Elements in sort order.
    pub fn as_slice(&self) -> &[T] {
        &self.elements
    }
}

impl<'a, T> IntoIterator for &'a SortedArray<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.elements.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use realtree_testkit::sorted_distinct_strategy;

    #[test]
    fn insert_returns_index() {
        let mut array = SortedArray::from_unsorted([7, 1, 5, 3], true);
        assert_eq!(array.as_slice(), &[1, 3, 5, 7]);
        assert_eq!(array.insert(4), 2);
        assert_eq!(array.as_slice(), &[1, 3, 4, 5, 7]);
        assert_eq!(array.insert(0), 0);
        assert_eq!(array.insert(9), 6);
    }

    #[test]
    fn descending_order() {
        let mut array = SortedArray::from_unsorted([1, 3, 5, 7], false);
        assert_eq!(array.as_slice(), &[7, 5, 3, 1]);
        assert_eq!(array.insert(4), 2);
        assert_eq!(array.as_slice(), &[7, 5, 4, 3, 1]);
    }

    #[test]
    fn equal_elements_keep_insertion_order() {
        let mut array: SortedArray<(i32, &str)> = SortedArray::new(true);
        array.insert((1, "a"));
        assert_eq!(array.insert((1, "b")), 1);
        assert_eq!(array.insert((0, "c")), 0);
    }

    #[test]
    fn reposition_moves_element() {
        let mut array = SortedArray::from_unsorted([1, 3, 5, 7], true);
        assert_eq!(array.reposition(0, 6), 2);
        assert_eq!(array.as_slice(), &[3, 5, 6, 7]);
        assert_eq!(array.reposition(1, 4), 1);
        assert_eq!(array.as_slice(), &[3, 4, 6, 7]);
    }

    #[test]
    fn direction_change_resorts() {
        let mut array = SortedArray::from_unsorted([2, 8, 4], true);
        array.set_ascending(false);
        assert_eq!(array.as_slice(), &[8, 4, 2]);
        assert!(!array.is_ascending());
        array.set_ascending(true);
        assert_eq!(array.as_slice(), &[2, 4, 8]);
    }

    proptest! {
        #[test]
        fn inserted_element_lands_at_reported_index(
            values in sorted_distinct_strategy(),
            extra in -2000i64..2000,
            ascending in any::<bool>(),
        ) {
            let mut array = SortedArray::from_unsorted(values, ascending);
            let index = array.insert(extra);
            prop_assert_eq!(array.get(index), Some(&extra));
            let slice = array.as_slice();
            for pair in slice.windows(2) {
                if ascending {
                    prop_assert!(pair[0] <= pair[1]);
                } else {
                    prop_assert!(pair[0] >= pair[1]);
                }
            }
        }
    }
}
