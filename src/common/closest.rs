use std::vec::IntoIter;

use crate::common::Hash;

/// Anything placed in the XOR key space.
pub trait Hashed {
    fn hash(&self) -> Hash;
}

impl<T: Hashed> Hashed for &T {
    fn hash(&self) -> Hash {
        T::hash(*self)
    }
}

#[derive(Debug, Clone)]
/// Bounded list of the items closest to a target, kept sorted by distance.
pub struct Closest<T> {
    target: Hash,
    capacity: usize,
    max_distance: Option<u32>,
    items: Vec<T>,
}

impl<T: Hashed> Closest<T> {
    pub fn new(target: Hash, capacity: usize) -> Self {
        Self {
            target,
            capacity,
            max_distance: None,
            items: Vec::with_capacity(capacity.min(64)),
        }
    }

    /// Ignore items farther than `max_distance` from the target.
    pub fn with_max_distance(mut self, max_distance: Option<u32>) -> Self {
        self.max_distance = max_distance;
        self
    }

    // === Getters ===

    pub fn target(&self) -> Hash {
        self.target
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    /// Distance of the farthest kept item.
    pub fn farthest_distance(&self) -> Option<u32> {
        self.items
            .last()
            .map(|item| item.hash().distance(&self.target))
    }

    // === Public Methods ===

    /// Insert keeping the list sorted, returns false if the item didn't make the cut.
    pub fn add(&mut self, item: T) -> bool {
        let distance = item.hash().distance(&self.target);

        if self.max_distance.is_some_and(|max| distance > max) {
            return false;
        }

        let position = self
            .items
            .partition_point(|item| item.hash().distance(&self.target) <= distance);

        if position >= self.capacity {
            return false;
        }

        self.items.insert(position, item);
        self.items.truncate(self.capacity);

        true
    }
}

impl<T> IntoIterator for Closest<T> {
    type Item = T;
    type IntoIter = IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}
