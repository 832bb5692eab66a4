use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

/// Fixed-capacity insertion-ordered set. Inserting into a full set evicts the oldest entry.
#[derive(Debug)]
pub struct BoundedSet<T> {
    capacity: usize,
    order: VecDeque<T>,
    members: HashSet<T>,
}

impl<T: Eq + Hash + Clone> BoundedSet<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
        }
    }

    #[cfg(test)]
    pub fn contains(&self, value: &T) -> bool {
        self.members.contains(value)
    }

    /// Returns `false` if the value was already present (order is not refreshed).
    pub fn insert(&mut self, value: T) -> bool {
        if self.members.contains(&value) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.order.push_back(value.clone());
        self.members.insert(value);
        true
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_when_full() {
        let mut set = BoundedSet::new(3);
        for n in 1..=3 {
            assert!(set.insert(n));
        }
        assert!(!set.insert(2));
        assert!(set.insert(4));
        assert_eq!(set.len(), 3);
        assert!(!set.contains(&1));
        assert!(set.contains(&2) && set.contains(&3) && set.contains(&4));

        // 1 was evicted, so it is new again
        assert!(set.insert(1));
        assert!(!set.contains(&2));
    }

    #[test]
    fn never_exceeds_capacity() {
        let mut set = BoundedSet::new(100);
        for n in 0..10_000u64 {
            set.insert(format!("0xtx:{n}"));
        }
        assert_eq!(set.len(), 100);
        assert!(set.contains(&"0xtx:9999".to_string()));
        assert!(!set.contains(&"0xtx:9899".to_string()));
    }
}
