//! Ordered listener registry.
//!
//! Listener counts are tiny (a handful per hook), so entries live in a `Vec`
//! and removal is a linear scan. Iteration follows registration order.

use std::fmt;

/// Handle returned on registration, used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

pub struct Registry<T> {
    next_id: u64,
    entries: Vec<(ListenerId, T)>,
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }

    pub fn add(&mut self, listener: T) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, listener));
        id
    }

    /// Returns `false` if the id was never registered or already removed.
    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|(_, listener)| listener)
    }
}

impl<T: Clone> Registry<T> {
    /// Copy the current listeners out so they can be invoked without holding
    /// whatever lock guards the registry.
    pub fn snapshot(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iteration_follows_registration_order() {
        let mut registry = Registry::new();
        registry.add("a");
        let b = registry.add("b");
        registry.add("c");

        assert!(registry.remove(b));
        assert!(!registry.remove(b));
        assert_eq!(registry.snapshot(), vec!["a", "c"]);

        registry.add("d");
        assert_eq!(registry.snapshot(), vec!["a", "c", "d"]);
    }

    #[test]
    fn test_ids_are_not_reused_after_removal() {
        let mut registry = Registry::new();
        let first = registry.add(1);
        registry.remove(first);
        let second = registry.add(2);
        assert_ne!(first, second);
        assert_eq!(registry.len(), 1);
    }
}
