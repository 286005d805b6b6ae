//! Worker registry: concurrent map plus an ordered key list.
//!
//! Producers read it for population sizing and (in the dedicated-queue
//! pool) for deterministic worker indexing; it is written only when a
//! worker is born or exits.

use std::collections::HashMap;
use std::sync::RwLock;

pub(crate) struct WorkerRegistry<H> {
    inner: RwLock<Inner<H>>,
}

struct Inner<H> {
    map: HashMap<String, H>,
    /// Registration order; kept in sync with `map` for indexed selection.
    order: Vec<String>,
}

impl<H> WorkerRegistry<H> {
    pub(crate) fn new() -> Self {
        WorkerRegistry {
            inner: RwLock::new(Inner {
                map: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    pub(crate) fn insert(&self, name: String, handle: H) {
        let mut inner = self.inner.write().unwrap();
        inner.order.push(name.clone());
        inner.map.insert(name, handle);
    }

    /// Inserts `name` only while the population stays below `cap`. The
    /// check and the insertion are one atomic step, so concurrent births
    /// cannot overshoot the cap.
    pub(crate) fn insert_capped(&self, name: String, handle: H, cap: usize) -> bool {
        let mut inner = self.inner.write().unwrap();
        if inner.map.len() >= cap {
            return false;
        }
        inner.order.push(name.clone());
        inner.map.insert(name, handle);
        true
    }

    pub(crate) fn remove(&self, name: &str) -> Option<H> {
        let mut inner = self.inner.write().unwrap();
        inner.order.retain(|n| n != name);
        inner.map.remove(name)
    }

    /// Removes `name` only while the population stays above `floor`.
    /// The check and the removal are one atomic step, so two workers
    /// cannot both retire past the floor.
    pub(crate) fn try_retire(&self, name: &str, floor: usize) -> Option<H> {
        let mut inner = self.inner.write().unwrap();
        if inner.map.len() <= floor {
            return None;
        }
        inner.order.retain(|n| n != name);
        inner.map.remove(name)
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.read().unwrap().map.len()
    }

    /// The name at `index` in registration order, wrapped modulo the live
    /// count. `None` when the registry is empty.
    pub(crate) fn nth_name(&self, index: usize) -> Option<String> {
        let inner = self.inner.read().unwrap();
        if inner.order.is_empty() {
            return None;
        }
        Some(inner.order[index % inner.order.len()].clone())
    }

    /// Runs `f` over every live (name, handle) pair under the read lock.
    pub(crate) fn scan<R>(&self, f: impl FnOnce(&HashMap<String, H>) -> R) -> R {
        f(&self.inner.read().unwrap().map)
    }

    /// Looks up one handle by name.
    pub(crate) fn with_handle<R>(&self, name: &str, f: impl FnOnce(&H) -> R) -> Option<R> {
        self.inner.read().unwrap().map.get(name).map(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_remove_len() {
        let registry = WorkerRegistry::new();
        registry.insert("a".to_owned(), 1);
        registry.insert("b".to_owned(), 2);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.remove("a"), Some(1));
        assert_eq!(registry.remove("a"), None);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn capped_insert_respects_the_ceiling() {
        let registry = WorkerRegistry::new();
        assert!(registry.insert_capped("a".to_owned(), (), 2));
        assert!(registry.insert_capped("b".to_owned(), (), 2));
        assert!(!registry.insert_capped("c".to_owned(), (), 2));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn retire_respects_the_floor() {
        let registry = WorkerRegistry::new();
        registry.insert("a".to_owned(), ());
        registry.insert("b".to_owned(), ());
        assert!(registry.try_retire("a", 1).is_some());
        assert!(registry.try_retire("b", 1).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn nth_name_wraps_in_registration_order() {
        let registry = WorkerRegistry::new();
        registry.insert("a".to_owned(), ());
        registry.insert("b".to_owned(), ());
        registry.insert("c".to_owned(), ());
        assert_eq!(registry.nth_name(0).unwrap(), "a");
        assert_eq!(registry.nth_name(4).unwrap(), "b");
        let empty: WorkerRegistry<()> = WorkerRegistry::new();
        assert!(empty.nth_name(7).is_none());
    }
}
