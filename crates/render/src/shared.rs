use std::collections::HashMap;

/// Reference-counted objects keyed by structural hash.
///
/// Whoever takes a reference with [`retain`](Self::retain) or
/// [`insert`](Self::insert) gives it back with [`release`](Self::release);
/// the value is handed back for destruction when the last reference goes.
#[derive(Debug)]
pub struct SharedCache<T> {
    entries: HashMap<u64, Shared<T>>,
}

#[derive(Debug)]
struct Shared<T> {
    value: T,
    refs: u32,
}

impl<T> Default for SharedCache<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T: Clone> SharedCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take another reference to an existing value.
    pub fn retain(&mut self, hash: u64) -> Option<T> {
        let entry = self.entries.get_mut(&hash)?;
        entry.refs += 1;
        Some(entry.value.clone())
    }

    /// Store a freshly created value with one reference. Callers insert
    /// only after [`retain`](Self::retain) missed.
    pub fn insert(&mut self, hash: u64, value: T) {
        let previous = self.entries.insert(hash, Shared { value, refs: 1 });
        debug_assert!(previous.is_none(), "shared value {hash} inserted twice");
    }

    /// Retain the value for `hash`, creating it on a miss.
    pub fn acquire(&mut self, hash: u64, create: impl FnOnce() -> T) -> T {
        if let Some(value) = self.retain(hash) {
            return value;
        }
        let value = create();
        self.insert(hash, value.clone());
        value
    }

    /// Drop one reference. Returns the value when that was the last one.
    pub fn release(&mut self, hash: u64) -> Option<T> {
        let entry = self.entries.get_mut(&hash)?;
        entry.refs -= 1;
        if entry.refs > 0 {
            return None;
        }
        self.entries.remove(&hash).map(|e| e.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_creates_once() {
        let mut cache = SharedCache::new();
        let mut created = 0;
        for _ in 0..3 {
            let value = cache.acquire(7, || {
                created += 1;
                42u32
            });
            assert_eq!(value, 42);
        }
        assert_eq!(created, 1);
        assert_eq!(cache.release(7), None);
        assert_eq!(cache.release(7), None);
        assert_eq!(cache.release(7), Some(42));
    }

    #[test]
    fn release_returns_value_on_last_reference() {
        let mut cache = SharedCache::new();
        cache.acquire(1, || "layout");
        cache.acquire(1, || "unused");
        assert_eq!(cache.release(1), None);
        assert_eq!(cache.release(1), Some("layout"));
        assert!(cache.is_empty());
        assert_eq!(cache.release(1), None);
    }

    #[test]
    fn inserted_value_is_shared_by_later_retains() {
        let mut cache = SharedCache::new();
        assert_eq!(cache.retain(5), None);
        cache.insert(5, 1u32);
        assert_eq!(cache.retain(5), Some(1));
        assert_eq!(cache.release(5), None);
        assert_eq!(cache.release(5), Some(1));
        assert_eq!(cache.len(), 0);
    }
}
