//! Slot registries keyed by generational [`Handle`]s.
//!
//! - [`Registry`]: sparse slot table with a LIFO free list.
//! - [`DenseRegistry`]: values kept contiguous (swap-remove) behind an
//!   indirection table, for registries that are iterated more than looked up.
//! - [`SecondaryMap`]: side table that attaches extra data to handles issued
//!   by some other registry.

use crate::handle::Handle;
use std::marker::PhantomData;

const VACANT: u32 = u32::MAX;

#[derive(Debug, Clone)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Sparse slot table giving O(1) insert, lookup and removal.
#[derive(Debug, Clone)]
pub struct Registry<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Store a value and return its handle. Reuses the most recently freed
    /// slot before growing the backing storage.
    pub fn insert(&mut self, value: T) -> Handle<T> {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return Handle::new(index, slot.generation);
        }
        if self.slots.len() == self.slots.capacity() {
            // Double explicitly so growth does not depend on Vec's policy.
            self.slots.reserve(self.slots.len().max(4));
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        Handle::new(index, 0)
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        self.slots
            .get(handle.index() as usize)
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index() as usize)
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.value.as_mut())
    }

    /// Remove a value. The slot's generation is bumped so `handle` and every
    /// copy of it stop resolving.
    pub fn remove(&mut self, handle: Handle<T>) -> Option<T> {
        let slot = self.slots.get_mut(handle.index() as usize)?;
        if slot.generation != handle.generation() {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index());
        self.len -= 1;
        Some(value)
    }

    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.get(handle).is_some()
    }

    /// Current occupant of a slot, regardless of generation.
    ///
    /// For owners that hand out bare slot indices (device object ids) and
    /// never let them escape to untrusted code.
    pub fn get_at(&self, index: u32) -> Option<&T> {
        self.slots
            .get(index as usize)
            .and_then(|slot| slot.value.as_ref())
    }

    /// Remove the current occupant of a slot, regardless of generation.
    pub fn remove_at(&mut self, index: u32) -> Option<T> {
        let generation = self.slots.get(index as usize)?.generation;
        self.remove(Handle::new(index, generation))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of slots ever created (occupied or free).
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Slots available before the backing storage grows.
    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.value
                .as_ref()
                .map(|v| (Handle::new(i as u32, slot.generation), v))
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle<T>, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(i, slot)| {
            let generation = slot.generation;
            slot.value
                .as_mut()
                .map(|v| (Handle::new(i as u32, generation), v))
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct Sparse {
    generation: u32,
    dense: u32,
}

/// Registry that keeps values densely packed.
///
/// Removal swaps the last value into the hole and patches the indirection
/// table, so iteration is a plain slice walk. Lookups pay one extra hop.
#[derive(Debug, Clone)]
pub struct DenseRegistry<T> {
    values: Vec<T>,
    owners: Vec<u32>,
    sparse: Vec<Sparse>,
    free: Vec<u32>,
}

impl<T> Default for DenseRegistry<T> {
    fn default() -> Self {
        Self {
            values: Vec::new(),
            owners: Vec::new(),
            sparse: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<T> DenseRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, value: T) -> Handle<T> {
        let dense = self.values.len() as u32;
        let index = match self.free.pop() {
            Some(index) => {
                self.sparse[index as usize].dense = dense;
                index
            }
            None => {
                self.sparse.push(Sparse {
                    generation: 0,
                    dense,
                });
                (self.sparse.len() - 1) as u32
            }
        };
        self.values.push(value);
        self.owners.push(index);
        Handle::new(index, self.sparse[index as usize].generation)
    }

    fn dense_index(&self, handle: Handle<T>) -> Option<usize> {
        self.sparse
            .get(handle.index() as usize)
            .filter(|s| s.generation == handle.generation() && s.dense != VACANT)
            .map(|s| s.dense as usize)
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        self.dense_index(handle).map(|i| &self.values[i])
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        self.dense_index(handle).map(|i| &mut self.values[i])
    }

    pub fn remove(&mut self, handle: Handle<T>) -> Option<T> {
        let dense = self.dense_index(handle)?;
        let value = self.values.swap_remove(dense);
        self.owners.swap_remove(dense);
        if let Some(&moved) = self.owners.get(dense) {
            self.sparse[moved as usize].dense = dense as u32;
        }
        let slot = &mut self.sparse[handle.index() as usize];
        slot.dense = VACANT;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index());
        Some(value)
    }

    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.dense_index(handle).is_some()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.owners.iter().zip(&self.values).map(|(&owner, value)| {
            (
                Handle::new(owner, self.sparse[owner as usize].generation),
                value,
            )
        })
    }
}

/// Side table keyed by handles issued elsewhere.
///
/// Stores the generation alongside each value; a lookup with a handle of a
/// different generation misses.
#[derive(Debug, Clone)]
pub struct SecondaryMap<K, V> {
    slots: Vec<Option<(u32, V)>>,
    len: usize,
    _marker: PhantomData<fn() -> K>,
}

impl<K, V> Default for SecondaryMap<K, V> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            len: 0,
            _marker: PhantomData,
        }
    }
}

impl<K, V> SecondaryMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `value` to `handle`. Returns whatever occupied the slot before,
    /// including a value left behind by an older generation.
    pub fn insert(&mut self, handle: Handle<K>, value: V) -> Option<V> {
        let index = handle.index() as usize;
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, || None);
        }
        let previous = self.slots[index].replace((handle.generation(), value));
        if previous.is_none() {
            self.len += 1;
        }
        previous.map(|(_, v)| v)
    }

    pub fn get(&self, handle: Handle<K>) -> Option<&V> {
        match self.slots.get(handle.index() as usize) {
            Some(Some((generation, value))) if *generation == handle.generation() => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: Handle<K>) -> Option<&mut V> {
        match self.slots.get_mut(handle.index() as usize) {
            Some(Some((generation, value))) if *generation == handle.generation() => Some(value),
            _ => None,
        }
    }

    pub fn remove(&mut self, handle: Handle<K>) -> Option<V> {
        let index = handle.index() as usize;
        let live = matches!(
            self.slots.get(index),
            Some(Some((generation, _))) if *generation == handle.generation()
        );
        if !live {
            return None;
        }
        self.len -= 1;
        self.slots[index].take().map(|(_, v)| v)
    }

    pub fn contains(&self, handle: Handle<K>) -> bool {
        self.get(handle).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.slots.iter().filter_map(|slot| slot.as_ref().map(|(_, v)| v))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle<K>, &V)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.as_ref()
                .map(|(generation, v)| (Handle::new(i as u32, *generation), v))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let mut reg = Registry::new();
        let a = reg.insert("a");
        let b = reg.insert("b");
        assert_eq!(reg.get(a), Some(&"a"));
        assert_eq!(reg.get(b), Some(&"b"));
        assert_eq!(reg.len(), 2);

        assert_eq!(reg.remove(a), Some("a"));
        assert_eq!(reg.get(a), None);
        assert_eq!(reg.remove(a), None);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn freed_slot_is_reused_lifo_with_new_generation() {
        let mut reg = Registry::new();
        let a = reg.insert(1);
        let b = reg.insert(2);
        reg.remove(a);
        reg.remove(b);

        // Most recently freed slot comes back first.
        let c = reg.insert(3);
        assert_eq!(c.index(), b.index());
        assert_ne!(c, b);
        assert_eq!(reg.get(b), None);
        assert_eq!(reg.get(c), Some(&3));

        let d = reg.insert(4);
        assert_eq!(d.index(), a.index());
        assert_eq!(reg.slot_count(), 2);
    }

    #[test]
    fn storage_grows_geometrically() {
        let mut reg = Registry::with_capacity(1);
        for i in 0..100 {
            reg.insert(i);
        }
        assert_eq!(reg.len(), 100);
        assert_eq!(reg.iter().count(), 100);
        assert!(reg.slots.capacity() >= 100);
    }

    #[test]
    fn index_access_ignores_generation() {
        let mut reg = Registry::new();
        let a = reg.insert("first");
        reg.remove(a);
        let b = reg.insert("second");
        assert_eq!(reg.get_at(a.index()), Some(&"second"));
        assert_eq!(reg.remove_at(b.index()), Some("second"));
        assert!(reg.is_empty());
    }

    #[test]
    fn dense_registry_swap_removes() {
        let mut reg = DenseRegistry::new();
        let a = reg.insert('a');
        let b = reg.insert('b');
        let c = reg.insert('c');

        assert_eq!(reg.remove(a), Some('a'));
        // 'c' was swapped into the hole and must still resolve.
        assert_eq!(reg.get(c), Some(&'c'));
        assert_eq!(reg.get(b), Some(&'b'));
        assert_eq!(reg.as_slice(), &['c', 'b']);
        assert_eq!(reg.get(a), None);

        let d = reg.insert('d');
        assert_eq!(d.index(), a.index());
        assert_ne!(d, a);
        let handles: Vec<_> = reg.iter().map(|(h, _)| h).collect();
        assert!(handles.contains(&b) && handles.contains(&c) && handles.contains(&d));
    }

    #[test]
    fn dense_registry_remove_last() {
        let mut reg = DenseRegistry::new();
        let a = reg.insert(1u32);
        let b = reg.insert(2u32);
        assert_eq!(reg.remove(b), Some(2));
        assert_eq!(reg.get(a), Some(&1));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn secondary_map_tracks_generations() {
        let mut reg = Registry::new();
        let mut side: SecondaryMap<&str, u64> = SecondaryMap::new();
        let a = reg.insert("a");
        assert_eq!(side.insert(a, 10), None);
        assert_eq!(side.get(a), Some(&10));

        reg.remove(a);
        let b = reg.insert("b");
        assert_eq!(b.index(), a.index());
        assert_eq!(side.get(b), None);

        // Inserting for the new generation hands back the stale value.
        assert_eq!(side.insert(b, 20), Some(10));
        assert_eq!(side.len(), 1);
        assert_eq!(side.remove(a), None);
        assert_eq!(side.remove(b), Some(20));
        assert!(side.is_empty());
    }
}
