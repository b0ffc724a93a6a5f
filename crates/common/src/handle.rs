use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Generational reference into a [`Registry`](crate::Registry).
///
/// The type parameter only tags which registry the handle belongs to; it
/// places no bounds on `T`, so handles stay `Copy` for any payload.
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// Slot index inside the issuing registry.
    pub fn index(self) -> u32 {
        self.index
    }

    /// Generation of the slot at the time the handle was issued.
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.index, self.generation).cmp(&(other.index, other.generation))
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NotCopy;

    #[test]
    fn handles_are_copy_for_any_payload() {
        let a: Handle<NotCopy> = Handle::new(3, 1);
        let b = a;
        assert_eq!(a, b);
        assert_eq!(a.index(), 3);
        assert_eq!(a.generation(), 1);
    }

    #[test]
    fn generation_distinguishes_handles() {
        let a: Handle<u8> = Handle::new(0, 0);
        let b: Handle<u8> = Handle::new(0, 1);
        assert_ne!(a, b);
        assert!(a < b);
        assert_eq!(format!("{b:?}"), "Handle(0v1)");
    }
}
