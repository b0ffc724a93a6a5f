use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Deterministic [`Hasher`] backed by SHA-256.
///
/// Used to key shared GPU objects (layouts, pipelines, shaders, samplers) by
/// the structure of their descriptors. Key structs derive [`Hash`], so the
/// canonical field order is the declaration order.
#[derive(Clone, Default)]
pub struct StructuralHasher {
    digest: Sha256,
}

impl StructuralHasher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Hasher for StructuralHasher {
    fn write(&mut self, bytes: &[u8]) {
        self.digest.update(bytes);
    }

    fn finish(&self) -> u64 {
        let result = self.digest.clone().finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&result[..8]);
        u64::from_le_bytes(bytes)
    }
}

impl fmt::Debug for StructuralHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StructuralHasher").finish_non_exhaustive()
    }
}

/// Hash a value with a fresh [`StructuralHasher`].
pub fn structural_hash<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = StructuralHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Hash)]
    struct Shape {
        binding: u32,
        kind: &'static str,
    }

    #[test]
    fn equal_structures_hash_identically() {
        let a = Shape {
            binding: 0,
            kind: "texture",
        };
        let b = Shape {
            binding: 0,
            kind: "texture",
        };
        assert_eq!(structural_hash(&a), structural_hash(&b));
    }

    #[test]
    fn field_changes_change_the_hash() {
        let a = Shape {
            binding: 0,
            kind: "texture",
        };
        let b = Shape {
            binding: 1,
            kind: "texture",
        };
        assert_ne!(structural_hash(&a), structural_hash(&b));
    }

    #[test]
    fn finish_does_not_consume_state() {
        let mut hasher = StructuralHasher::new();
        hasher.write_u32(7);
        let first = hasher.finish();
        assert_eq!(first, hasher.finish());
        hasher.write_u32(8);
        assert_ne!(first, hasher.finish());
    }
}
