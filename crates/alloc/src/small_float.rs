//! 8-bit floating point size classes: 5-bit exponent, 3-bit mantissa.
//!
//! Sizes below [`MANTISSA_VALUE`] map to themselves. Above that, each power
//! of two is split into eight linearly spaced classes.

pub const MANTISSA_BITS: u32 = 3;
pub const MANTISSA_VALUE: u32 = 1 << MANTISSA_BITS;
pub const MANTISSA_MASK: u32 = MANTISSA_VALUE - 1;

/// Smallest class whose size is `>= size`. Used when searching.
pub fn round_up(size: u32) -> u32 {
    if size < MANTISSA_VALUE {
        return size;
    }
    let highest_set_bit = 31 - size.leading_zeros();
    let mantissa_start_bit = highest_set_bit - MANTISSA_BITS;
    let exponent = mantissa_start_bit + 1;
    let mut mantissa = (size >> mantissa_start_bit) & MANTISSA_MASK;

    let low_bits_mask = (1u32 << mantissa_start_bit) - 1;
    if size & low_bits_mask != 0 {
        mantissa += 1;
    }
    // A mantissa overflow carries into the exponent, which is what we want.
    (exponent << MANTISSA_BITS) + mantissa
}

/// Largest class whose size is `<= size`. Used when inserting free blocks,
/// so a block is never filed under a class it cannot satisfy.
pub fn round_down(size: u32) -> u32 {
    if size < MANTISSA_VALUE {
        return size;
    }
    let highest_set_bit = 31 - size.leading_zeros();
    let mantissa_start_bit = highest_set_bit - MANTISSA_BITS;
    let exponent = mantissa_start_bit + 1;
    let mantissa = (size >> mantissa_start_bit) & MANTISSA_MASK;
    (exponent << MANTISSA_BITS) | mantissa
}

/// Size represented by a class.
pub fn to_size(class: u32) -> u32 {
    let exponent = class >> MANTISSA_BITS;
    let mantissa = class & MANTISSA_MASK;
    if exponent == 0 {
        mantissa
    } else {
        (mantissa | MANTISSA_VALUE) << (exponent - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_sizes_are_exact() {
        for size in 0..MANTISSA_VALUE {
            assert_eq!(round_up(size), size);
            assert_eq!(round_down(size), size);
            assert_eq!(to_size(size), size);
        }
    }

    #[test]
    fn class_sizes_round_trip() {
        for class in 0..240 {
            let size = to_size(class);
            assert_eq!(round_up(size), class);
            assert_eq!(round_down(size), class);
        }
    }

    #[test]
    fn round_down_never_overstates() {
        let mut size = 1u32;
        while size < (1 << 30) {
            for candidate in [size, size + 1, size + size / 3, size * 2 - 1] {
                assert!(to_size(round_down(candidate)) <= candidate, "size {candidate}");
                assert!(to_size(round_up(candidate)) >= candidate, "size {candidate}");
            }
            size = size * 2 + 1;
        }
    }

    #[test]
    fn all_classes_fit_in_a_byte() {
        assert!(round_up(u32::MAX) <= 255);
        assert!(round_down(u32::MAX) <= 255);
    }
}
