//! Alignment arithmetic shared by buffer, texture and shader table layout code

/// Round `value` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two. Zero stays zero.
#[inline]
pub const fn round_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Whether `value` is already a multiple of `alignment`
#[inline]
pub const fn is_aligned(value: u64, alignment: u64) -> bool {
    value & (alignment - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_up_properties() {
        for shift in 0..10 {
            let alignment = 1u64 << shift;
            for value in 0..2048u64 {
                let rounded = round_up(value, alignment);
                assert_eq!(rounded % alignment, 0);
                assert!(rounded >= value);
                assert!(rounded - value < alignment);
            }
        }
    }

    #[test]
    fn test_round_up_known_values() {
        assert_eq!(round_up(0, 64), 0);
        assert_eq!(round_up(1, 64), 64);
        assert_eq!(round_up(64, 64), 64);
        assert_eq!(round_up(65, 64), 128);
    }

    #[test]
    fn test_is_aligned() {
        assert!(is_aligned(256, 256));
        assert!(!is_aligned(257, 256));
        assert!(is_aligned(0, 8));
    }
}
