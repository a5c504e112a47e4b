use std::time::Instant;

/// Rounds `value` up to the next power of two.
///
/// Returns 0 when the input is 0 or when the result would not fit below
/// `0x4000_0000`, the largest wheel size the timer supports.
pub(crate) fn next_positive_power_of_two(value: u32) -> u32 {
    if value == 0 || value >= 0x4000_0000 {
        return 0;
    }
    1u32 << (32 - (value - 1).leading_zeros())
}

/// Ceiling division for non-negative numerators; negative numerators map to 0.
pub(crate) fn ceil_div(numerator: i64, denominator: i64) -> i64 {
    debug_assert!(denominator > 0);
    if numerator <= 0 {
        0
    } else {
        (numerator - 1) / denominator + 1
    }
}

/// Nanoseconds elapsed since `start`, saturated into `i64`.
///
/// `Instant` is monotonic, so the value is never negative; saturation only
/// matters near the i64 horizon (about 292 years of uptime).
pub(crate) fn elapsed_nanos(start: Instant) -> i64 {
    start.elapsed().as_nanos().min(i64::MAX as u128) as i64
}

#[cfg(test)]
mod tests {
    use super::{ceil_div, next_positive_power_of_two};

    #[test]
    fn next_positive_power_of_two_table() {
        let cases: &[(u32, u32)] = &[
            (0, 0),
            (1, 1),
            (2, 2),
            (3, 4),
            (5, 8),
            (0x4000_0000 - 1, 0x4000_0000),
            (0x4000_0000, 0),
            (u32::MAX, 0),
        ];
        for (input, expected) in cases {
            assert_eq!(next_positive_power_of_two(*input), *expected, "input {input:#x}");
        }
    }

    #[test]
    fn ceil_div_rounds_up() {
        assert_eq!(ceil_div(0, 1_000_000), 0);
        assert_eq!(ceil_div(-5, 1_000_000), 0);
        assert_eq!(ceil_div(1, 1_000_000), 1);
        assert_eq!(ceil_div(1_000_000, 1_000_000), 1);
        assert_eq!(ceil_div(1_000_001, 1_000_000), 2);
        assert_eq!(ceil_div(2_999_999, 1_000_000), 3);
    }
}
