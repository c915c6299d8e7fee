pub fn msb(n: u64) -> i8 {
    for i in (0..64).rev() {
        if n & (1u64 << i) != 0 {
            return i;
        }
    }
    -1
}

#[inline]
pub fn is_power_of_two(n: usize) -> bool {
    n != 0 && n & (n - 1) == 0
}

// div_round_up returns ceil(n / d). d must not be zero.
#[inline]
pub fn div_round_up(n: usize, d: usize) -> usize {
    (n + d - 1) / d
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msb_of_values() {
        assert_eq!(msb(0), -1);
        assert_eq!(msb(1), 0);
        assert_eq!(msb(0x80), 7);
        assert_eq!(msb(u64::MAX), 63);
    }

    #[test]
    fn round_up_division() {
        assert_eq!(div_round_up(20, 16), 2);
        assert_eq!(div_round_up(16, 16), 1);
        assert_eq!(div_round_up(10000, 16), 625);
        assert_eq!(div_round_up(0, 16), 0);
    }

    #[test]
    fn powers_of_two() {
        assert!(is_power_of_two(16));
        assert!(!is_power_of_two(0));
        assert!(!is_power_of_two(24));
    }
}
