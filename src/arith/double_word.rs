/// Emulated 128-bit arithmetic built from 64-bit words.
///
/// PIM units have no native 128-bit multiply, so every double-width product in
/// the modular kernels goes through these helpers. The product is assembled
/// from four 32x32 partial products with explicit carry propagation.

/// Unsigned 128-bit value stored as two 64-bit halves.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DoubleWord {
    pub hi: u64,
    pub lo: u64,
}

const LOW_MASK: u64 = 0xFFFF_FFFF;

impl DoubleWord {
    pub const ZERO: DoubleWord = DoubleWord { hi: 0, lo: 0 };

    pub const fn new(hi: u64, lo: u64) -> Self {
        Self { hi, lo }
    }

    pub const fn from_word(lo: u64) -> Self {
        Self { hi: 0, lo }
    }

    /// `2^exp` for `exp < 128`.
    pub const fn power_of_two(exp: u32) -> Self {
        if exp >= 64 {
            Self { hi: 1 << (exp - 64), lo: 0 }
        } else {
            Self { hi: 0, lo: 1 << exp }
        }
    }

    pub fn is_zero(&self) -> bool {
        self.hi == 0 && self.lo == 0
    }
}

/// Full 64x64 -> 128 bit product.
///
/// # Arguments
/// * `a`, `b` - Word operands
///
/// # Returns
/// * `DoubleWord` - The exact product
pub fn mult_d(a: u64, b: u64) -> DoubleWord {
    let (a0, a1) = (a & LOW_MASK, a >> 32);
    let (b0, b1) = (b & LOW_MASK, b >> 32);

    let p00 = a0 * b0;
    let p01 = a0 * b1;
    let p10 = a1 * b0;
    let p11 = a1 * b1;

    // At most 3 * (2^32 - 1), no overflow.
    let middle = (p00 >> 32) + (p01 & LOW_MASK) + (p10 & LOW_MASK);

    DoubleWord {
        hi: p11 + (p01 >> 32) + (p10 >> 32) + (middle >> 32),
        lo: (p00 & LOW_MASK) | (middle << 32),
    }
}

/// High word of the 128-bit product `a * b`.
#[inline]
pub fn mult_d_hi(a: u64, b: u64) -> u64 {
    mult_d(a, b).hi
}

/// Low 64 bits of `x >> shift`.
pub fn rshift_d(x: DoubleWord, shift: u32) -> u64 {
    match shift {
        0 => x.lo,
        1..=63 => (x.lo >> shift) | (x.hi << (64 - shift)),
        64..=127 => x.hi >> (shift - 64),
        _ => 0,
    }
}

/// `a - b` modulo 2^128.
pub fn subtract_d(a: DoubleWord, b: DoubleWord) -> DoubleWord {
    let (lo, borrow) = a.lo.overflowing_sub(b.lo);
    let hi = a.hi.wrapping_sub(b.hi).wrapping_sub(borrow as u64);
    DoubleWord { hi, lo }
}

/// `a + b` modulo 2^128.
pub fn add_d(a: DoubleWord, b: DoubleWord) -> DoubleWord {
    let (lo, carry) = a.lo.overflowing_add(b.lo);
    let hi = a.hi.wrapping_add(b.hi).wrapping_add(carry as u64);
    DoubleWord { hi, lo }
}

/// Restoring long division of a double word by a single word.
///
/// Returns `(quotient, remainder)`. A zero divisor yields an all-ones
/// quotient and the dividend's low word as remainder; callers validate
/// divisors before reaching this point.
pub fn div_rem_d(x: DoubleWord, d: u64) -> (DoubleWord, u64) {
    if x.hi == 0 && d != 0 {
        return (DoubleWord::from_word(x.lo / d), x.lo % d);
    }

    let mut quotient = DoubleWord::ZERO;
    let mut rem: u64 = 0;
    for bit in (0..128u32).rev() {
        let next = if bit >= 64 {
            (x.hi >> (bit - 64)) & 1
        } else {
            (x.lo >> bit) & 1
        };
        let carry = rem >> 63;
        rem = (rem << 1) | next;
        if carry == 1 || rem >= d {
            rem = rem.wrapping_sub(d);
            if bit >= 64 {
                quotient.hi |= 1 << (bit - 64);
            } else {
                quotient.lo |= 1 << bit;
            }
        }
    }
    (quotient, rem)
}

/// Bit length of `x` (0 for 0).
#[inline]
pub fn get_msb(x: u64) -> u32 {
    64 - x.leading_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn to_u128(x: DoubleWord) -> u128 {
        ((x.hi as u128) << 64) | x.lo as u128
    }

    fn from_u128(x: u128) -> DoubleWord {
        DoubleWord::new((x >> 64) as u64, x as u64)
    }

    #[test]
    fn test_mult_d_extremes() {
        assert_eq!(mult_d(0, u64::MAX), DoubleWord::ZERO);
        assert_eq!(
            to_u128(mult_d(u64::MAX, u64::MAX)),
            (u64::MAX as u128) * (u64::MAX as u128)
        );
        assert_eq!(mult_d(1 << 32, 1 << 32), DoubleWord::new(1, 0));
    }

    #[test]
    fn test_rshift_d_edges() {
        let x = DoubleWord::new(0xABCD, 0x1234_5678_9ABC_DEF0);
        assert_eq!(rshift_d(x, 0), x.lo);
        assert_eq!(rshift_d(x, 64), 0xABCD);
        assert_eq!(rshift_d(x, 4), (to_u128(x) >> 4) as u64);
        assert_eq!(rshift_d(x, 200), 0);
    }

    #[test]
    fn test_get_msb() {
        assert_eq!(get_msb(0), 0);
        assert_eq!(get_msb(1), 1);
        assert_eq!(get_msb(u64::MAX), 64);
        assert_eq!(get_msb(1 << 59), 60);
    }

    #[test]
    fn test_div_rem_large_divisor() {
        let d = u64::MAX - 4;
        let x = mult_d(d - 1, d - 7);
        let (q, r) = div_rem_d(x, d);
        assert_eq!(to_u128(q), to_u128(x) / d as u128);
        assert_eq!(r as u128, to_u128(x) % d as u128);
    }

    proptest! {
        #[test]
        fn prop_mult_d_matches_native(a in any::<u64>(), b in any::<u64>()) {
            prop_assert_eq!(to_u128(mult_d(a, b)), a as u128 * b as u128);
        }

        #[test]
        fn prop_add_sub_inverse(a in any::<u128>(), b in any::<u128>()) {
            let (x, y) = (from_u128(a), from_u128(b));
            prop_assert_eq!(subtract_d(add_d(x, y), y), x);
            prop_assert_eq!(to_u128(subtract_d(x, y)), a.wrapping_sub(b));
        }

        #[test]
        fn prop_div_rem_matches_native(x in any::<u128>(), d in 1u64..=u64::MAX) {
            let (q, r) = div_rem_d(from_u128(x), d);
            prop_assert_eq!(to_u128(q), x / d as u128);
            prop_assert_eq!(r as u128, x % d as u128);
        }
    }
}
