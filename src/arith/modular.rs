/// Word-sized modular arithmetic for PIM kernels.
///
/// Every function here is pure and works on residues held in a single `u64`.
/// Double-width intermediates go through [`super::double_word`], so the same
/// code path runs on host and (emulated) device without native 128-bit types.
///
/// Key Features:
/// - Barrett multiplication with `mu = floor(2^(2k+3) / m)`, `k = bitlength(m)`
/// - Shoup multiplication by a fixed operand with a precomputed companion
/// - Lazy "fast" add/sub for operands already below the modulus
/// - Exponentiation, extended-Euclid inverse and rounding division
///
/// Supported moduli are `2 <= m < 2^60`, leaving four bits of headroom for the
/// Barrett estimate. The single power of two `2^59` is excluded because its
/// `mu` is exactly `2^64`.
use super::double_word::{add_d, div_rem_d, get_msb, mult_d, mult_d_hi, rshift_d, DoubleWord};
use crate::error::{PimError, Result};

/// Largest supported modulus bit length.
pub const MAX_MODULUS_BITS: u32 = 60;

/// Checks that `m` is usable with the Barrett routines in this module.
pub fn check_modulus(m: u64) -> Result<()> {
    let bits = get_msb(m);
    if m < 2 || bits > MAX_MODULUS_BITS || (m.is_power_of_two() && bits == MAX_MODULUS_BITS) {
        return Err(PimError::InvalidModulus { modulus: m });
    }
    Ok(())
}

/// Barrett constant `floor(2^(2*bitlength(m)+3) / m)`.
///
/// Powers of two take a shift instead of a division. Returns 0 for `m == 0`.
pub fn compute_mu(m: u64) -> u64 {
    if m == 0 {
        return 0;
    }
    let msb = get_msb(m);
    let numerator = DoubleWord::power_of_two(2 * msb + 3);
    if m.is_power_of_two() {
        return rshift_d(numerator, msb - 1);
    }
    div_rem_d(numerator, m).0.lo
}

/// Reduces `x` into `[0, m)` with a plain remainder.
#[inline]
pub fn mod_reduce(x: u64, m: u64) -> u64 {
    if x >= m {
        x % m
    } else {
        x
    }
}

/// `(a + b) mod m` for operands already below `m`.
#[inline]
pub fn mod_add_fast(a: u64, b: u64, m: u64) -> u64 {
    let r = a + b;
    if r >= m {
        r - m
    } else {
        r
    }
}

#[inline]
pub fn mod_add_fast_eq(a: &mut u64, b: u64, m: u64) {
    *a = mod_add_fast(*a, b, m);
}

/// `(a + b) mod m` for arbitrary operands.
pub fn mod_add(a: u64, b: u64, m: u64) -> u64 {
    mod_add_fast(mod_reduce(a, m), mod_reduce(b, m), m)
}

/// `(a - b) mod m` for operands already below `m`.
#[inline]
pub fn mod_sub_fast(a: u64, b: u64, m: u64) -> u64 {
    if a < b {
        a + m - b
    } else {
        a - b
    }
}

#[inline]
pub fn mod_sub_fast_eq(a: &mut u64, b: u64, m: u64) {
    *a = mod_sub_fast(*a, b, m);
}

/// `(a - b) mod m` for arbitrary operands.
pub fn mod_sub(a: u64, b: u64, m: u64) -> u64 {
    mod_sub_fast(mod_reduce(a, m), mod_reduce(b, m), m)
}

/// Barrett reduction of a double word `x < m^2`.
///
/// # Arguments
/// * `x` - Value to reduce, strictly below `m^2`
/// * `m` - Modulus satisfying [`check_modulus`]
/// * `mu` - `compute_mu(m)`
///
/// # Returns
/// * `u64` - `x mod m`
///
/// # Performance Characteristics
/// - Three emulated 64x64 products and a single conditional subtraction
/// - The quotient estimate is never more than one below the true quotient
pub fn barrett_reduce(x: DoubleWord, m: u64, mu: u64) -> u64 {
    let n = get_msb(m) - 2;
    let estimate = mult_d(rshift_d(x, n), mu);
    let q = rshift_d(estimate, n + 7);
    // x - q*m < 2m, so the low word carries the whole difference.
    let r = x.lo.wrapping_sub(q.wrapping_mul(m));
    if r >= m {
        r - m
    } else {
        r
    }
}

/// `(a * b) mod m` via Barrett reduction, for `a, b < m`.
#[inline]
pub fn mod_mul_fast(a: u64, b: u64, m: u64, mu: u64) -> u64 {
    barrett_reduce(mult_d(a, b), m, mu)
}

#[inline]
pub fn mod_mul_fast_eq(a: &mut u64, b: u64, m: u64, mu: u64) {
    *a = mod_mul_fast(*a, b, m, mu);
}

/// `(a * b) mod m` for arbitrary operands.
pub fn mod_mul(a: u64, b: u64, m: u64) -> u64 {
    let mu = compute_mu(m);
    mod_mul_fast(mod_reduce(a, m), mod_reduce(b, m), m, mu)
}

/// Shoup companion `floor(w * 2^64 / m)` of a fixed multiplicand `w < m`.
pub fn precompute_shoup(w: u64, m: u64) -> u64 {
    div_rem_d(DoubleWord::new(w, 0), m).0.lo
}

/// `(a * w) mod m` using the Shoup companion of `w`.
#[inline]
pub fn mod_mul_fast_const(a: u64, w: u64, m: u64, w_precon: u64) -> u64 {
    let q = mult_d_hi(a, w_precon);
    let r = a.wrapping_mul(w).wrapping_sub(q.wrapping_mul(m));
    if r >= m {
        r - m
    } else {
        r
    }
}

#[inline]
pub fn mod_mul_fast_const_eq(a: &mut u64, w: u64, m: u64, w_precon: u64) {
    *a = mod_mul_fast_const(*a, w, m, w_precon);
}

/// `b^e mod m` by left-to-right square and multiply.
pub fn mod_exp(b: u64, e: u64, m: u64) -> u64 {
    let mu = compute_mu(m);
    let base = mod_reduce(b, m);
    let mut acc = mod_reduce(1, m);
    for bit in (0..get_msb(e)).rev() {
        acc = mod_mul_fast(acc, acc, m, mu);
        if (e >> bit) & 1 == 1 {
            acc = mod_mul_fast(acc, base, m, mu);
        }
    }
    acc
}

/// Multiplicative inverse by the extended Euclidean algorithm.
///
/// Returns 0 when `a` has no inverse modulo `m` (including `a == 0`).
pub fn mod_inverse(a: u64, m: u64) -> u64 {
    if m < 2 {
        return 0;
    }
    let a = mod_reduce(a, m);
    if a == 0 {
        return 0;
    }

    // Bezout coefficients stay within [-m, m], which fits i64 for m < 2^63.
    let (mut old_r, mut r) = (a as i64, m as i64);
    let (mut old_s, mut s) = (1i64, 0i64);
    while r != 0 {
        let q = old_r / r;
        (old_r, r) = (r, old_r - q * r);
        (old_s, s) = (s, old_s - q * s);
    }
    if old_r != 1 {
        return 0;
    }
    if old_s < 0 {
        (old_s + m as i64) as u64
    } else {
        old_s as u64
    }
}

/// `round(data * p / q)` with ties rounded up, computed on double words.
///
/// The quotient is truncated to 64 bits. `q` must be non-zero.
pub fn multiply_and_round(data: u64, p: u64, q: u64) -> u64 {
    let numerator = add_d(mult_d(data, p), DoubleWord::from_word(q >> 1));
    div_rem_d(numerator, q).0.lo
}

/// `round(data / q)` with ties rounded up. `q` must be non-zero.
pub fn divide_and_round(data: u64, q: u64) -> u64 {
    let quotient = data / q;
    let rem = data % q;
    // q - floor(q/2) == ceil(q/2)
    if rem >= q - (q >> 1) {
        quotient + 1
    } else {
        quotient
    }
}
