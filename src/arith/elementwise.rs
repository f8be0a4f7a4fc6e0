/// Cache-level elementwise kernels.
///
/// Each function processes one tasklet cache: a short slice of residues that
/// has already been read from unit memory. `*_eq` variants update the first
/// operand in place; the others write into a separate result slice of the
/// same length. Scalar operands are reduced once per call before the loop.
use super::modular::{
    divide_and_round, mod_add_fast, mod_add_fast_eq, mod_exp, mod_inverse,
    mod_mul_fast, mod_mul_fast_eq, mod_reduce, mod_sub_fast, mod_sub_fast_eq, multiply_and_round,
};

// Addition

pub fn add_scalar(a: &[u64], scalar: u64, m: u64, res: &mut [u64]) {
    let s = mod_reduce(scalar, m);
    for (r, &x) in res.iter_mut().zip(a) {
        *r = mod_add_fast(x, s, m);
    }
}

pub fn add_scalar_eq(a: &mut [u64], scalar: u64, m: u64) {
    let s = mod_reduce(scalar, m);
    for x in a.iter_mut() {
        mod_add_fast_eq(x, s, m);
    }
}

pub fn add_vector(a: &[u64], b: &[u64], m: u64, res: &mut [u64]) {
    for ((r, &x), &y) in res.iter_mut().zip(a).zip(b) {
        *r = mod_add_fast(x, y, m);
    }
}

pub fn add_vector_eq(a: &mut [u64], b: &[u64], m: u64) {
    for (x, &y) in a.iter_mut().zip(b) {
        mod_add_fast_eq(x, y, m);
    }
}

// Subtraction

pub fn sub_scalar(a: &[u64], scalar: u64, m: u64, res: &mut [u64]) {
    let s = mod_reduce(scalar, m);
    for (r, &x) in res.iter_mut().zip(a) {
        *r = mod_sub_fast(x, s, m);
    }
}

pub fn sub_scalar_eq(a: &mut [u64], scalar: u64, m: u64) {
    let s = mod_reduce(scalar, m);
    for x in a.iter_mut() {
        mod_sub_fast_eq(x, s, m);
    }
}

pub fn sub_vector(a: &[u64], b: &[u64], m: u64, res: &mut [u64]) {
    for ((r, &x), &y) in res.iter_mut().zip(a).zip(b) {
        *r = mod_sub_fast(x, y, m);
    }
}

pub fn sub_vector_eq(a: &mut [u64], b: &[u64], m: u64) {
    for (x, &y) in a.iter_mut().zip(b) {
        mod_sub_fast_eq(x, y, m);
    }
}

// Multiplication. `mu` is computed by the caller once per launch.

pub fn mul_scalar(a: &[u64], scalar: u64, m: u64, mu: u64, res: &mut [u64]) {
    let s = mod_reduce(scalar, m);
    for (r, &x) in res.iter_mut().zip(a) {
        *r = mod_mul_fast(x, s, m, mu);
    }
}

pub fn mul_scalar_eq(a: &mut [u64], scalar: u64, m: u64, mu: u64) {
    let s = mod_reduce(scalar, m);
    for x in a.iter_mut() {
        mod_mul_fast_eq(x, s, m, mu);
    }
}

pub fn mul_vector(a: &[u64], b: &[u64], m: u64, mu: u64, res: &mut [u64]) {
    for ((r, &x), &y) in res.iter_mut().zip(a).zip(b) {
        *r = mod_mul_fast(x, y, m, mu);
    }
}

pub fn mul_vector_eq(a: &mut [u64], b: &[u64], m: u64, mu: u64) {
    for (x, &y) in a.iter_mut().zip(b) {
        mod_mul_fast_eq(x, y, m, mu);
    }
}

// Mod-ops family

/// Parity of the centered lift of each residue: values above `m/2` are
/// treated as negative.
pub fn mod_by_two(a: &[u64], m: u64, res: &mut [u64]) {
    let half = m >> 1;
    for (r, &x) in res.iter_mut().zip(a) {
        *r = 1 & (x ^ (x > half) as u64);
    }
}

pub fn mod_by_two_eq(a: &mut [u64], m: u64) {
    let half = m >> 1;
    for x in a.iter_mut() {
        *x = 1 & (*x ^ (*x > half) as u64);
    }
}

#[inline]
fn switch_one(v: u64, old_m: u64, new_m: u64, half: u64) -> u64 {
    if new_m > old_m {
        if v > half {
            v + (new_m - old_m)
        } else {
            v
        }
    } else {
        let v = if v > half {
            v + (new_m - old_m % new_m)
        } else {
            v
        };
        mod_reduce(v, new_m)
    }
}

/// Re-encodes residues from `old_m` to `new_m`, preserving the sign of the
/// centered lift.
pub fn switch_modulus_eq(a: &mut [u64], old_m: u64, new_m: u64) {
    let half = old_m >> 1;
    for x in a.iter_mut() {
        *x = switch_one(*x, old_m, new_m, half);
    }
}

/// Out-of-place modulus change. A target modulus of 2 takes the parity path.
pub fn modulus(a: &[u64], old_m: u64, new_m: u64, res: &mut [u64]) {
    if new_m == 2 {
        return mod_by_two(a, old_m, res);
    }
    let half = old_m >> 1;
    for (r, &x) in res.iter_mut().zip(a) {
        *r = switch_one(x, old_m, new_m, half);
    }
}

pub fn modulus_eq(a: &mut [u64], old_m: u64, new_m: u64) {
    if new_m == 2 {
        return mod_by_two_eq(a, old_m);
    }
    switch_modulus_eq(a, old_m, new_m);
}

/// Elementwise `a^exponent mod m`. The exponent is reduced once by `m`.
pub fn mod_exp_vector(a: &[u64], exponent: u64, m: u64, res: &mut [u64]) {
    let exponent = mod_reduce(exponent, m);
    for (r, &x) in res.iter_mut().zip(a) {
        *r = mod_exp(x, exponent, m);
    }
}

pub fn mod_exp_vector_eq(a: &mut [u64], exponent: u64, m: u64) {
    let exponent = mod_reduce(exponent, m);
    for x in a.iter_mut() {
        *x = mod_exp(*x, exponent, m);
    }
}

pub fn mod_inverse_vector(a: &[u64], m: u64, res: &mut [u64]) {
    for (r, &x) in res.iter_mut().zip(a) {
        *r = mod_inverse(x, m);
    }
}

pub fn mod_inverse_vector_eq(a: &mut [u64], m: u64) {
    for x in a.iter_mut() {
        *x = mod_inverse(*x, m);
    }
}

/// Applies `f` to the magnitude of the centered lift and restores the sign.
#[inline]
fn signed_round(v: u64, m: u64, half: u64, f: impl Fn(u64) -> u64) -> u64 {
    if v > half {
        let r = mod_reduce(f(m - v), m);
        if r == 0 {
            0
        } else {
            m - r
        }
    } else {
        mod_reduce(f(v), m)
    }
}

/// `round(x * p / q)` on centered lifts, reduced back into `[0, m)`.
pub fn multiply_and_round_vector(a: &[u64], m: u64, p: u64, q: u64, res: &mut [u64]) {
    let half = m >> 1;
    for (r, &x) in res.iter_mut().zip(a) {
        *r = signed_round(x, m, half, |v| multiply_and_round(v, p, q));
    }
}

pub fn multiply_and_round_vector_eq(a: &mut [u64], m: u64, p: u64, q: u64) {
    let half = m >> 1;
    for x in a.iter_mut() {
        *x = signed_round(*x, m, half, |v| multiply_and_round(v, p, q));
    }
}

/// `round(x / q)` on centered lifts, reduced back into `[0, m)`.
pub fn divide_and_round_vector(a: &[u64], m: u64, q: u64, res: &mut [u64]) {
    let half = m >> 1;
    for (r, &x) in res.iter_mut().zip(a) {
        *r = signed_round(x, m, half, |v| divide_and_round(v, q));
    }
}

pub fn divide_and_round_vector_eq(a: &mut [u64], m: u64, q: u64) {
    let half = m >> 1;
    for x in a.iter_mut() {
        *x = signed_round(*x, m, half, |v| divide_and_round(v, q));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arith::modular::{compute_mu, mod_mul};
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha20Rng;

    const M: u64 = 1073692673;

    fn random_vec(rng: &mut ChaCha20Rng, len: usize, m: u64) -> Vec<u64> {
        (0..len).map(|_| rng.gen_range(0..m)).collect()
    }

    #[test]
    fn test_eq_variants_match_out_of_place() {
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let a = random_vec(&mut rng, 32, M);
        let b = random_vec(&mut rng, 32, M);
        let mu = compute_mu(M);
        let mut res = vec![0u64; 32];

        add_vector(&a, &b, M, &mut res);
        let mut eq = a.clone();
        add_vector_eq(&mut eq, &b, M);
        assert_eq!(eq, res);

        sub_vector(&a, &b, M, &mut res);
        let mut eq = a.clone();
        sub_vector_eq(&mut eq, &b, M);
        assert_eq!(eq, res);

        mul_vector(&a, &b, M, mu, &mut res);
        let mut eq = a.clone();
        mul_vector_eq(&mut eq, &b, M, mu);
        assert_eq!(eq, res);
        for i in 0..32 {
            assert_eq!(res[i], mod_mul(a[i], b[i], M));
        }
    }

    #[test]
    fn test_scalar_is_reduced_first() {
        let a = vec![1u64, 2, M - 1];
        let mut res = vec![0u64; 3];
        add_scalar(&a, M + 1, M, &mut res);
        assert_eq!(res, vec![2, 3, 0]);
        sub_scalar(&a, 2 * M + 2, M, &mut res);
        assert_eq!(res, vec![M - 1, 0, M - 3]);
        mul_scalar(&a, M + 2, M, compute_mu(M), &mut res);
        assert_eq!(res, vec![2, 4, M - 2]);

        let mut eq = a.clone();
        mul_scalar_eq(&mut eq, M + 2, M, compute_mu(M));
        assert_eq!(eq, res);
    }

    #[test]
    fn test_switch_modulus_preserves_sign() {
        let (old_m, new_m) = (17u64, 97u64);
        // 3 and -3 (= 14 mod 17)
        let mut up = vec![3u64, 14];
        switch_modulus_eq(&mut up, old_m, new_m);
        assert_eq!(up, vec![3, 94]);

        let mut down = vec![3u64, 94, 50];
        switch_modulus_eq(&mut down, new_m, old_m);
        // 50 is above 97/2, i.e. -47 = 4 mod 17
        assert_eq!(down, vec![3, 14, 4]);
    }

    #[test]
    fn test_modulus_out_of_place_and_parity() {
        let a = vec![3u64, 94, 10];
        let mut res = vec![0u64; 3];
        modulus(&a, 97, 17, &mut res);
        assert_eq!(res, vec![3, 14, 10]);

        // -3 is odd
        modulus(&a, 97, 2, &mut res);
        assert_eq!(res, vec![1, 1, 0]);

        let mut eq = a.clone();
        modulus_eq(&mut eq, 97, 2);
        assert_eq!(eq, res);
    }

    #[test]
    fn test_exp_and_inverse_vectors() {
        let a = vec![2u64, 3, 0];
        let mut res = vec![0u64; 3];
        mod_exp_vector(&a, 5, 97, &mut res);
        assert_eq!(res, vec![32, 243 % 97, 0]);

        // 100 reduces to 3 under 97
        mod_exp_vector(&a, 100, 97, &mut res);
        assert_eq!(res, vec![8, 27, 0]);
        let mut eq = a.clone();
        mod_exp_vector_eq(&mut eq, 100, 97);
        assert_eq!(eq, res);

        mod_inverse_vector(&a, 97, &mut res);
        assert_eq!(res, vec![49, 65, 0]);
        let mut eq = a.clone();
        mod_inverse_vector_eq(&mut eq, 97);
        assert_eq!(eq, res);
    }

    #[test]
    fn test_rounding_vectors_centered() {
        let m = 97u64;
        // 7 and -7
        let a = vec![7u64, 90];
        let mut res = vec![0u64; 2];
        multiply_and_round_vector(&a, m, 3, 2, &mut res);
        assert_eq!(res, vec![11, m - 11]);

        let mut eq = a.clone();
        multiply_and_round_vector_eq(&mut eq, m, 3, 2);
        assert_eq!(eq, res);

        divide_and_round_vector(&a, m, 2, &mut res);
        assert_eq!(res, vec![4, m - 4]);
        let mut eq = a.clone();
        divide_and_round_vector_eq(&mut eq, m, 2);
        assert_eq!(eq, res);
    }
}
