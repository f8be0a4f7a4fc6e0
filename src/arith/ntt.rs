/// Negacyclic number-theoretic transform over a single tower.
///
/// The forward pass is an iterative Cooley-Tukey transform that consumes
/// coefficients in natural order and leaves evaluations in bit-reversed order.
/// The inverse pass is the matching Gentleman-Sande transform followed by a
/// scaling with `N^{-1}`. Both use twiddle tables indexed by bit-reversed
/// exponent together with their Shoup companions, so each butterfly costs a
/// single emulated high product.
///
/// Key Features:
/// - Powers of a primitive `2N`-th root `psi` fold the negacyclic wrap into
///   the transform, so pointwise products correspond to multiplication in
///   `Z_m[X]/(X^N + 1)`
/// - The final forward stage (`t == 1`) runs as a separate unrolled pass
/// - Output slot `i` holds the evaluation at `psi^(2*bitrev(i) + 1)`
use super::modular::{
    check_modulus, mod_add_fast, mod_exp, mod_inverse, mod_mul_fast_const, mod_sub_fast,
    precompute_shoup,
};
use crate::error::{PimError, Result};

/// Reverses the low `bits` bits of `x`.
#[inline]
pub fn bit_reverse(x: usize, bits: u32) -> usize {
    if bits == 0 {
        return 0;
    }
    x.reverse_bits() >> (usize::BITS - bits)
}

/// Twiddle tables for one `(modulus, length)` pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RootTables {
    modulus: u64,
    root: u64,
    forward: Vec<u64>,
    forward_precon: Vec<u64>,
    inverse: Vec<u64>,
    inverse_precon: Vec<u64>,
    length_inv: u64,
    length_inv_precon: u64,
}

impl RootTables {
    /// Precomputes the tables for transforms of length `n`.
    ///
    /// # Arguments
    /// * `root` - A primitive `2n`-th root of unity modulo `modulus`
    /// * `n` - Transform length, a power of two no smaller than 2
    /// * `modulus` - Prime modulus with `2n | modulus - 1`
    ///
    /// # Returns
    /// * `Result<Self>` - The tables, or `InvalidParameters` when `root` is not
    ///   a primitive `2n`-th root
    pub fn new(root: u64, n: usize, modulus: u64) -> Result<Self> {
        check_modulus(modulus)?;
        if n < 2 || !n.is_power_of_two() {
            return Err(PimError::InvalidParameters(format!(
                "transform length {} is not a power of two >= 2",
                n
            )));
        }
        if root == 0 || root >= modulus || mod_exp(root, n as u64, modulus) != modulus - 1 {
            return Err(PimError::InvalidParameters(format!(
                "{} is not a primitive {}-th root of unity mod {}",
                root,
                2 * n,
                modulus
            )));
        }

        let root_inv = mod_inverse(root, modulus);
        let bits = n.trailing_zeros();
        let forward: Vec<u64> = (0..n)
            .map(|i| mod_exp(root, bit_reverse(i, bits) as u64, modulus))
            .collect();
        let inverse: Vec<u64> = (0..n)
            .map(|i| mod_exp(root_inv, bit_reverse(i, bits) as u64, modulus))
            .collect();
        let forward_precon = forward.iter().map(|&w| precompute_shoup(w, modulus)).collect();
        let inverse_precon = inverse.iter().map(|&w| precompute_shoup(w, modulus)).collect();
        let length_inv = mod_inverse(n as u64, modulus);

        Ok(Self {
            modulus,
            root,
            forward,
            forward_precon,
            inverse,
            inverse_precon,
            length_inv,
            length_inv_precon: precompute_shoup(length_inv, modulus),
        })
    }

    pub fn modulus(&self) -> u64 {
        self.modulus
    }

    pub fn root(&self) -> u64 {
        self.root
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    fn check_len(&self, values: &[u64]) -> Result<()> {
        if values.len() != self.len() {
            return Err(PimError::ShapeMismatch(format!(
                "transform of length {} applied to {} values",
                self.len(),
                values.len()
            )));
        }
        Ok(())
    }
}

/// In-place forward transform, natural order in, bit-reversed order out.
///
/// Inputs must already be reduced below the modulus.
pub fn forward_transform_to_bit_reverse_in_place(values: &mut [u64], tables: &RootTables) -> Result<()> {
    tables.check_len(values)?;
    let m = tables.modulus;
    let n = values.len();
    let half = n >> 1;

    let mut t = n;
    let mut groups = 1;
    while groups < half {
        t >>= 1;
        for i in 0..groups {
            let w = tables.forward[groups + i];
            let w_precon = tables.forward_precon[groups + i];
            let j1 = (2 * i) * t;
            for j in j1..j1 + t {
                let u = values[j];
                let v = mod_mul_fast_const(values[j + t], w, m, w_precon);
                values[j] = mod_add_fast(u, v, m);
                values[j + t] = mod_sub_fast(u, v, m);
            }
        }
        groups <<= 1;
    }

    // Last stage, t == 1.
    for i in 0..half {
        let j = 2 * i;
        let w = tables.forward[half + i];
        let w_precon = tables.forward_precon[half + i];
        let u = values[j];
        let v = mod_mul_fast_const(values[j + 1], w, m, w_precon);
        values[j] = mod_add_fast(u, v, m);
        values[j + 1] = mod_sub_fast(u, v, m);
    }
    Ok(())
}

/// In-place inverse transform, bit-reversed order in, natural order out.
pub fn inverse_transform_from_bit_reverse_in_place(values: &mut [u64], tables: &RootTables) -> Result<()> {
    tables.check_len(values)?;
    let m = tables.modulus;
    let n = values.len();

    let mut t = 1;
    let mut groups = n >> 1;
    while groups >= 1 {
        let mut j1 = 0;
        for i in 0..groups {
            let w = tables.inverse[groups + i];
            let w_precon = tables.inverse_precon[groups + i];
            for j in j1..j1 + t {
                let u = values[j];
                let v = values[j + t];
                values[j] = mod_add_fast(u, v, m);
                values[j + t] = mod_mul_fast_const(mod_sub_fast(u, v, m), w, m, w_precon);
            }
            j1 += 2 * t;
        }
        t <<= 1;
        groups >>= 1;
    }

    for x in values.iter_mut() {
        *x = mod_mul_fast_const(*x, tables.length_inv, m, tables.length_inv_precon);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arith::modular::mod_mul;
    use proptest::prelude::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha20Rng;

    const M: u64 = 1073692673;

    fn primitive_root(m: u64, n: usize) -> u64 {
        (2..)
            .map(|g| mod_exp(g, (m - 1) / (2 * n as u64), m))
            .find(|&psi| mod_exp(psi, n as u64, m) == m - 1)
            .unwrap()
    }

    fn negacyclic_product(a: &[u64], b: &[u64], m: u64) -> Vec<u64> {
        let n = a.len();
        let mut out = vec![0u64; n];
        for i in 0..n {
            for j in 0..n {
                let p = mod_mul(a[i], b[j], m);
                let k = i + j;
                if k < n {
                    out[k] = (out[k] + p) % m;
                } else {
                    out[k - n] = (out[k - n] + m - p) % m;
                }
            }
        }
        out
    }

    #[test]
    fn test_bit_reverse() {
        assert_eq!(bit_reverse(1, 3), 4);
        assert_eq!(bit_reverse(6, 3), 3);
        assert_eq!(bit_reverse(5, 0), 0);
    }

    #[test]
    fn test_rejects_bad_root_and_length() {
        assert!(RootTables::new(1, 8, M).is_err());
        assert!(RootTables::new(primitive_root(M, 8), 6, M).is_err());
        let tables = RootTables::new(primitive_root(M, 8), 8, M).unwrap();
        let mut short = vec![0u64; 4];
        assert!(forward_transform_to_bit_reverse_in_place(&mut short, &tables).is_err());
    }

    #[test]
    fn test_forward_matches_direct_evaluation() {
        let n = 8;
        let psi = primitive_root(M, n);
        let tables = RootTables::new(psi, n, M).unwrap();
        let a: Vec<u64> = (1..=n as u64).collect();
        let mut transformed = a.clone();
        forward_transform_to_bit_reverse_in_place(&mut transformed, &tables).unwrap();

        for (i, &value) in transformed.iter().enumerate() {
            let point = mod_exp(psi, (2 * bit_reverse(i, 3) + 1) as u64, M);
            let expected = a
                .iter()
                .rev()
                .fold(0u64, |acc, &c| (mod_mul(acc, point, M) + c) % M);
            assert_eq!(value, expected, "slot {}", i);
        }
    }

    #[test]
    fn test_pointwise_product_is_negacyclic_convolution() {
        let n = 32;
        let tables = RootTables::new(primitive_root(M, n), n, M).unwrap();
        let mut rng = ChaCha20Rng::seed_from_u64(42);
        let a: Vec<u64> = (0..n).map(|_| rng.gen_range(0..M)).collect();
        let b: Vec<u64> = (0..n).map(|_| rng.gen_range(0..M)).collect();

        let (mut fa, mut fb) = (a.clone(), b.clone());
        forward_transform_to_bit_reverse_in_place(&mut fa, &tables).unwrap();
        forward_transform_to_bit_reverse_in_place(&mut fb, &tables).unwrap();
        let mut prod: Vec<u64> = fa.iter().zip(&fb).map(|(&x, &y)| mod_mul(x, y, M)).collect();
        inverse_transform_from_bit_reverse_in_place(&mut prod, &tables).unwrap();

        assert_eq!(prod, negacyclic_product(&a, &b, M));
    }

    proptest! {
        #[test]
        fn prop_round_trip(log_n in 1u32..9, seed in any::<u64>()) {
            let n = 1usize << log_n;
            let tables = RootTables::new(primitive_root(M, n), n, M).unwrap();
            let mut rng = ChaCha20Rng::seed_from_u64(seed);
            let original: Vec<u64> = (0..n).map(|_| rng.gen_range(0..M)).collect();
            let mut values = original.clone();
            forward_transform_to_bit_reverse_in_place(&mut values, &tables).unwrap();
            inverse_transform_from_bit_reverse_in_place(&mut values, &tables).unwrap();
            prop_assert_eq!(values, original);
        }
    }
}
