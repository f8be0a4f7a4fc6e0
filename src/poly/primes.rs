/// NTT-friendly prime search.
///
/// Candidates are walked along the progression `q = 1 (mod m)` downwards and
/// tested with a deterministic Miller-Rabin: the witness set below is exact
/// for every 64-bit integer.
use crate::arith::mod_exp;
use crate::error::{PimError, Result};

const WITNESSES: [u64; 12] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37];

#[inline]
fn mul_mod(a: u64, b: u64, n: u64) -> u64 {
    ((a as u128 * b as u128) % n as u128) as u64
}

fn pow_mod(mut base: u64, mut exp: u64, n: u64) -> u64 {
    let mut acc = 1 % n;
    base %= n;
    while exp > 0 {
        if exp & 1 == 1 {
            acc = mul_mod(acc, base, n);
        }
        base = mul_mod(base, base, n);
        exp >>= 1;
    }
    acc
}

pub fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    for &p in WITNESSES.iter() {
        if n % p == 0 {
            return n == p;
        }
    }
    let s = (n - 1).trailing_zeros();
    let d = (n - 1) >> s;
    'witness: for &a in WITNESSES.iter() {
        let mut x = pow_mod(a, d, n);
        if x == 1 || x == n - 1 {
            continue;
        }
        for _ in 1..s {
            x = mul_mod(x, x, n);
            if x == n - 1 {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

/// Largest prime `q < 2^bits` with `q = 1 (mod m)`.
///
/// # Arguments
/// * `bits` - Bit size bound, at most 60
/// * `m` - Cyclotomic order, typically `2N`
pub fn first_prime(bits: u32, m: u64) -> Result<u64> {
    if bits < 2 || bits > 60 || m == 0 {
        return Err(PimError::InvalidParameters(format!(
            "no prime search for {} bits with order {}",
            bits, m
        )));
    }
    let bound = 1u64 << bits;
    let candidate = (bound - 1) / m * m + 1;
    let candidate = if candidate >= bound {
        candidate.checked_sub(m)
    } else {
        Some(candidate)
    };
    match candidate {
        Some(q) if is_prime(q) => Ok(q),
        Some(q) => previous_prime(q, m),
        None => Err(PimError::InvalidParameters(format!(
            "order {} leaves no candidates below 2^{}",
            m, bits
        ))),
    }
}

/// Next prime below `q` in the progression `1 (mod m)`.
pub fn previous_prime(q: u64, m: u64) -> Result<u64> {
    let exhausted = || {
        PimError::InvalidParameters(format!("no prime = 1 (mod {}) below {}", m, q))
    };
    if m == 0 {
        return Err(exhausted());
    }
    let mut candidate = q.checked_sub(m).ok_or_else(exhausted)?;
    while candidate > 1 {
        if is_prime(candidate) {
            return Ok(candidate);
        }
        candidate = candidate.checked_sub(m).ok_or_else(exhausted)?;
    }
    Err(exhausted())
}

/// A primitive `order`-th root of unity modulo the prime `modulus`, for a
/// power-of-two `order` dividing `modulus - 1`.
///
/// The smallest generator candidate `g` with `g^((q-1)/2)` of order two is
/// raised to `(q-1)/order`; the result is primitive exactly when its
/// `order/2`-th power is `-1`.
pub fn root_of_unity(order: u64, modulus: u64) -> Result<u64> {
    if order < 2 || !order.is_power_of_two() || modulus < 3 || (modulus - 1) % order != 0 {
        return Err(PimError::InvalidParameters(format!(
            "order {} does not divide {} - 1",
            order, modulus
        )));
    }
    let cofactor = (modulus - 1) / order;
    for g in 2..modulus.min(1 << 16) {
        let root = mod_exp(g, cofactor, modulus);
        if mod_exp(root, order / 2, modulus) == modulus - 1 {
            return Ok(root);
        }
    }
    Err(PimError::InvalidParameters(format!(
        "no primitive {}-th root found modulo {}",
        order, modulus
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primality() {
        let primes = [2u64, 3, 97, 1073692673, 288230376151130113, 1152921504606830593];
        let composites = [0u64, 1, 4, 561, 1105, 3215031751, 1073692671, 288230376151130111];
        assert!(primes.iter().all(|&p| is_prime(p)));
        assert!(composites.iter().all(|&c| !is_prime(c)));
    }

    #[test]
    fn test_prime_chain() {
        let m = 4096;
        let q0 = first_prime(58, m).unwrap();
        assert_eq!(q0, 288230376151683073);
        let q1 = previous_prime(q0, m).unwrap();
        assert_eq!(q1, 288230376151625729);
        assert!(q1 % m == 1 && q1 < q0);

        assert_eq!(first_prime(30, m).unwrap() % m, 1);
        assert!(first_prime(61, m).is_err());
        assert!(previous_prime(4097, 4096).is_err());
    }

    #[test]
    fn test_root_of_unity_is_primitive() {
        for &(q, order) in &[(1073692673u64, 4096u64), (288230376151130113, 2048), (97, 32)] {
            let root = root_of_unity(order, q).unwrap();
            assert_eq!(mod_exp(root, order, q), 1);
            assert_eq!(mod_exp(root, order / 2, q), q - 1);
        }
        assert!(root_of_unity(4096, 97).is_err());
        assert!(root_of_unity(12, 97).is_err());
    }
}
