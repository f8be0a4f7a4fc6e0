/// Tower-wise arithmetic on [`DcrtPoly`] and the operator facade.
///
/// Every operation first tries the attached PIM manager, if any. A PIM error
/// is logged and the same operation is recomputed on the host; the operand
/// towers are only replaced once a whole batch has come back, so the host
/// path always starts from unmodified data.
use std::ops::{Add, AddAssign, Mul, MulAssign, Sub, SubAssign};
use std::sync::Arc;

use rayon::prelude::*;
use tracing::warn;

use super::{DcrtPoly, Format, PimOffload, Tower};
use crate::arith::compute_mu;
use crate::arith::elementwise as ew;
use crate::error::{PimError, Result};
use crate::pim::KernelBinary;

type HostKernel = fn(&mut [u64], &[u64], u64);

/// Largest power of two not above `units / towers`, clamped to `[1, ring_dimension]`.
pub fn default_split(units: usize, towers: usize, ring_dimension: usize) -> usize {
    let per_tower = (units / towers.max(1)).min(ring_dimension).max(1);
    1 << per_tower.ilog2()
}

fn run_offload(offload: &PimOffload, a: &[Tower], b: &[Tower], kernel: KernelBinary, ring_dimension: usize) -> Result<Vec<Tower>> {
    let mut pim = offload.handle.lock().map_err(|_| PimError::ManagerPoisoned)?;
    let split = offload
        .split
        .unwrap_or_else(|| default_split(pim.unit_count(), a.len(), ring_dimension));
    pim.run_towers(a, b, kernel, split)
}

impl DcrtPoly {
    fn check_operand(&self, rhs: &DcrtPoly) -> Result<()> {
        let same_ring = Arc::ptr_eq(&self.params, &rhs.params)
            || (self.params.ring_dimension == rhs.params.ring_dimension
                && self.params.moduli == rhs.params.moduli);
        if !same_ring {
            return Err(PimError::ShapeMismatch(
                "operands use different DCRT parameters".to_string(),
            ));
        }
        if self.format != rhs.format {
            return Err(PimError::FormatMismatch {
                expected: self.format.name(),
            });
        }
        Ok(())
    }

    fn apply(&mut self, rhs: &DcrtPoly, kernel: KernelBinary, host: HostKernel) -> Result<()> {
        self.check_operand(rhs)?;
        if let Some(offload) = &self.offload {
            match run_offload(offload, &self.towers, &rhs.towers, kernel, self.ring_dimension()) {
                Ok(towers) => {
                    self.towers = towers;
                    return Ok(());
                }
                Err(err) => warn!(
                    kernel = kernel.file_name(),
                    error = %err,
                    "PIM offload failed, falling back to host"
                ),
            }
        }
        self.towers
            .par_iter_mut()
            .zip(rhs.towers.par_iter())
            .for_each(|(a, b)| host(&mut a.values, &b.values, a.modulus));
        Ok(())
    }

    pub fn try_add_assign(&mut self, rhs: &DcrtPoly) -> Result<()> {
        self.apply(rhs, KernelBinary::DcrtAdd, ew::add_vector_eq)
    }

    pub fn try_sub_assign(&mut self, rhs: &DcrtPoly) -> Result<()> {
        self.apply(rhs, KernelBinary::DcrtSub, ew::sub_vector_eq)
    }

    /// Pointwise product; both operands must be in evaluation format.
    pub fn try_mul_assign(&mut self, rhs: &DcrtPoly) -> Result<()> {
        if self.format != Format::Evaluation || rhs.format != Format::Evaluation {
            return Err(PimError::FormatMismatch {
                expected: Format::Evaluation.name(),
            });
        }
        self.apply(rhs, KernelBinary::DcrtMul, |a, b, m| {
            ew::mul_vector_eq(a, b, m, compute_mu(m))
        })
    }

    pub fn try_add(&self, rhs: &DcrtPoly) -> Result<DcrtPoly> {
        let mut out = self.clone();
        out.try_add_assign(rhs)?;
        Ok(out)
    }

    pub fn try_sub(&self, rhs: &DcrtPoly) -> Result<DcrtPoly> {
        let mut out = self.clone();
        out.try_sub_assign(rhs)?;
        Ok(out)
    }

    pub fn try_mul(&self, rhs: &DcrtPoly) -> Result<DcrtPoly> {
        let mut out = self.clone();
        out.try_mul_assign(rhs)?;
        Ok(out)
    }
}

/// Operator impls panic where the `try_*` form would return an error: on
/// mismatched parameters or formats, never on a PIM failure.
macro_rules! impl_poly_op {
    ($Op:ident, $op:ident, $OpAssign:ident, $op_assign:ident, $try_assign:ident) => {
        impl $OpAssign<&DcrtPoly> for DcrtPoly {
            fn $op_assign(&mut self, rhs: &DcrtPoly) {
                if let Err(err) = self.$try_assign(rhs) {
                    panic!("DcrtPoly::{}: {}", stringify!($op), err);
                }
            }
        }

        impl $OpAssign for DcrtPoly {
            fn $op_assign(&mut self, rhs: DcrtPoly) {
                self.$op_assign(&rhs);
            }
        }

        impl $Op<&DcrtPoly> for &DcrtPoly {
            type Output = DcrtPoly;

            fn $op(self, rhs: &DcrtPoly) -> DcrtPoly {
                let mut out = self.clone();
                out.$op_assign(rhs);
                out
            }
        }

        impl $Op for DcrtPoly {
            type Output = DcrtPoly;

            fn $op(mut self, rhs: DcrtPoly) -> DcrtPoly {
                self.$op_assign(&rhs);
                self
            }
        }
    };
}

impl_poly_op!(Add, add, AddAssign, add_assign, try_add_assign);
impl_poly_op!(Sub, sub, SubAssign, sub_assign, try_sub_assign);
impl_poly_op!(Mul, mul, MulAssign, mul_assign, try_mul_assign);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arith::{mod_add, mod_mul, mod_sub};
    use crate::config::PimConfig;
    use crate::pim::PimManager;
    use crate::poly::DcrtParams;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn setup(seed: u64) -> (Arc<DcrtParams>, DcrtPoly, DcrtPoly) {
        let params = Arc::new(DcrtParams::generate(64, 2, 58).unwrap());
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let a = DcrtPoly::random(&params, Format::Evaluation, &mut rng);
        let b = DcrtPoly::random(&params, Format::Evaluation, &mut rng);
        (params, a, b)
    }

    fn expect(a: &DcrtPoly, b: &DcrtPoly, f: fn(u64, u64, u64) -> u64) -> Vec<Tower> {
        a.towers()
            .iter()
            .zip(b.towers())
            .map(|(x, y)| Tower {
                modulus: x.modulus,
                values: x.values.iter().zip(&y.values).map(|(&u, &v)| f(u, v, x.modulus)).collect(),
            })
            .collect()
    }

    fn pim() -> crate::pim::PimHandle {
        PimManager::new(PimConfig::default().with_units(4).with_tasklets(4))
            .unwrap()
            .into_handle()
    }

    #[test]
    fn test_default_split() {
        assert_eq!(default_split(4, 2, 1024), 2);
        assert_eq!(default_split(7, 2, 1024), 2);
        assert_eq!(default_split(64, 3, 1024), 16);
        assert_eq!(default_split(2, 4, 1024), 1);
        assert_eq!(default_split(64, 1, 8), 8);
    }

    #[test]
    fn test_host_operators() {
        let (_, a, b) = setup(1);
        assert_eq!((&a + &b).towers(), expect(&a, &b, mod_add).as_slice());
        assert_eq!((&a - &b).towers(), expect(&a, &b, mod_sub).as_slice());
        assert_eq!((&a * &b).towers(), expect(&a, &b, mod_mul).as_slice());

        let mut c = a.clone();
        c += &b;
        c -= b.clone();
        assert_eq!(c.towers(), a.towers());
    }

    #[test]
    fn test_pim_operators_match_host() {
        let (_, a, b) = setup(2);
        let handle = pim();
        let mut offloaded = a.clone();
        offloaded.attach_pim(handle.clone(), None);
        assert!(offloaded.is_offloaded());

        assert_eq!((&offloaded + &b).towers(), expect(&a, &b, mod_add).as_slice());
        assert_eq!((&offloaded - &b).towers(), expect(&a, &b, mod_sub).as_slice());
        offloaded *= &b;
        assert_eq!(offloaded.towers(), expect(&a, &b, mod_mul).as_slice());

        let logs = handle.lock().unwrap().device_logs().to_vec();
        assert!(logs.iter().all(|log| log.starts_with("dcrt-mul")));
        assert!(offloaded.detach_pim().is_some());
        assert!(!offloaded.is_offloaded());
    }

    #[test]
    fn test_pim_failure_falls_back_to_host() {
        let _ = tracing_subscriber::fmt::try_init();
        let (_, a, b) = setup(3);
        let mut offloaded = a.clone();
        // 64 residues cannot be split across 3 units
        offloaded.attach_pim(pim(), Some(3));
        offloaded.try_add_assign(&b).unwrap();
        assert_eq!(offloaded.towers(), expect(&a, &b, mod_add).as_slice());
    }

    #[test]
    fn test_operand_checks() {
        let (_, a, b) = setup(4);
        let mut coeff = b.clone();
        coeff.switch_format().unwrap();
        assert!(matches!(a.try_add(&coeff), Err(PimError::FormatMismatch { .. })));
        assert!(matches!(
            coeff.try_mul(&coeff),
            Err(PimError::FormatMismatch { expected: "evaluation" })
        ));

        let other = Arc::new(DcrtParams::generate(64, 2, 50).unwrap());
        let c = DcrtPoly::zero(&other, Format::Evaluation);
        assert!(matches!(a.try_sub(&c), Err(PimError::ShapeMismatch(_))));
    }

    #[test]
    #[should_panic(expected = "DcrtPoly::mul")]
    fn test_mul_operator_panics_on_coefficient_format() {
        let (params, _, _) = setup(5);
        let a = DcrtPoly::zero(&params, Format::Coefficient);
        let _ = &a * &a;
    }
}
