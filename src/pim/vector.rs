/// Residue vectors resident in unit memory.
///
/// A [`PimVector`] is split evenly across every unit of a manager and lives at
/// the same MRAM address on each of them, so one parameter block broadcast to
/// all units describes the whole vector. Operations run the meta-driven
/// elementwise and mod-ops binaries and never copy data back to the host
/// unless asked to with [`PimVector::sync`].
///
/// Every operation taking a modulus `m` expects the stored residues to be
/// below `m`. [`PimVector::from_residues`] checks this on the way in;
/// [`PimVector::from_values`] copies as is.
use std::sync::{Arc, MutexGuard};

use tracing::warn;

use super::kernel::KernelBinary;
use super::manager::{PimHandle, PimManager, Transfer};
use crate::arith::{check_modulus, compute_mu};
use crate::device::params::{
    ElementwiseKernel, ElementwiseMeta, ModKernel, ModOpsMeta, Operand, RESIDUE_BYTES,
};
use crate::error::{PimError, Result};

pub struct PimVector {
    handle: PimHandle,
    address: u32,
    len: usize,
    per_unit: usize,
}

impl std::fmt::Debug for PimVector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PimVector")
            .field("address", &self.address)
            .field("len", &self.len)
            .field("per_unit", &self.per_unit)
            .finish()
    }
}

fn lock(handle: &PimHandle) -> Result<MutexGuard<'_, PimManager>> {
    handle.lock().map_err(|_| PimError::ManagerPoisoned)
}

#[derive(Clone, Copy)]
enum Family {
    Add,
    Sub,
    Mul,
}

impl Family {
    fn binary(self) -> KernelBinary {
        match self {
            Self::Add => KernelBinary::AddMod,
            Self::Sub => KernelBinary::SubMod,
            Self::Mul => KernelBinary::MultMod,
        }
    }
}

enum Rhs<'a> {
    Vector(&'a PimVector),
    Scalar(u64),
}

impl PimVector {
    /// Reserves room for `len` residues, `len / units` on each unit.
    fn reserve(handle: &PimHandle, len: usize) -> Result<Self> {
        let mut pim = lock(handle)?;
        let units = pim.unit_count();
        if len % units != 0 {
            return Err(PimError::UnevenPartition {
                tower_len: len,
                split_factor: units,
            });
        }
        let per_unit = len / units;
        let address = pim.allocate(per_unit * RESIDUE_BYTES)?;
        Ok(Self {
            handle: Arc::clone(handle),
            address,
            len,
            per_unit,
        })
    }

    /// Copies `values` into device memory. The length must be a multiple of
    /// the unit count.
    pub fn from_values(handle: &PimHandle, values: &[u64]) -> Result<Self> {
        let vector = Self::reserve(handle, values.len())?;
        lock(handle)?.copy_to_pim(values, vector.address, Transfer::Scatter)?;
        Ok(vector)
    }

    /// Like [`PimVector::from_values`], but refuses values not reduced by `m`.
    pub fn from_residues(handle: &PimHandle, values: &[u64], m: u64) -> Result<Self> {
        check_modulus(m)?;
        if let Some(pos) = values.iter().position(|&x| x >= m) {
            return Err(PimError::InvalidParameters(format!(
                "residue {} at index {} is not reduced modulo {}",
                values[pos], pos, m
            )));
        }
        Self::from_values(handle, values)
    }

    pub fn zeroed(handle: &PimHandle, len: usize) -> Result<Self> {
        let vector = Self::reserve(handle, len)?;
        let per_unit = vec![0u64; vector.per_unit];
        lock(handle)?.copy_to_pim(&per_unit, vector.address, Transfer::Broadcast)?;
        Ok(vector)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Per-unit MRAM address.
    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn handle(&self) -> &PimHandle {
        &self.handle
    }

    /// Copies the vector back to the host.
    pub fn sync(&self) -> Result<Vec<u64>> {
        lock(&self.handle)?.copy_from_pim(self.address, self.per_unit)
    }

    pub fn to_vec(&self) -> Result<Vec<u64>> {
        self.sync()
    }

    fn operand(&self) -> Operand {
        Operand::new(self.address as u64, (self.per_unit * RESIDUE_BYTES) as u32)
    }

    fn check_peer(&self, other: &PimVector) -> Result<()> {
        if !Arc::ptr_eq(&self.handle, &other.handle) {
            return Err(PimError::ShapeMismatch(
                "vectors belong to different managers".to_string(),
            ));
        }
        if self.len != other.len {
            return Err(PimError::ShapeMismatch(format!(
                "vector lengths {} and {}",
                self.len, other.len
            )));
        }
        Ok(())
    }

    fn elementwise(&self, family: Family, rhs: Rhs<'_>, m: u64, res: Option<&PimVector>) -> Result<()> {
        check_modulus(m)?;
        let (op2, kernel) = match (&rhs, res) {
            (Rhs::Vector(other), None) => (other.operand(), ElementwiseKernel::VectorEq),
            (Rhs::Vector(other), Some(_)) => (other.operand(), ElementwiseKernel::Vector),
            (Rhs::Scalar(s), None) => (Operand::new(*s, 0), ElementwiseKernel::ScalarEq),
            (Rhs::Scalar(s), Some(_)) => (Operand::new(*s, 0), ElementwiseKernel::Scalar),
        };
        if let Rhs::Vector(other) = rhs {
            self.check_peer(other)?;
        }
        let meta = ElementwiseMeta {
            op1: self.operand(),
            op2,
            res: res.map_or_else(Operand::default, |r| r.operand()),
            modulus: m,
            mu: match family {
                Family::Mul => compute_mu(m),
                _ => 0,
            },
            kernel,
        };
        lock(&self.handle)?.run_elementwise(family.binary(), &meta)
    }

    fn elementwise_new(&self, family: Family, rhs: Rhs<'_>, m: u64) -> Result<PimVector> {
        let res = Self::reserve(&self.handle, self.len)?;
        self.elementwise(family, rhs, m, Some(&res))?;
        Ok(res)
    }

    fn mod_ops(&self, kernel: ModKernel, m: u64, p: u64, q: u64, res: Option<&PimVector>) -> Result<()> {
        check_modulus(m)?;
        let meta = ModOpsMeta {
            op: self.operand(),
            res: res.map_or_else(Operand::default, |r| r.operand()),
            modulus: m,
            p,
            q,
            kernel,
        };
        lock(&self.handle)?.run_mod_ops(&meta)
    }

    fn mod_ops_new(&self, kernel: ModKernel, m: u64, p: u64, q: u64) -> Result<PimVector> {
        let res = Self::reserve(&self.handle, self.len)?;
        self.mod_ops(kernel, m, p, q, Some(&res))?;
        Ok(res)
    }

    pub fn add(&self, other: &PimVector, m: u64) -> Result<PimVector> {
        self.elementwise_new(Family::Add, Rhs::Vector(other), m)
    }

    pub fn add_assign(&mut self, other: &PimVector, m: u64) -> Result<()> {
        self.elementwise(Family::Add, Rhs::Vector(other), m, None)
    }

    pub fn add_scalar(&self, scalar: u64, m: u64) -> Result<PimVector> {
        self.elementwise_new(Family::Add, Rhs::Scalar(scalar), m)
    }

    pub fn add_scalar_assign(&mut self, scalar: u64, m: u64) -> Result<()> {
        self.elementwise(Family::Add, Rhs::Scalar(scalar), m, None)
    }

    pub fn sub(&self, other: &PimVector, m: u64) -> Result<PimVector> {
        self.elementwise_new(Family::Sub, Rhs::Vector(other), m)
    }

    pub fn sub_assign(&mut self, other: &PimVector, m: u64) -> Result<()> {
        self.elementwise(Family::Sub, Rhs::Vector(other), m, None)
    }

    pub fn sub_scalar(&self, scalar: u64, m: u64) -> Result<PimVector> {
        self.elementwise_new(Family::Sub, Rhs::Scalar(scalar), m)
    }

    pub fn sub_scalar_assign(&mut self, scalar: u64, m: u64) -> Result<()> {
        self.elementwise(Family::Sub, Rhs::Scalar(scalar), m, None)
    }

    pub fn mul(&self, other: &PimVector, m: u64) -> Result<PimVector> {
        self.elementwise_new(Family::Mul, Rhs::Vector(other), m)
    }

    pub fn mul_assign(&mut self, other: &PimVector, m: u64) -> Result<()> {
        self.elementwise(Family::Mul, Rhs::Vector(other), m, None)
    }

    pub fn mul_scalar(&self, scalar: u64, m: u64) -> Result<PimVector> {
        self.elementwise_new(Family::Mul, Rhs::Scalar(scalar), m)
    }

    pub fn mul_scalar_assign(&mut self, scalar: u64, m: u64) -> Result<()> {
        self.elementwise(Family::Mul, Rhs::Scalar(scalar), m, None)
    }

    /// Re-encodes the residues from `m` to `new_m` in place.
    pub fn switch_modulus(&mut self, m: u64, new_m: u64) -> Result<()> {
        self.mod_ops(ModKernel::SwitchModulus, m, new_m, 0, None)
    }

    /// Residues under `new_m`; a target of 2 gives the parity of the centered lift.
    pub fn modulus(&self, m: u64, new_m: u64) -> Result<PimVector> {
        self.mod_ops_new(ModKernel::ModNormal, m, new_m, 0)
    }

    pub fn modulus_assign(&mut self, m: u64, new_m: u64) -> Result<()> {
        self.mod_ops(ModKernel::ModEq, m, new_m, 0, None)
    }

    pub fn mod_by_two(&self, m: u64) -> Result<PimVector> {
        self.mod_ops_new(ModKernel::ModByTwo, m, 0, 0)
    }

    pub fn mod_by_two_assign(&mut self, m: u64) -> Result<()> {
        self.mod_ops(ModKernel::ModByTwoEq, m, 0, 0, None)
    }

    pub fn mod_exp(&self, exponent: u64, m: u64) -> Result<PimVector> {
        self.mod_ops_new(ModKernel::ModExp, m, exponent, 0)
    }

    pub fn mod_exp_assign(&mut self, exponent: u64, m: u64) -> Result<()> {
        self.mod_ops(ModKernel::ModExpEq, m, exponent, 0, None)
    }

    /// Elementwise inverses; residues sharing a factor with `m` map to 0.
    pub fn mod_inverse(&self, m: u64) -> Result<PimVector> {
        self.mod_ops_new(ModKernel::ModInverse, m, 0, 0)
    }

    pub fn mod_inverse_assign(&mut self, m: u64) -> Result<()> {
        self.mod_ops(ModKernel::ModInverseEq, m, 0, 0, None)
    }

    /// `round(x * p / q)` on centered lifts.
    pub fn multiply_and_round(&self, m: u64, p: u64, q: u64) -> Result<PimVector> {
        self.mod_ops_new(ModKernel::MultiplyAndRound, m, p, q)
    }

    pub fn multiply_and_round_assign(&mut self, m: u64, p: u64, q: u64) -> Result<()> {
        self.mod_ops(ModKernel::MultiplyAndRoundEq, m, p, q, None)
    }

    /// `round(x / q)` on centered lifts, ties rounded up.
    pub fn divide_and_round(&self, m: u64, q: u64) -> Result<PimVector> {
        self.mod_ops_new(ModKernel::DivideAndRound, m, q, 0)
    }

    pub fn divide_and_round_assign(&mut self, m: u64, q: u64) -> Result<()> {
        self.mod_ops(ModKernel::DivideAndRoundEq, m, q, 0, None)
    }
}

impl Drop for PimVector {
    fn drop(&mut self) {
        match self.handle.lock() {
            Ok(mut pim) => {
                if let Err(err) = pim.deallocate(self.address) {
                    warn!(address = self.address, error = %err, "failed to release PIM vector");
                }
            }
            Err(_) => warn!(address = self.address, "PIM manager poisoned, vector leaked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arith::{mod_add, mod_exp, mod_inverse, mod_mul, mod_sub};
    use crate::config::PimConfig;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha20Rng;

    const M: u64 = 1073692673;

    fn handle() -> PimHandle {
        PimManager::new(PimConfig::default().with_units(4).with_tasklets(4))
            .unwrap()
            .into_handle()
    }

    fn random(len: usize, seed: u64) -> Vec<u64> {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        (0..len).map(|_| rng.gen_range(0..M)).collect()
    }

    #[test]
    fn test_elementwise_ops_match_host() {
        let pim = handle();
        let (a, b) = (random(256, 1), random(256, 2));
        let va = PimVector::from_values(&pim, &a).unwrap();
        let vb = PimVector::from_values(&pim, &b).unwrap();
        assert_eq!(va.sync().unwrap(), a);

        let cases: [(fn(u64, u64, u64) -> u64, PimVector); 3] = [
            (mod_add, va.add(&vb, M).unwrap()),
            (mod_sub, va.sub(&vb, M).unwrap()),
            (mod_mul, va.mul(&vb, M).unwrap()),
        ];
        for (f, result) in &cases {
            let expected: Vec<u64> = a.iter().zip(&b).map(|(&x, &y)| f(x, y, M)).collect();
            assert_eq!(result.to_vec().unwrap(), expected);
        }
        // operands are untouched by out-of-place ops
        assert_eq!(va.sync().unwrap(), a);
    }

    #[test]
    fn test_in_place_and_scalar_ops() {
        let pim = handle();
        let (a, b) = (random(64, 3), random(64, 4));
        let mut va = PimVector::from_values(&pim, &a).unwrap();
        let vb = PimVector::from_values(&pim, &b).unwrap();

        va.mul_assign(&vb, M).unwrap();
        va.add_scalar_assign(M + 5, M).unwrap();
        let expected: Vec<u64> = a
            .iter()
            .zip(&b)
            .map(|(&x, &y)| mod_add(mod_mul(x, y, M), 5, M))
            .collect();
        assert_eq!(va.sync().unwrap(), expected);

        let scaled = vb.mul_scalar(3, M).unwrap();
        let expected: Vec<u64> = b.iter().map(|&y| mod_mul(y, 3, M)).collect();
        assert_eq!(scaled.sync().unwrap(), expected);
        let shifted = vb.sub_scalar(1, M).unwrap();
        assert_eq!(shifted.sync().unwrap()[0], mod_sub(b[0], 1, M));
    }

    #[test]
    fn test_mod_ops() {
        let pim = handle();
        let a = random(32, 5);
        let v = PimVector::from_values(&pim, &a).unwrap();

        let cubes = v.mod_exp(3, M).unwrap();
        assert_eq!(
            cubes.sync().unwrap(),
            a.iter().map(|&x| mod_exp(x, 3, M)).collect::<Vec<_>>()
        );
        // exponents at or above the modulus are reduced by it first
        assert_eq!(v.mod_exp(M + 3, M).unwrap().sync().unwrap(), cubes.sync().unwrap());
        let mut bases = PimVector::from_values(&pim, &[3, 3, 2, 0]).unwrap();
        bases.mod_exp_assign(100, 97).unwrap();
        assert_eq!(bases.sync().unwrap(), vec![27, 27, 8, 0]);
        let mut inverses = v.mod_inverse(M).unwrap();
        assert_eq!(
            inverses.sync().unwrap(),
            a.iter().map(|&x| mod_inverse(x, M)).collect::<Vec<_>>()
        );
        inverses.mul_assign(&v, M).unwrap();
        assert!(inverses.sync().unwrap().iter().all(|&x| x == 1));

        let parity = v.mod_by_two(M).unwrap();
        assert_eq!(parity.sync().unwrap(), v.modulus(M, 2).unwrap().sync().unwrap());

        let mut small = PimVector::from_values(&pim, &[1, 2, M - 1, M - 2]).unwrap();
        small.switch_modulus(M, 97).unwrap();
        assert_eq!(small.sync().unwrap(), vec![1, 2, 96, 95]);
        small.divide_and_round_assign(97, 2).unwrap();
        assert_eq!(small.sync().unwrap(), vec![1, 1, 96, 96]);
    }

    #[test]
    fn test_drop_releases_device_memory() {
        let pim = handle();
        let before = pim.lock().unwrap().memory_status();
        {
            let v = PimVector::zeroed(&pim, 16).unwrap();
            assert_eq!(v.sync().unwrap(), vec![0; 16]);
            assert_ne!(pim.lock().unwrap().memory_status(), before);
        }
        assert_eq!(pim.lock().unwrap().memory_status(), before);
    }

    #[test]
    fn test_shape_errors() {
        let pim = handle();
        assert!(matches!(
            PimVector::from_values(&pim, &[1, 2, 3]),
            Err(PimError::UnevenPartition { .. })
        ));
        let a = PimVector::zeroed(&pim, 8).unwrap();
        let b = PimVector::zeroed(&pim, 4).unwrap();
        assert!(matches!(a.add(&b, M), Err(PimError::ShapeMismatch(_))));
        let other = PimVector::zeroed(&handle(), 8).unwrap();
        assert!(a.mul(&other, M).is_err());
        assert!(matches!(a.add_scalar(1, 1), Err(PimError::InvalidModulus { .. })));
    }

    #[test]
    fn test_from_residues_rejects_unreduced_values() {
        let pim = handle();
        assert!(matches!(
            PimVector::from_residues(&pim, &[u64::MAX; 4], 97),
            Err(PimError::InvalidParameters(_))
        ));
        assert!(PimVector::from_residues(&pim, &[1, 2, 96, 97], 97).is_err());
        // refused before anything is reserved
        assert!(pim.lock().unwrap().memory_status().contains("unit 0: 0/"));

        let v = PimVector::from_residues(&pim, &[1, 2, 95, 96], 97).unwrap();
        assert_eq!(v.add_scalar(1, 97).unwrap().sync().unwrap(), vec![2, 3, 96, 0]);
    }
}
