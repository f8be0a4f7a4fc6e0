/// Double-CRT polynomials over `Z_Q[X]/(X^N + 1)`.
///
/// `Q` is a product of word-sized NTT-friendly primes; a polynomial keeps one
/// tower of `N` residues per prime. Towers are independent, so format
/// switches run tower-parallel and arithmetic can be offloaded tower by tower
/// to a [`PimManager`](crate::pim::PimManager) attached with
/// [`DcrtPoly::attach_pim`].
///
/// Key Features:
/// - Parameter sets from explicit moduli or generated prime chains
/// - Coefficient and evaluation formats with negacyclic NTT between them
/// - Optional PIM offload with transparent host fallback (`ops`)
use std::sync::Arc;

use num_bigint::BigUint;
use num_traits::One;
use rand::Rng;
use rayon::prelude::*;
use tracing::debug;

use crate::arith::{
    check_modulus, forward_transform_to_bit_reverse_in_place,
    inverse_transform_from_bit_reverse_in_place, RootTables,
};
use crate::error::{PimError, Result};
use crate::pim::PimHandle;

pub mod ops;
pub mod primes;

pub use primes::{first_prime, is_prime, previous_prime, root_of_unity};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Format {
    Coefficient,
    Evaluation,
}

impl Format {
    pub fn name(self) -> &'static str {
        match self {
            Self::Coefficient => "coefficient",
            Self::Evaluation => "evaluation",
        }
    }
}

/// Residues of one polynomial modulo a single prime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tower {
    pub modulus: u64,
    pub values: Vec<u64>,
}

impl Tower {
    pub fn zero(modulus: u64, len: usize) -> Self {
        Self {
            modulus,
            values: vec![0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Ring dimension, prime chain and the NTT tables of every prime.
#[derive(Debug)]
pub struct DcrtParams {
    ring_dimension: usize,
    moduli: Vec<u64>,
    tables: Vec<RootTables>,
    composite: BigUint,
}

impl DcrtParams {
    /// Builds parameters for explicit moduli.
    ///
    /// # Arguments
    /// * `ring_dimension` - `N`, a power of two
    /// * `moduli` - Distinct primes with `2N | q - 1`, each below `2^60`
    ///
    /// # Returns
    /// * `Result<Self>` - Parameters with a primitive `2N`-th root per modulus
    pub fn new(ring_dimension: usize, moduli: &[u64]) -> Result<Self> {
        if moduli.is_empty() {
            return Err(PimError::InvalidParameters("no moduli".to_string()));
        }
        let order = 2 * ring_dimension as u64;
        let mut tables = Vec::with_capacity(moduli.len());
        for (i, &q) in moduli.iter().enumerate() {
            check_modulus(q)?;
            if !is_prime(q) {
                return Err(PimError::InvalidModulus { modulus: q });
            }
            if moduli[..i].contains(&q) {
                return Err(PimError::InvalidParameters(format!("modulus {} repeated", q)));
            }
            let root = root_of_unity(order, q)?;
            tables.push(RootTables::new(root, ring_dimension, q)?);
        }
        let composite = moduli
            .iter()
            .fold(BigUint::one(), |acc, &q| acc * BigUint::from(q));
        debug!(ring_dimension, towers = moduli.len(), bits = composite.bits(), "built DCRT parameters");
        Ok(Self {
            ring_dimension,
            moduli: moduli.to_vec(),
            tables,
            composite,
        })
    }

    /// Picks `towers` primes of `bits` bits, largest first, all `1 (mod 2N)`.
    pub fn generate(ring_dimension: usize, towers: usize, bits: u32) -> Result<Self> {
        let order = 2 * ring_dimension as u64;
        let mut moduli = Vec::with_capacity(towers);
        let mut q = first_prime(bits, order)?;
        for i in 0..towers {
            if i > 0 {
                q = previous_prime(q, order)?;
            }
            moduli.push(q);
        }
        Self::new(ring_dimension, &moduli)
    }

    pub fn ring_dimension(&self) -> usize {
        self.ring_dimension
    }

    pub fn moduli(&self) -> &[u64] {
        &self.moduli
    }

    pub fn tower_count(&self) -> usize {
        self.moduli.len()
    }

    pub fn tables(&self, tower: usize) -> Option<&RootTables> {
        self.tables.get(tower)
    }

    /// The product of all moduli.
    pub fn composite_modulus(&self) -> &BigUint {
        &self.composite
    }
}

/// Manager attached to a polynomial, with the units-per-tower split.
#[derive(Clone, Debug)]
pub struct PimOffload {
    pub handle: PimHandle,
    /// `None` picks the largest power-of-two split the pool can serve.
    pub split: Option<usize>,
}

#[derive(Clone, Debug)]
pub struct DcrtPoly {
    params: Arc<DcrtParams>,
    towers: Vec<Tower>,
    format: Format,
    offload: Option<PimOffload>,
}

impl DcrtPoly {
    pub fn zero(params: &Arc<DcrtParams>, format: Format) -> Self {
        let towers = params
            .moduli
            .iter()
            .map(|&q| Tower::zero(q, params.ring_dimension))
            .collect();
        Self {
            params: Arc::clone(params),
            towers,
            format,
            offload: None,
        }
    }

    /// Wraps existing towers after checking them against `params`.
    pub fn from_towers(params: &Arc<DcrtParams>, towers: Vec<Tower>, format: Format) -> Result<Self> {
        if towers.len() != params.tower_count() {
            return Err(PimError::ShapeMismatch(format!(
                "{} towers for {} moduli",
                towers.len(),
                params.tower_count()
            )));
        }
        for (tower, &q) in towers.iter().zip(&params.moduli) {
            if tower.modulus != q || tower.len() != params.ring_dimension {
                return Err(PimError::ShapeMismatch(format!(
                    "tower of {} residues mod {}, expected {} mod {}",
                    tower.len(),
                    tower.modulus,
                    params.ring_dimension,
                    q
                )));
            }
            if let Some(v) = tower.values.iter().find(|&&v| v >= q) {
                return Err(PimError::InvalidParameters(format!(
                    "residue {} is not reduced mod {}",
                    v, q
                )));
            }
        }
        Ok(Self {
            params: Arc::clone(params),
            towers,
            format,
            offload: None,
        })
    }

    /// Uniform residues in every tower.
    pub fn random<R: Rng + ?Sized>(params: &Arc<DcrtParams>, format: Format, rng: &mut R) -> Self {
        let mut poly = Self::zero(params, format);
        for tower in poly.towers.iter_mut() {
            let q = tower.modulus;
            tower.values.iter_mut().for_each(|v| *v = rng.gen_range(0..q));
        }
        poly
    }

    pub fn params(&self) -> &Arc<DcrtParams> {
        &self.params
    }

    pub fn ring_dimension(&self) -> usize {
        self.params.ring_dimension
    }

    pub fn towers(&self) -> &[Tower] {
        &self.towers
    }

    pub fn towers_mut(&mut self) -> &mut [Tower] {
        &mut self.towers
    }

    pub fn tower(&self, index: usize) -> Option<&Tower> {
        self.towers.get(index)
    }

    pub fn format(&self) -> Format {
        self.format
    }

    /// Routes subsequent arithmetic to `handle`.
    pub fn attach_pim(&mut self, handle: PimHandle, split: Option<usize>) {
        self.offload = Some(PimOffload { handle, split });
    }

    pub fn detach_pim(&mut self) -> Option<PimOffload> {
        self.offload.take()
    }

    pub fn is_offloaded(&self) -> bool {
        self.offload.is_some()
    }

    pub fn offload(&self) -> Option<&PimOffload> {
        self.offload.as_ref()
    }

    /// Toggles between coefficient and evaluation format, one tower per task.
    pub fn switch_format(&mut self) -> Result<()> {
        let params = &self.params;
        match self.format {
            Format::Coefficient => self.towers.par_iter_mut().enumerate().try_for_each(|(i, t)| {
                forward_transform_to_bit_reverse_in_place(&mut t.values, &params.tables[i])
            })?,
            Format::Evaluation => self.towers.par_iter_mut().enumerate().try_for_each(|(i, t)| {
                inverse_transform_from_bit_reverse_in_place(&mut t.values, &params.tables[i])
            })?,
        }
        self.format = match self.format {
            Format::Coefficient => Format::Evaluation,
            Format::Evaluation => Format::Coefficient,
        };
        Ok(())
    }

    /// Switches to `format` if not already there.
    pub fn set_format(&mut self, format: Format) -> Result<()> {
        if self.format != format {
            self.switch_format()?;
        }
        Ok(())
    }
}
