/// Tower-major partition of double-CRT data across units.
///
/// Tower `t` is carried by units `t * split .. (t + 1) * split`; each of those
/// units holds `split_count = tower_len / split` consecutive residues.
/// [`TowerPartition::locate`] is the only place that maps a coefficient to a
/// unit slot. Staging and scattering both go through it, so the two
/// directions cannot drift apart.
use crate::device::params::RESIDUE_BYTES;
use crate::error::{PimError, Result};

/// Position of one residue in the per-unit buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slot {
    pub unit: usize,
    pub offset: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TowerPartition {
    towers: usize,
    tower_len: usize,
    split: usize,
    split_count: usize,
}

impl TowerPartition {
    /// Validates a partition of `towers` towers of `tower_len` residues with
    /// `split` units per tower. Uneven splits are rejected.
    pub fn new(towers: usize, tower_len: usize, split: usize) -> Result<Self> {
        if towers == 0 || tower_len == 0 || split == 0 {
            return Err(PimError::InvalidParameters(format!(
                "empty partition: {} towers of length {} with split {}",
                towers, tower_len, split
            )));
        }
        if tower_len % split != 0 {
            return Err(PimError::UnevenPartition {
                tower_len,
                split_factor: split,
            });
        }
        Ok(Self {
            towers,
            tower_len,
            split,
            split_count: tower_len / split,
        })
    }

    pub fn towers(&self) -> usize {
        self.towers
    }

    pub fn tower_len(&self) -> usize {
        self.tower_len
    }

    pub fn split(&self) -> usize {
        self.split
    }

    /// Residues per unit.
    pub fn split_count(&self) -> usize {
        self.split_count
    }

    /// Bytes of one operand on one unit; operand B starts at this offset.
    pub fn operand_bytes(&self) -> usize {
        self.split_count * RESIDUE_BYTES
    }

    pub fn units_required(&self) -> usize {
        self.towers * self.split
    }

    #[inline]
    pub fn locate(&self, tower: usize, coeff: usize) -> Slot {
        Slot {
            unit: tower * self.split + coeff / self.split_count,
            offset: coeff % self.split_count,
        }
    }

    /// Tower carried by `unit`, or `None` for an idle unit.
    pub fn unit_tower(&self, unit: usize) -> Option<usize> {
        (unit < self.units_required()).then(|| unit / self.split)
    }

    fn check_units(&self, unit_count: usize) -> Result<()> {
        if unit_count < self.units_required() {
            return Err(PimError::InsufficientUnits {
                required: self.units_required(),
                available: unit_count,
            });
        }
        Ok(())
    }

    fn check_towers<T: AsRef<[u64]>>(&self, towers: &[T]) -> Result<()> {
        if towers.len() != self.towers {
            return Err(PimError::ShapeMismatch(format!(
                "expected {} towers, got {}",
                self.towers,
                towers.len()
            )));
        }
        if let Some(bad) = towers.iter().find(|t| t.as_ref().len() != self.tower_len) {
            return Err(PimError::ShapeMismatch(format!(
                "expected towers of length {}, got {}",
                self.tower_len,
                bad.as_ref().len()
            )));
        }
        Ok(())
    }

    /// Cuts `towers` into one buffer per unit. Idle units get zeros.
    pub fn stage<T: AsRef<[u64]>>(&self, towers: &[T], unit_count: usize) -> Result<Vec<Vec<u64>>> {
        self.check_units(unit_count)?;
        self.check_towers(towers)?;
        let mut buffers = vec![vec![0u64; self.split_count]; unit_count];
        for (t, tower) in towers.iter().enumerate() {
            for (i, &value) in tower.as_ref().iter().enumerate() {
                let slot = self.locate(t, i);
                buffers[slot.unit][slot.offset] = value;
            }
        }
        Ok(buffers)
    }

    /// Writes per-unit results back into tower order.
    pub fn scatter<T: AsMut<[u64]>>(&self, results: &[Vec<u64>], towers: &mut [T]) -> Result<()> {
        self.check_units(results.len())?;
        if let Some(short) = results[..self.units_required()]
            .iter()
            .find(|r| r.len() < self.split_count)
        {
            return Err(PimError::ShapeMismatch(format!(
                "unit result of {} residues, expected {}",
                short.len(),
                self.split_count
            )));
        }
        if towers.len() != self.towers {
            return Err(PimError::ShapeMismatch(format!(
                "expected {} destination towers, got {}",
                self.towers,
                towers.len()
            )));
        }
        for (t, tower) in towers.iter_mut().enumerate() {
            let tower = tower.as_mut();
            if tower.len() != self.tower_len {
                return Err(PimError::ShapeMismatch(format!(
                    "expected destination tower of length {}, got {}",
                    self.tower_len,
                    tower.len()
                )));
            }
            for (i, value) in tower.iter_mut().enumerate() {
                let slot = self.locate(t, i);
                *value = results[slot.unit][slot.offset];
            }
        }
        Ok(())
    }

    /// Modulus each unit runs under. Idle units reuse the first tower's.
    pub fn unit_moduli(&self, moduli: &[u64], unit_count: usize) -> Result<Vec<u64>> {
        self.check_units(unit_count)?;
        if moduli.len() != self.towers {
            return Err(PimError::ShapeMismatch(format!(
                "expected {} moduli, got {}",
                self.towers,
                moduli.len()
            )));
        }
        Ok((0..unit_count)
            .map(|unit| moduli[self.unit_tower(unit).unwrap_or(0)])
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_tower_major_layout() {
        let partition = TowerPartition::new(2, 8, 2).unwrap();
        assert_eq!(partition.split_count(), 4);
        assert_eq!(partition.operand_bytes(), 32);
        assert_eq!(partition.locate(0, 5), Slot { unit: 1, offset: 1 });
        assert_eq!(partition.locate(1, 0), Slot { unit: 2, offset: 0 });
        assert_eq!(partition.locate(1, 7), Slot { unit: 3, offset: 3 });

        let towers = vec![(0..8).collect::<Vec<u64>>(), (100..108).collect()];
        let buffers = partition.stage(&towers, 5).unwrap();
        assert_eq!(buffers[0], vec![0, 1, 2, 3]);
        assert_eq!(buffers[3], vec![104, 105, 106, 107]);
        assert_eq!(buffers[4], vec![0, 0, 0, 0]);
        assert_eq!(partition.unit_moduli(&[17, 19], 5).unwrap(), vec![17, 17, 19, 19, 17]);
    }

    #[test]
    fn test_rejects_bad_shapes() {
        assert!(matches!(
            TowerPartition::new(2, 10, 4),
            Err(PimError::UnevenPartition {
                tower_len: 10,
                split_factor: 4
            })
        ));
        assert!(TowerPartition::new(0, 8, 2).is_err());

        let partition = TowerPartition::new(2, 8, 2).unwrap();
        let towers = vec![vec![0u64; 8], vec![0u64; 8]];
        assert!(matches!(
            partition.stage(&towers, 3),
            Err(PimError::InsufficientUnits {
                required: 4,
                available: 3
            })
        ));
        assert!(partition.stage(&[vec![0u64; 8]], 4).is_err());
        assert!(partition.stage(&[vec![0u64; 8], vec![0u64; 6]], 4).is_err());
    }

    proptest! {
        #[test]
        fn prop_stage_then_scatter_is_identity(
            towers in 1usize..4,
            log_split in 0u32..4,
            split_count in 1usize..17,
            extra_units in 0usize..3,
            seed in any::<u64>(),
        ) {
            let split = 1usize << log_split;
            let tower_len = split * split_count;
            let partition = TowerPartition::new(towers, tower_len, split).unwrap();
            let data: Vec<Vec<u64>> = (0..towers)
                .map(|t| (0..tower_len).map(|i| seed ^ ((t * tower_len + i) as u64)).collect())
                .collect();

            let buffers = partition.stage(&data, partition.units_required() + extra_units).unwrap();
            let mut out = vec![vec![0u64; tower_len]; towers];
            partition.scatter(&buffers, &mut out).unwrap();
            prop_assert_eq!(out, data);
        }
    }
}
