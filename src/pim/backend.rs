/// Driver seam between the manager and a pool of units.
///
/// The manager speaks only in named transfers (`broadcast`, `scatter`,
/// `gather`), binary loads and synchronous launches. A backend turns those
/// into driver calls, or runs them in process as [`SimulatorBackend`] does.
use std::path::Path;

use rayon::prelude::*;

use super::kernel::KernelBinary;
use crate::config::{PimConfig, UnitRequest};
use crate::device::{DpuUnit, TaskletConfig};
use crate::error::{PimError, Result};

pub trait PimBackend: Send + std::fmt::Debug {
    /// Acquires units; returns how many were granted.
    fn allocate(&mut self, request: UnitRequest, profile: &str, config: &PimConfig) -> Result<usize>;

    fn unit_count(&self) -> usize;

    /// Loads the binary at `path` into every unit.
    fn load(&mut self, path: &Path) -> Result<()>;

    /// Writes the same bytes to `target` on every unit.
    fn broadcast(&mut self, target: &str, offset: usize, bytes: &[u8]) -> Result<()>;

    /// Writes `buffers[i]` to `target` on unit `i`.
    fn scatter(&mut self, target: &str, offset: usize, buffers: &[Vec<u8>]) -> Result<()>;

    /// Reads `len` bytes of `target` from every unit.
    fn gather(&mut self, target: &str, offset: usize, len: usize) -> Result<Vec<Vec<u8>>>;

    /// Runs the loaded binary on all units and blocks until every unit is done.
    fn launch(&mut self) -> Result<()>;

    /// Drains the per-unit logs.
    fn read_logs(&mut self) -> Vec<String>;
}

/// Parses a `key=value,key=value` profile and checks the backend it names.
fn check_profile(profile: &str) -> Result<()> {
    for entry in profile.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (key, value) = entry.split_once('=').ok_or_else(|| {
            PimError::UnitAllocation(format!("malformed profile entry `{}`", entry))
        })?;
        if key.trim() == "backend" && value.trim() != "simulator" {
            return Err(PimError::UnitAllocation(format!(
                "backend `{}` is not available in this build",
                value.trim()
            )));
        }
    }
    Ok(())
}

/// In-process units. Each launch runs units in parallel on the rayon pool.
#[derive(Debug, Default)]
pub struct SimulatorBackend {
    units: Vec<DpuUnit>,
    loaded: Option<KernelBinary>,
}

impl SimulatorBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unit(&self, index: usize) -> Option<&DpuUnit> {
        self.units.get(index)
    }

    pub fn loaded(&self) -> Option<KernelBinary> {
        self.loaded
    }

    fn transfer_error(target: &str, unit: usize, reason: impl std::fmt::Display) -> PimError {
        PimError::Transfer {
            target: target.to_string(),
            reason: format!("unit {}: {}", unit, reason),
        }
    }
}

impl PimBackend for SimulatorBackend {
    fn allocate(&mut self, request: UnitRequest, profile: &str, config: &PimConfig) -> Result<usize> {
        check_profile(profile)?;
        let count = match request {
            UnitRequest::All => config.simulated_pool,
            UnitRequest::Count(n) if n <= config.simulated_pool => n,
            UnitRequest::Count(n) => {
                return Err(PimError::UnitAllocation(format!(
                    "requested {} units, the simulator offers {}",
                    n, config.simulated_pool
                )))
            }
        };
        if count == 0 {
            return Err(PimError::UnitAllocation("no units available".to_string()));
        }
        let shape = TaskletConfig::from_config(config);
        self.units = (0..count)
            .map(|id| DpuUnit::new(id, config.mram_size, config.wram_heap_size, shape))
            .collect();
        self.loaded = None;
        Ok(count)
    }

    fn unit_count(&self) -> usize {
        self.units.len()
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        let binary =
            KernelBinary::from_path(path).ok_or_else(|| PimError::UnknownBinary(path.to_path_buf()))?;
        let program = binary.program();
        for unit in self.units.iter_mut() {
            unit.load(program.clone());
        }
        self.loaded = Some(binary);
        Ok(())
    }

    fn broadcast(&mut self, target: &str, offset: usize, bytes: &[u8]) -> Result<()> {
        for unit in self.units.iter_mut() {
            unit.write_symbol(target, offset, bytes)
                .map_err(|fault| Self::transfer_error(target, unit.id(), fault))?;
        }
        Ok(())
    }

    fn scatter(&mut self, target: &str, offset: usize, buffers: &[Vec<u8>]) -> Result<()> {
        if buffers.len() != self.units.len() {
            return Err(PimError::Transfer {
                target: target.to_string(),
                reason: format!("{} buffers for {} units", buffers.len(), self.units.len()),
            });
        }
        for (unit, buffer) in self.units.iter_mut().zip(buffers) {
            unit.write_symbol(target, offset, buffer)
                .map_err(|fault| Self::transfer_error(target, unit.id(), fault))?;
        }
        Ok(())
    }

    fn gather(&mut self, target: &str, offset: usize, len: usize) -> Result<Vec<Vec<u8>>> {
        self.units
            .iter()
            .map(|unit| {
                unit.read_symbol(target, offset, len)
                    .map_err(|fault| Self::transfer_error(target, unit.id(), fault))
            })
            .collect()
    }

    fn launch(&mut self) -> Result<()> {
        if self.loaded.is_none() {
            return Err(PimError::NoKernelLoaded);
        }
        self.units.par_iter_mut().try_for_each(|unit| {
            unit.launch().map_err(|source| PimError::Execution {
                unit: unit.id(),
                source,
            })
        })
    }

    fn read_logs(&mut self) -> Vec<String> {
        self.units.iter_mut().map(|unit| unit.take_log()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::params::{DPU_MRAM_HEAP_POINTER_NAME, MRAM_MODULUS};

    fn config() -> PimConfig {
        PimConfig::default().with_simulated_pool(8)
    }

    #[test]
    fn test_allocation_requests() {
        let mut backend = SimulatorBackend::new();
        assert_eq!(backend.allocate(UnitRequest::Count(3), "backend=simulator", &config()).unwrap(), 3);
        assert_eq!(backend.allocate(UnitRequest::All, "", &config()).unwrap(), 8);
        assert!(matches!(
            backend.allocate(UnitRequest::Count(9), "", &config()),
            Err(PimError::UnitAllocation(_))
        ));
        assert!(backend.allocate(UnitRequest::Count(1), "backend=hw", &config()).is_err());
        assert!(backend.allocate(UnitRequest::Count(1), "nrThreads", &config()).is_err());
    }

    #[test]
    fn test_transfers_need_declared_symbols() {
        let mut backend = SimulatorBackend::new();
        backend.allocate(UnitRequest::Count(2), "", &config()).unwrap();
        assert!(matches!(backend.launch(), Err(PimError::NoKernelLoaded)));
        assert!(matches!(
            backend.broadcast(MRAM_MODULUS, 0, &[0u8; 8]),
            Err(PimError::Transfer { .. })
        ));
        assert!(matches!(
            backend.load(Path::new("dpu/not-a-kernel")),
            Err(PimError::UnknownBinary(_))
        ));

        backend.load(&KernelBinary::DcrtAdd.path(Path::new("dpu"))).unwrap();
        backend.broadcast(MRAM_MODULUS, 0, &97u64.to_le_bytes()).unwrap();
        backend
            .scatter(DPU_MRAM_HEAP_POINTER_NAME, 0, &[vec![1u8; 8], vec![2u8; 8]])
            .unwrap();
        let back = backend.gather(DPU_MRAM_HEAP_POINTER_NAME, 0, 8).unwrap();
        assert_eq!(back, vec![vec![1u8; 8], vec![2u8; 8]]);
        assert!(backend.scatter(DPU_MRAM_HEAP_POINTER_NAME, 0, &[vec![1u8; 8]]).is_err());
    }

    #[test]
    fn test_failing_unit_is_reported() {
        let mut backend = SimulatorBackend::new();
        backend.allocate(UnitRequest::Count(2), "", &config()).unwrap();
        backend.load(&KernelBinary::DcrtAdd.path(Path::new("dpu"))).unwrap();
        // unit 1 keeps the zeroed modulus
        backend
            .scatter(MRAM_MODULUS, 0, &[97u64.to_le_bytes().to_vec(), vec![0u8; 8]])
            .unwrap();
        match backend.launch() {
            Err(PimError::Execution { unit, .. }) => assert_eq!(unit, 1),
            other => panic!("unexpected launch outcome: {:?}", other),
        }
    }
}
