/// The PIM execution manager.
///
/// A manager owns one allocated pool of units for its whole lifetime. It
/// loads device binaries, stages double-CRT operands across units, moves
/// them in bulk, launches synchronously and scatters the results back in the
/// same tower-major order used for staging.
///
/// Key Features:
/// - Unit allocation once at construction, followed by a boot program
/// - Tower partitioning through [`TowerPartition`] (staging and scatter share it)
/// - One bulk transfer per operand rather than per-unit round trips
/// - Per-unit block allocators for device-resident vectors
/// - Optional append-only execution log with every unit's device output
///
/// Every failure is logged with `tracing` at the manager boundary and returned
/// to the caller. Nothing is retried.
use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info};

use super::backend::{PimBackend, SimulatorBackend};
use super::kernel::KernelBinary;
use super::partition::TowerPartition;
use crate::config::PimConfig;
use crate::device::params::{
    decode_residues, encode_residues, ElementwiseMeta, ModOpsMeta, DATA_COPIED_IN_BYTES,
    DPU_MRAM_HEAP_POINTER_NAME, META, MRAM_MODULUS, RESIDUE_BYTES,
};
use crate::error::{PimError, Result};
use crate::memory::{DpuMemory, BLOCK_SIZE};
use crate::poly::{DcrtPoly, Tower};

/// Shared handle passed to every component that offloads work.
pub type PimHandle = Arc<Mutex<PimManager>>;

/// How [`PimManager::copy_to_pim`] distributes host data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transfer {
    /// Split the data evenly, one contiguous share per unit.
    Scatter,
    /// Send the full data to every unit.
    Broadcast,
}

/// Operands cut into per-unit buffers, ready for transfer.
#[derive(Clone, Debug)]
pub struct StagedBatch {
    partition: TowerPartition,
    moduli: Vec<u64>,
    tower_moduli: Vec<u64>,
    a: Vec<Vec<u64>>,
    b: Vec<Vec<u64>>,
}

impl StagedBatch {
    pub fn partition(&self) -> &TowerPartition {
        &self.partition
    }

    /// Modulus assigned to each unit.
    pub fn unit_moduli(&self) -> &[u64] {
        &self.moduli
    }
}

/// Per-unit results, indexed `[unit][local_index]`.
#[derive(Clone, Debug)]
pub struct UnitResults {
    partition: TowerPartition,
    tower_moduli: Vec<u64>,
    data: Vec<Vec<u64>>,
}

impl UnitResults {
    pub fn partition(&self) -> &TowerPartition {
        &self.partition
    }

    /// Modulus of each result tower, in staging order.
    pub fn tower_moduli(&self) -> &[u64] {
        &self.tower_moduli
    }

    pub fn unit(&self, index: usize) -> Option<&[u64]> {
        self.data.get(index).map(|v| v.as_slice())
    }
}

#[derive(Debug)]
pub struct PimManager<B: PimBackend = SimulatorBackend> {
    backend: B,
    config: PimConfig,
    memories: Vec<DpuMemory>,
    loaded: Option<PathBuf>,
    exec_log: Option<File>,
    last_logs: Vec<String>,
    launches: u64,
}

fn logged<T>(operation: &str, result: Result<T>) -> Result<T> {
    if let Err(err) = &result {
        error!(operation, error = %err, "PIM operation failed");
    }
    result
}

impl PimManager<SimulatorBackend> {
    /// Allocates units on the in-process simulator.
    pub fn new(config: PimConfig) -> Result<Self> {
        Self::with_backend(SimulatorBackend::new(), config)
    }

    /// Wraps the manager into the shared handle type.
    pub fn into_handle(self) -> PimHandle {
        Arc::new(Mutex::new(self))
    }
}

impl<B: PimBackend> PimManager<B> {
    /// Allocates units on `backend` and boots them.
    ///
    /// # Arguments
    /// * `backend` - Driver for the unit pool
    /// * `config` - Unit request, profile, binary directory and device shape
    ///
    /// # Returns
    /// * `Result<Self>` - The manager, or the allocation/boot error
    pub fn with_backend(mut backend: B, config: PimConfig) -> Result<Self> {
        logged("validate config", config.validate())?;
        let granted = logged(
            "allocate units",
            backend.allocate(config.units, &config.profile, &config),
        )?;
        info!(units = granted, profile = %config.profile, "allocated PIM units");

        let exec_log = match &config.log_file {
            Some(path) => Some(logged(
                "open execution log",
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(PimError::from),
            )?),
            None => None,
        };

        let memories = (0..granted)
            .map(|unit| DpuMemory::with_geometry(unit, config.mram_size, BLOCK_SIZE))
            .collect();

        let mut manager = Self {
            backend,
            config,
            memories,
            loaded: None,
            exec_log,
            last_logs: Vec::new(),
            launches: 0,
        };
        manager.load_kernel(KernelBinary::Boot)?;
        manager.execute()?;
        Ok(manager)
    }

    pub fn unit_count(&self) -> usize {
        self.backend.unit_count()
    }

    pub fn config(&self) -> &PimConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Loads a binary into every unit, replacing the current one.
    pub fn load_binary(&mut self, path: &Path) -> Result<()> {
        logged("load binary", self.backend.load(path))?;
        info!(binary = %path.display(), units = self.unit_count(), "loaded PIM binary");
        self.loaded = Some(path.to_path_buf());
        Ok(())
    }

    pub fn load_kernel(&mut self, kernel: KernelBinary) -> Result<()> {
        let path = kernel.path(&self.config.binary_dir);
        self.load_binary(&path)
    }

    pub fn loaded_binary(&self) -> Option<&Path> {
        self.loaded.as_deref()
    }

    /// Partitions two same-shaped tower lists with `split` units per tower.
    pub fn prepare_towers(&self, a: &[Tower], b: &[Tower], split: usize) -> Result<StagedBatch> {
        logged("prepare towers", self.stage(a, b, split))
    }

    fn stage(&self, a: &[Tower], b: &[Tower], split: usize) -> Result<StagedBatch> {
        if a.len() != b.len() {
            return Err(PimError::ShapeMismatch(format!(
                "operands have {} and {} towers",
                a.len(),
                b.len()
            )));
        }
        if let Some(t) = a.iter().zip(b).position(|(x, y)| x.modulus != y.modulus) {
            return Err(PimError::ShapeMismatch(format!(
                "tower {} has moduli {} and {}",
                t, a[t].modulus, b[t].modulus
            )));
        }
        let tower_len = a.first().map_or(0, |t| t.values.len());
        let partition = TowerPartition::new(a.len(), tower_len, split)?;
        let units = self.unit_count();
        let tower_moduli: Vec<u64> = a.iter().map(|t| t.modulus).collect();
        let a_towers: Vec<&[u64]> = a.iter().map(|t| t.values.as_slice()).collect();
        let b_towers: Vec<&[u64]> = b.iter().map(|t| t.values.as_slice()).collect();

        debug!(
            towers = partition.towers(),
            tower_len,
            split,
            split_count = partition.split_count(),
            units,
            "staged tower batch"
        );
        Ok(StagedBatch {
            moduli: partition.unit_moduli(&tower_moduli, units)?,
            a: partition.stage(&a_towers, units)?,
            b: partition.stage(&b_towers, units)?,
            tower_moduli,
            partition,
        })
    }

    /// Sends moduli, operand length and both operands to every unit.
    ///
    /// A tower kernel must already be loaded, since the WRAM symbols written
    /// here belong to it.
    pub fn copy_batch_to_units(&mut self, batch: &StagedBatch) -> Result<()> {
        let result = self.push_batch(batch);
        logged("copy batch to units", result)
    }

    fn push_batch(&mut self, batch: &StagedBatch) -> Result<()> {
        let operand_bytes = batch.partition.operand_bytes();
        // Tower batches stage at MRAM offset 0 and must not clobber live vectors.
        if let Some(memory) = self
            .memories
            .iter()
            .find(|m| !m.is_range_free(0, 2 * operand_bytes))
        {
            return Err(PimError::DeviceMemoryExhausted {
                unit: memory.unit(),
                requested: 2 * operand_bytes,
            });
        }
        let bytes_header = u32::try_from(operand_bytes).map_err(|_| {
            PimError::InvalidParameters(format!("{} operand bytes exceed a u32", operand_bytes))
        })?;

        let moduli: Vec<Vec<u8>> = batch.moduli.iter().map(|m| m.to_le_bytes().to_vec()).collect();
        self.backend.scatter(MRAM_MODULUS, 0, &moduli)?;
        self.backend
            .broadcast(DATA_COPIED_IN_BYTES, 0, &bytes_header.to_le_bytes())?;

        let a: Vec<Vec<u8>> = batch.a.iter().map(|v| encode_residues(v)).collect();
        let b: Vec<Vec<u8>> = batch.b.iter().map(|v| encode_residues(v)).collect();
        self.backend.scatter(DPU_MRAM_HEAP_POINTER_NAME, 0, &a)?;
        self.backend
            .scatter(DPU_MRAM_HEAP_POINTER_NAME, operand_bytes, &b)?;
        debug!(
            units = self.unit_count(),
            bytes_per_unit = 2 * operand_bytes,
            "copied batch to units"
        );
        Ok(())
    }

    /// Launches the loaded binary on all units and waits for completion.
    pub fn execute(&mut self) -> Result<()> {
        let result = self.backend.launch();
        self.launches += 1;
        self.last_logs = self.backend.read_logs();
        let appended = self.append_exec_log(result.is_ok());
        logged("execute", result)?;
        logged("append execution log", appended)
    }

    fn append_exec_log(&mut self, succeeded: bool) -> Result<()> {
        let Some(file) = self.exec_log.as_mut() else {
            return Ok(());
        };
        let mut block = format!(
            "== launch {} of {} on {} units: {}\n",
            self.launches,
            self.loaded
                .as_deref()
                .map_or_else(|| "<none>".to_string(), |p| p.display().to_string()),
            self.last_logs.len(),
            if succeeded { "ok" } else { "failed" }
        );
        for (unit, log) in self.last_logs.iter().enumerate() {
            for line in log.lines() {
                let _ = writeln!(block, "[unit {}] {}", unit, line);
            }
        }
        file.write_all(block.as_bytes())?;
        Ok(())
    }

    /// Copies every unit's result region back into host buffers.
    pub fn copy_results_from_units(&mut self, batch: &StagedBatch) -> Result<UnitResults> {
        let partition = &batch.partition;
        let gathered = self
            .backend
            .gather(DPU_MRAM_HEAP_POINTER_NAME, 0, partition.operand_bytes());
        let data = logged("copy results from units", gathered)?
            .iter()
            .map(|bytes| decode_residues(bytes))
            .collect();
        Ok(UnitResults {
            partition: *partition,
            tower_moduli: batch.tower_moduli.clone(),
            data,
        })
    }

    /// Scatters unit results into `poly`'s towers, in staging order.
    ///
    /// Each destination tower must carry the modulus its results were
    /// computed under.
    pub fn fill_poly(&self, poly: &mut DcrtPoly, results: &UnitResults) -> Result<()> {
        let moduli: Vec<u64> = poly.towers().iter().map(|t| t.modulus).collect();
        if moduli != results.tower_moduli {
            return logged(
                "fill poly",
                Err(PimError::ShapeMismatch(format!(
                    "results computed under moduli {:?}, destination uses {:?}",
                    results.tower_moduli, moduli
                ))),
            );
        }
        let mut towers: Vec<&mut [u64]> = poly
            .towers_mut()
            .iter_mut()
            .map(|t| t.values.as_mut_slice())
            .collect();
        logged("fill poly", results.partition.scatter(&results.data, &mut towers))
    }

    /// Load, copy in, execute, copy out and reassemble for one tower kernel.
    ///
    /// # Arguments
    /// * `a`, `b` - Operand towers (same count, length and moduli)
    /// * `kernel` - One of the tower kernels
    /// * `split` - Units assigned to each tower
    ///
    /// # Returns
    /// * `Result<Vec<Tower>>` - Result towers under `a`'s moduli. Nothing is
    ///   written to the operands.
    pub fn run_towers(&mut self, a: &[Tower], b: &[Tower], kernel: KernelBinary, split: usize) -> Result<Vec<Tower>> {
        if !kernel.is_tower_kernel() {
            return logged(
                "run towers",
                Err(PimError::InvalidParameters(format!(
                    "{} is not a tower kernel",
                    kernel.file_name()
                ))),
            );
        }
        let batch = self.prepare_towers(a, b, split)?;
        self.load_kernel(kernel)?;
        self.copy_batch_to_units(&batch)?;
        self.execute()?;
        let results = self.copy_results_from_units(&batch)?;

        let mut out: Vec<Tower> = batch
            .tower_moduli
            .iter()
            .map(|&modulus| Tower::zero(modulus, batch.partition.tower_len()))
            .collect();
        let mut slices: Vec<&mut [u64]> = out.iter_mut().map(|t| t.values.as_mut_slice()).collect();
        logged("scatter results", results.partition.scatter(&results.data, &mut slices))?;
        Ok(out)
    }

    /// Copies residues into unit memory at `offset`.
    pub fn copy_to_pim(&mut self, values: &[u64], offset: u32, mode: Transfer) -> Result<()> {
        let result = match mode {
            Transfer::Broadcast => self.backend.broadcast(
                DPU_MRAM_HEAP_POINTER_NAME,
                offset as usize,
                &encode_residues(values),
            ),
            Transfer::Scatter => self.scatter_values(values, offset),
        };
        logged("copy to pim", result)
    }

    fn scatter_values(&mut self, values: &[u64], offset: u32) -> Result<()> {
        let share = self.even_shares(values.len())?;
        let buffers: Vec<Vec<u8>> = (0..self.unit_count())
            .map(|unit| encode_residues(&values[unit * share..(unit + 1) * share]))
            .collect();
        self.backend
            .scatter(DPU_MRAM_HEAP_POINTER_NAME, offset as usize, &buffers)
    }

    fn even_shares(&self, len: usize) -> Result<usize> {
        let units = self.unit_count();
        if len % units != 0 {
            return Err(PimError::UnevenPartition {
                tower_len: len,
                split_factor: units,
            });
        }
        Ok(len / units)
    }

    /// Reads `per_unit` residues at `offset` from every unit, concatenated in
    /// unit order.
    pub fn copy_from_pim(&mut self, offset: u32, per_unit: usize) -> Result<Vec<u64>> {
        let gathered = self.backend.gather(
            DPU_MRAM_HEAP_POINTER_NAME,
            offset as usize,
            per_unit * RESIDUE_BYTES,
        );
        Ok(logged("copy from pim", gathered)?
            .iter()
            .flat_map(|bytes| decode_residues(bytes))
            .collect())
    }

    /// Broadcasts a parameter block into a WRAM symbol of the loaded binary.
    pub fn send_parameters(&mut self, symbol: &str, bytes: &[u8]) -> Result<()> {
        logged("send parameters", self.backend.broadcast(symbol, 0, bytes))
    }

    /// Loads an elementwise binary, sends `meta` and launches it.
    pub fn run_elementwise(&mut self, kernel: KernelBinary, meta: &ElementwiseMeta) -> Result<()> {
        self.load_kernel(kernel)?;
        self.send_parameters(META, &meta.to_bytes()?)?;
        self.execute()
    }

    /// Loads the mod-ops binary, sends `meta` and launches it.
    pub fn run_mod_ops(&mut self, meta: &ModOpsMeta) -> Result<()> {
        self.load_kernel(KernelBinary::ModOps)?;
        self.send_parameters(META, &meta.to_bytes()?)?;
        self.execute()
    }

    /// Reserves `bytes` on every unit at one common address.
    ///
    /// Units that already succeeded are rolled back if any unit fails.
    pub fn allocate(&mut self, bytes: usize) -> Result<u32> {
        let mut granted: Vec<(usize, u32)> = Vec::with_capacity(self.memories.len());
        let mut failure = None;
        for (unit, memory) in self.memories.iter_mut().enumerate() {
            match memory.allocate(bytes) {
                Ok(address) => granted.push((unit, address)),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        let address = granted.first().map(|&(_, a)| a);
        if failure.is_none() && granted.iter().all(|&(_, a)| Some(a) == address) {
            if let Some(address) = address {
                debug!(bytes, address, "allocated device memory on every unit");
                return Ok(address);
            }
        }

        for (unit, addr) in granted {
            let _ = self.memories[unit].deallocate(addr);
        }
        let err = failure.unwrap_or_else(|| {
            PimError::UnitAllocation("units disagree on the allocated address".to_string())
        });
        logged("allocate", Err(err))
    }

    /// Releases `address` on every unit.
    pub fn deallocate(&mut self, address: u32) -> Result<()> {
        let mut outcome = Ok(());
        for memory in self.memories.iter_mut() {
            if let Err(err) = memory.deallocate(address) {
                if outcome.is_ok() {
                    outcome = Err(err);
                }
            }
        }
        logged("deallocate", outcome)
    }

    /// Text map of every unit's allocations.
    pub fn memory_status(&self) -> String {
        self.memories.iter().map(|m| m.display_status()).collect()
    }

    /// Device output of the most recent launch, one entry per unit.
    pub fn device_logs(&self) -> &[String] {
        &self.last_logs
    }
}
