/// One simulated PIM unit: MRAM bank, WRAM host symbols, scratch heap, log.
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use super::params::{DPU_MRAM_HEAP_POINTER_NAME, RESIDUE_BYTES};
use super::programs::DpuProgram;
use super::tasklet::{self, ScratchHeap, StreamSpec, TaskletConfig};
use super::DeviceFault;

/// Byte-addressed unit memory. Backing storage grows on first write, reads
/// of untouched memory return zeros.
#[derive(Debug, Clone)]
pub struct Mram {
    bytes: Vec<u8>,
    capacity: usize,
}

impl Mram {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: Vec::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes actually materialised so far.
    pub fn resident_bytes(&self) -> usize {
        self.bytes.len()
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), DeviceFault> {
        if offset % RESIDUE_BYTES != 0 || len % RESIDUE_BYTES != 0 {
            return Err(DeviceFault::Misaligned { offset, len });
        }
        match offset.checked_add(len) {
            Some(end) if end <= self.capacity => Ok(()),
            _ => Err(DeviceFault::OutOfBounds {
                offset,
                len,
                capacity: self.capacity,
            }),
        }
    }

    fn grow(&mut self, end: usize) {
        if self.bytes.len() < end {
            self.bytes.resize(end, 0);
        }
    }

    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>, DeviceFault> {
        self.check(offset, len)?;
        let mut out = vec![0u8; len];
        let resident = self.bytes.len().saturating_sub(offset).min(len);
        if resident > 0 {
            out[..resident].copy_from_slice(&self.bytes[offset..offset + resident]);
        }
        Ok(out)
    }

    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), DeviceFault> {
        self.check(offset, data.len())?;
        self.grow(offset + data.len());
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn slice_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8], DeviceFault> {
        self.check(offset, len)?;
        self.grow(offset + len);
        Ok(&mut self.bytes[offset..offset + len])
    }
}

#[derive(Debug)]
pub struct DpuUnit {
    id: usize,
    mram: Mram,
    symbols: HashMap<&'static str, Vec<u8>>,
    program: Option<Arc<dyn DpuProgram>>,
    heap: ScratchHeap,
    tasklets: TaskletConfig,
    log: String,
}

impl DpuUnit {
    pub fn new(id: usize, mram_size: usize, wram_heap_size: usize, tasklets: TaskletConfig) -> Self {
        Self {
            id,
            mram: Mram::new(mram_size),
            symbols: HashMap::new(),
            program: None,
            heap: ScratchHeap::new(wram_heap_size),
            tasklets,
            log: String::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Replaces the loaded program. Declared WRAM symbols start zeroed; MRAM
    /// keeps its contents.
    pub fn load(&mut self, program: Arc<dyn DpuProgram>) {
        self.symbols = program
            .host_symbols()
            .iter()
            .map(|&(name, size)| (name, vec![0u8; size]))
            .collect();
        self.heap.reset();
        self.program = Some(program);
    }

    pub fn program_name(&self) -> Option<&'static str> {
        self.program.as_ref().map(|p| p.name())
    }

    /// Host-side write into MRAM or into a WRAM symbol.
    pub fn write_symbol(&mut self, target: &str, offset: usize, data: &[u8]) -> Result<(), DeviceFault> {
        if target == DPU_MRAM_HEAP_POINTER_NAME {
            return self.mram.write(offset, data);
        }
        let symbol = self
            .symbols
            .get_mut(target)
            .ok_or_else(|| DeviceFault::UnknownSymbol(target.to_string()))?;
        let size = symbol.len();
        match offset.checked_add(data.len()) {
            Some(end) if end <= size => {
                symbol[offset..end].copy_from_slice(data);
                Ok(())
            }
            _ => Err(DeviceFault::SymbolOverflow {
                symbol: target.to_string(),
                offset,
                len: data.len(),
                size,
            }),
        }
    }

    /// Host-side read from MRAM or from a WRAM symbol.
    pub fn read_symbol(&self, target: &str, offset: usize, len: usize) -> Result<Vec<u8>, DeviceFault> {
        if target == DPU_MRAM_HEAP_POINTER_NAME {
            return self.mram.read(offset, len);
        }
        let symbol = self.symbol(target)?;
        match offset.checked_add(len) {
            Some(end) if end <= symbol.len() => Ok(symbol[offset..end].to_vec()),
            _ => Err(DeviceFault::SymbolOverflow {
                symbol: target.to_string(),
                offset,
                len,
                size: symbol.len(),
            }),
        }
    }

    /// Device-side view of a WRAM symbol.
    pub fn symbol(&self, name: &str) -> Result<&[u8], DeviceFault> {
        self.symbols
            .get(name)
            .map(|bytes| bytes.as_slice())
            .ok_or_else(|| DeviceFault::UnknownSymbol(name.to_string()))
    }

    pub fn symbol_u64(&self, name: &str) -> Result<u64, DeviceFault> {
        let bytes = self.symbol(name)?;
        if bytes.len() < 8 {
            return Err(DeviceFault::BadSymbol(name.to_string()));
        }
        Ok(LittleEndian::read_u64(bytes))
    }

    pub fn symbol_u32(&self, name: &str) -> Result<u32, DeviceFault> {
        let bytes = self.symbol(name)?;
        if bytes.len() < 4 {
            return Err(DeviceFault::BadSymbol(name.to_string()));
        }
        Ok(LittleEndian::read_u32(bytes))
    }

    /// Runs the loaded program to completion.
    pub fn launch(&mut self) -> Result<(), DeviceFault> {
        let program = self.program.clone().ok_or(DeviceFault::NoProgram)?;
        program.run(self)
    }

    /// Streams operands through the tasklet caches; see [`tasklet::stream`].
    pub fn stream<P, K>(&mut self, spec: StreamSpec, prepare: P, kernel: K) -> Result<(), DeviceFault>
    where
        P: FnOnce() -> Result<u64, DeviceFault> + Send,
        K: Fn(u64, &mut [u64], &[u64], &mut [u64]) + Sync,
    {
        tasklet::stream(&mut self.mram, &self.heap, &self.tasklets, spec, prepare, kernel)
    }

    pub fn mram(&self) -> &Mram {
        &self.mram
    }

    pub fn tasklets(&self) -> TaskletConfig {
        self.tasklets
    }

    /// Appends a line to the unit's log (the device `printf` stream).
    pub fn log_line(&mut self, line: std::fmt::Arguments<'_>) {
        let _ = self.log.write_fmt(line);
        self.log.push('\n');
    }

    pub fn log(&self) -> &str {
        &self.log
    }

    pub fn take_log(&mut self) -> String {
        std::mem::take(&mut self.log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::params::{encode_residues, MRAM_MODULUS};
    use crate::device::programs::TowerKernel;

    fn unit() -> DpuUnit {
        DpuUnit::new(0, 1 << 20, 1 << 16, TaskletConfig::new(4, 64))
    }

    #[test]
    fn test_mram_bounds_and_alignment() {
        let mut mram = Mram::new(64);
        assert!(mram.write(0, &[0u8; 64]).is_ok());
        assert!(matches!(mram.write(8, &[0u8; 64]), Err(DeviceFault::OutOfBounds { .. })));
        assert!(matches!(mram.write(3, &[0u8; 8]), Err(DeviceFault::Misaligned { .. })));
        assert!(matches!(mram.read(0, 12), Err(DeviceFault::Misaligned { .. })));
    }

    #[test]
    fn test_untouched_mram_reads_zero() {
        let mut mram = Mram::new(1 << 10);
        mram.write(0, &encode_residues(&[5, 6])).unwrap();
        assert_eq!(mram.resident_bytes(), 16);
        let bytes = mram.read(8, 24).unwrap();
        assert_eq!(&bytes[..8], &6u64.to_le_bytes());
        assert!(bytes[8..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_symbols_follow_loaded_program() {
        let mut unit = unit();
        assert!(matches!(
            unit.write_symbol(MRAM_MODULUS, 0, &97u64.to_le_bytes()),
            Err(DeviceFault::UnknownSymbol(_))
        ));
        assert_eq!(unit.launch(), Err(DeviceFault::NoProgram));

        unit.load(Arc::new(TowerKernel::Add));
        unit.write_symbol(MRAM_MODULUS, 0, &97u64.to_le_bytes()).unwrap();
        assert_eq!(unit.symbol_u64(MRAM_MODULUS).unwrap(), 97);
        assert!(matches!(
            unit.write_symbol(MRAM_MODULUS, 4, &97u64.to_le_bytes()),
            Err(DeviceFault::SymbolOverflow { .. })
        ));

        // Reloading zeroes WRAM but keeps MRAM.
        unit.write_symbol(DPU_MRAM_HEAP_POINTER_NAME, 0, &encode_residues(&[9])).unwrap();
        unit.load(Arc::new(TowerKernel::Add));
        assert_eq!(unit.symbol_u64(MRAM_MODULUS).unwrap(), 0);
        assert_eq!(unit.read_symbol(DPU_MRAM_HEAP_POINTER_NAME, 0, 8).unwrap(), 9u64.to_le_bytes());
    }

    #[test]
    fn test_log_lines() {
        let mut unit = unit();
        unit.log_line(format_args!("unit {} ready", 0));
        assert_eq!(unit.log(), "unit 0 ready\n");
        assert_eq!(unit.take_log(), "unit 0 ready\n");
        assert!(unit.log().is_empty());
    }
}
