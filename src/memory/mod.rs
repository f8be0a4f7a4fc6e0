/// Block allocator for one unit's MRAM chunk.
///
/// The chunk is cut into fixed-size blocks tracked by an occupancy bitmap.
/// Allocation is first-fit over contiguous free blocks, with no compaction.
/// Every live address maps to the number of blocks it owns so deallocation
/// can release exactly those blocks.
///
/// Performance Characteristics:
/// - Allocation: O(blocks) scan of the bitmap
/// - Deallocation: O(log n) bookkeeping lookup plus O(blocks owned)
///
/// The allocator is not synchronised; the manager serialises access.
use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::error::{PimError, Result};

/// Bytes managed per unit (64 MiB).
pub const CHUNK_SIZE: usize = 64 * 1024 * 1024;

/// Allocation granularity (4 KiB).
pub const BLOCK_SIZE: usize = 4 * 1024;

#[derive(Debug, Clone)]
pub struct DpuMemory {
    unit: usize,
    block_size: usize,
    blocks: Vec<bool>,
    allocations: BTreeMap<u32, usize>,
}

impl DpuMemory {
    pub fn new(unit: usize) -> Self {
        Self::with_geometry(unit, CHUNK_SIZE, BLOCK_SIZE)
    }

    /// Allocator over `capacity` bytes split into `block_size`-byte blocks.
    pub fn with_geometry(unit: usize, capacity: usize, block_size: usize) -> Self {
        let block_size = block_size.max(1);
        Self {
            unit,
            block_size,
            blocks: vec![false; capacity / block_size],
            allocations: BTreeMap::new(),
        }
    }

    pub fn unit(&self) -> usize {
        self.unit
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn capacity(&self) -> usize {
        self.blocks.len() * self.block_size
    }

    pub fn free_bytes(&self) -> usize {
        self.blocks.iter().filter(|used| !**used).count() * self.block_size
    }

    /// Reserves at least `size` bytes and returns their byte address.
    ///
    /// # Arguments
    /// * `size` - Requested bytes, rounded up to whole blocks (minimum one)
    ///
    /// # Returns
    /// * `Result<u32>` - Address of the first block, or `DeviceMemoryExhausted`
    ///   when no contiguous run of free blocks is long enough
    pub fn allocate(&mut self, size: usize) -> Result<u32> {
        let needed = ((size + self.block_size - 1) / self.block_size).max(1);
        let exhausted = PimError::DeviceMemoryExhausted {
            unit: self.unit,
            requested: size,
        };
        if needed > self.blocks.len() {
            return Err(exhausted);
        }

        let mut run = 0;
        for index in 0..self.blocks.len() {
            if self.blocks[index] {
                run = 0;
                continue;
            }
            run += 1;
            if run == needed {
                let first = index + 1 - needed;
                self.blocks[first..=index].iter_mut().for_each(|b| *b = true);
                let address = (first * self.block_size) as u32;
                self.allocations.insert(address, needed);
                return Ok(address);
            }
        }
        Err(exhausted)
    }

    /// Releases the blocks owned by `address`.
    pub fn deallocate(&mut self, address: u32) -> Result<()> {
        match self.allocations.remove(&address) {
            Some(count) => {
                let first = address as usize / self.block_size;
                self.blocks[first..first + count]
                    .iter_mut()
                    .for_each(|b| *b = false);
                Ok(())
            }
            None => {
                tracing::error!(unit = self.unit, address, "invalid address to deallocate");
                Err(PimError::InvalidDeallocation {
                    unit: self.unit,
                    address,
                })
            }
        }
    }

    /// Whether no live allocation touches `[start, start + len)`.
    pub fn is_range_free(&self, start: usize, len: usize) -> bool {
        if len == 0 {
            return true;
        }
        let first = start / self.block_size;
        let last = (start + len - 1) / self.block_size;
        self.blocks
            .iter()
            .skip(first)
            .take(last + 1 - first)
            .all(|used| !*used)
    }

    /// Live allocations as `(address, bytes)` in address order.
    pub fn live_allocations(&self) -> impl Iterator<Item = (u32, usize)> + '_ {
        self.allocations
            .iter()
            .map(move |(&address, &count)| (address, count * self.block_size))
    }

    /// Human-readable map of the unit's allocations.
    pub fn display_status(&self) -> String {
        let used = self.blocks.iter().filter(|b| **b).count();
        let mut out = format!(
            "unit {}: {}/{} blocks in use ({} bytes free)\n",
            self.unit,
            used,
            self.blocks.len(),
            self.free_bytes()
        );
        for (address, bytes) in self.live_allocations() {
            let _ = writeln!(out, "  {:#010x} +{}", address, bytes);
        }
        out
    }
}
