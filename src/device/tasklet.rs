/// Tasklet execution model of a single unit.
///
/// A program's operand region is cut into `cache_size`-byte chunks and chunk
/// `k` belongs to tasklet `k % tasklets`, which is the strided walk
/// `tasklet_id * cache_size, += cache_size * tasklets` seen from each tasklet.
/// No two tasklets touch the same chunk. Tasklet 0 resets the shared scratch
/// heap and computes the launch parameter (for example a Barrett constant)
/// before a single barrier; every tasklet then allocates its caches and walks
/// its chunks.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Barrier, OnceLock};

use byteorder::{ByteOrder, LittleEndian};

use super::params::RESIDUE_BYTES;
use super::unit::Mram;
use super::DeviceFault;
use crate::config::PimConfig;

/// Execution shape shared by every program on a unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskletConfig {
    pub tasklets: usize,
    pub cache_size: usize,
}

impl TaskletConfig {
    pub fn new(tasklets: usize, cache_size: usize) -> Self {
        Self { tasklets, cache_size }
    }

    pub fn from_config(config: &PimConfig) -> Self {
        Self::new(config.tasklets, config.cache_size)
    }

    /// Residues held by one cache.
    pub fn cache_words(&self) -> usize {
        self.cache_size / RESIDUE_BYTES
    }
}

/// Bump allocator over the unit's WRAM heap, shared by all tasklets.
#[derive(Debug)]
pub struct ScratchHeap {
    capacity: usize,
    used: AtomicUsize,
}

impl ScratchHeap {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            used: AtomicUsize::new(0),
        }
    }

    pub fn reset(&self) {
        self.used.store(0, Ordering::Release);
    }

    /// Reserves `bytes` and returns their offset in the heap.
    pub fn alloc(&self, bytes: usize) -> Result<usize, DeviceFault> {
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            let next = current + bytes;
            if next > self.capacity {
                return Err(DeviceFault::HeapExhausted {
                    requested: bytes,
                    available: self.capacity - current,
                });
            }
            match self
                .used
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(current),
                Err(actual) => current = actual,
            }
        }
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Where a streamed kernel leaves its result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    /// Overwrite operand A.
    InPlace,
    /// Write to a separate region starting at `dst`.
    OutOfPlace { dst: usize },
}

/// MRAM regions touched by one streamed launch. Offsets and `len` are bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamSpec {
    pub a: usize,
    pub b: Option<usize>,
    pub len: usize,
    pub placement: Placement,
}

impl StreamSpec {
    pub fn in_place(a: usize, b: Option<usize>, len: usize) -> Self {
        Self {
            a,
            b,
            len,
            placement: Placement::InPlace,
        }
    }

    pub fn out_of_place(a: usize, b: Option<usize>, dst: usize, len: usize) -> Self {
        Self {
            a,
            b,
            len,
            placement: Placement::OutOfPlace { dst },
        }
    }

    fn dst(&self) -> usize {
        match self.placement {
            Placement::InPlace => self.a,
            Placement::OutOfPlace { dst } => dst,
        }
    }
}

/// Runs `kernel` over every chunk of `spec` on `config.tasklets` threads.
///
/// `prepare` runs once on tasklet 0 before the barrier; its value is handed
/// to every kernel call. The kernel receives the launch parameter, cache A
/// (mutable, written back for in-place launches), cache B (empty when the
/// launch has no second operand) and the result cache (written back for
/// out-of-place launches). Sources are read before any result is written.
pub fn stream<P, K>(
    mram: &mut Mram,
    heap: &ScratchHeap,
    config: &TaskletConfig,
    spec: StreamSpec,
    prepare: P,
    kernel: K,
) -> Result<(), DeviceFault>
where
    P: FnOnce() -> Result<u64, DeviceFault> + Send,
    K: Fn(u64, &mut [u64], &[u64], &mut [u64]) + Sync,
{
    let cache_size = config.cache_size;
    let tasklets = config.tasklets.max(1);
    if cache_size == 0 || cache_size % RESIDUE_BYTES != 0 {
        return Err(DeviceFault::Misaligned {
            offset: 0,
            len: cache_size,
        });
    }

    let a_src = match spec.placement {
        Placement::InPlace => None,
        Placement::OutOfPlace { .. } => Some(mram.read(spec.a, spec.len)?),
    };
    let b_src = match spec.b {
        Some(offset) => Some(mram.read(offset, spec.len)?),
        None => None,
    };
    let dst_offset = spec.dst();
    let region = mram.slice_mut(dst_offset, spec.len)?;

    let mut buckets: Vec<Vec<(usize, &mut [u8])>> = (0..tasklets).map(|_| Vec::new()).collect();
    for (k, chunk) in region.chunks_mut(cache_size).enumerate() {
        buckets[k % tasklets].push((k * cache_size, chunk));
    }

    let barrier = Barrier::new(tasklets);
    let param: OnceLock<Result<u64, DeviceFault>> = OnceLock::new();
    let caches_per_tasklet = if spec.b.is_some() { 3 } else { 2 };
    let mut prepare = Some(prepare);

    std::thread::scope(|scope| {
        let handles: Vec<_> = buckets
            .into_iter()
            .enumerate()
            .map(|(id, chunks)| {
                let setup = if id == 0 { prepare.take() } else { None };
                let (barrier, param, kernel) = (&barrier, &param, &kernel);
                let (a_src, b_src) = (a_src.as_deref(), b_src.as_deref());
                scope.spawn(move || -> Result<(), DeviceFault> {
                    if id == 0 {
                        heap.reset();
                        let value = setup.map_or(Ok(0), |f| f());
                        let _ = param.set(value);
                    }
                    barrier.wait();

                    let param = match param.get() {
                        Some(Ok(value)) => *value,
                        Some(Err(fault)) if id == 0 => return Err(fault.clone()),
                        _ => return Ok(()),
                    };

                    for _ in 0..caches_per_tasklet {
                        heap.alloc(cache_size)?;
                    }
                    let words = cache_size / RESIDUE_BYTES;
                    let mut cache_a = vec![0u64; words];
                    let mut cache_b = vec![0u64; if b_src.is_some() { words } else { 0 }];
                    let mut cache_res = vec![0u64; words];

                    for (offset, chunk) in chunks {
                        let n = chunk.len() / RESIDUE_BYTES;
                        let range = offset..offset + chunk.len();
                        match a_src {
                            Some(src) => LittleEndian::read_u64_into(&src[range.clone()], &mut cache_a[..n]),
                            None => LittleEndian::read_u64_into(chunk, &mut cache_a[..n]),
                        }
                        let b = match b_src {
                            Some(src) => {
                                LittleEndian::read_u64_into(&src[range], &mut cache_b[..n]);
                                &cache_b[..n]
                            }
                            None => &cache_b[..0],
                        };
                        kernel(param, &mut cache_a[..n], b, &mut cache_res[..n]);
                        match a_src {
                            Some(_) => LittleEndian::write_u64_into(&cache_res[..n], chunk),
                            None => LittleEndian::write_u64_into(&cache_a[..n], chunk),
                        }
                    }
                    Ok(())
                })
            })
            .collect();

        let mut outcome = Ok(());
        for (id, handle) in handles.into_iter().enumerate() {
            let result = handle.join().unwrap_or(Err(DeviceFault::TaskletPanicked(id)));
            if outcome.is_ok() {
                outcome = result;
            }
        }
        outcome
    })
}
