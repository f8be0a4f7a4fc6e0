/// In-process model of a PIM unit and the programs it runs.
///
/// A unit owns a private MRAM bank, a set of host-visible WRAM symbols and a
/// small scratch heap shared by its tasklets. The host never touches unit
/// memory directly; it goes through named transfers and synchronous launches
/// exactly as it would with physical hardware.
///
/// Key Features:
/// - Byte-addressed MRAM with 8-byte aligned transfers (`unit`)
/// - Cooperative tasklets that stream operands through fixed-size caches in
///   strided chunks, with one barrier before shared state is touched (`tasklet`)
/// - Fixed-layout little-endian parameter blocks (`params`)
/// - One program per operation family: tower add/sub/mul, scalar/vector
///   elementwise ops and the multiplexed mod-ops kernel (`programs`)
use thiserror::Error;

pub mod params;
pub mod programs;
pub mod tasklet;
pub mod unit;

pub use params::{ElementwiseKernel, ElementwiseMeta, ModKernel, ModOpsMeta, Operand};
pub use programs::DpuProgram;
pub use tasklet::{Placement, ScratchHeap, StreamSpec, TaskletConfig};
pub use unit::{DpuUnit, Mram};

/// Faults raised on a unit while transferring to it or running a program.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceFault {
    #[error("MRAM access [{offset}, {offset}+{len}) exceeds capacity {capacity}")]
    OutOfBounds { offset: usize, len: usize, capacity: usize },

    #[error("MRAM access at offset {offset} of {len} bytes is not 8-byte aligned")]
    Misaligned { offset: usize, len: usize },

    #[error("WRAM heap exhausted: requested {requested} bytes, {available} available")]
    HeapExhausted { requested: usize, available: usize },

    #[error("Unknown kernel selector {0}")]
    UnknownKernel(u32),

    #[error("Division by zero in {0}")]
    DivisionByZero(&'static str),

    #[error("Modulus {0} is not supported on device")]
    InvalidModulus(u64),

    #[error("Host symbol `{0}` is not declared by the loaded program")]
    UnknownSymbol(String),

    #[error("Host symbol `{0}` is malformed")]
    BadSymbol(String),

    #[error("Write of {len} bytes at offset {offset} overflows symbol `{symbol}` ({size} bytes)")]
    SymbolOverflow {
        symbol: String,
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("No program loaded")]
    NoProgram,

    #[error("Tasklet {0} panicked")]
    TaskletPanicked(usize),
}
