//! Processing-in-memory offload of double-CRT polynomial arithmetic.
//!
//! The host side ([`pim`]) allocates a pool of PIM units, partitions tower
//! data across them, moves it in bulk and launches device programs
//! synchronously. The device side ([`device`]) models each unit with its own
//! MRAM bank and cooperative tasklets running the modular kernels of
//! [`arith`]. [`poly`] provides the double-CRT polynomial that routes its
//! operators through an attached manager.

pub mod arith;
pub mod config;
pub mod device;
pub mod error;
pub mod memory;
pub mod pim;
pub mod poly;


pub use config::{PimConfig, UnitRequest};
pub use error::{PimError, Result};
pub use memory::DpuMemory;
pub use pim::{
    KernelBinary, PimBackend, PimHandle, PimManager, PimVector, SimulatorBackend, Transfer,
    TowerPartition,
};
pub use poly::{DcrtParams, DcrtPoly, Format, Tower};
