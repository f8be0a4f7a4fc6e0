/// Host side of PIM offload.
///
/// The [`PimManager`] owns the unit pool behind a [`PimBackend`], partitions
/// double-CRT towers with [`TowerPartition`] and drives the device binaries
/// listed in [`KernelBinary`]. [`PimVector`] keeps residues resident on the
/// units between operations.
pub mod backend;
pub mod kernel;
pub mod manager;
pub mod partition;
pub mod vector;

pub use backend::{PimBackend, SimulatorBackend};
pub use kernel::KernelBinary;
pub use manager::{PimHandle, PimManager, StagedBatch, Transfer, UnitResults};
pub use partition::{Slot, TowerPartition};
pub use vector::PimVector;
