use std::path::PathBuf;

use thiserror::Error;

use crate::device::DeviceFault;

#[derive(Error, Debug)]
pub enum PimError {
    #[error("Unit allocation failed: {0}")]
    UnitAllocation(String),

    #[error("Transfer to/from target `{target}` failed: {reason}")]
    Transfer { target: String, reason: String },

    #[error("Execution failed on unit {unit}: {source}")]
    Execution {
        unit: usize,
        #[source]
        source: DeviceFault,
    },

    #[error("No kernel binary is loaded")]
    NoKernelLoaded,

    #[error("Unknown kernel binary: {}", .0.display())]
    UnknownBinary(PathBuf),

    #[error("Device memory exhausted: requested {requested} bytes on unit {unit}")]
    DeviceMemoryExhausted { unit: usize, requested: usize },

    #[error("Invalid deallocation of address {address:#x} on unit {unit}")]
    InvalidDeallocation { unit: usize, address: u32 },

    #[error("Tower length {tower_len} is not divisible by split factor {split_factor}")]
    UnevenPartition { tower_len: usize, split_factor: usize },

    #[error("Partition needs {required} units but only {available} are allocated")]
    InsufficientUnits { required: usize, available: usize },

    #[error("Invalid modulus: {modulus}")]
    InvalidModulus { modulus: u64 },

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Operation requires {expected} format")]
    FormatMismatch { expected: &'static str },

    #[error("PIM manager lock poisoned")]
    ManagerPoisoned,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PimError>;
