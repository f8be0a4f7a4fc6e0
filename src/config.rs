/// Runtime configuration for the PIM execution manager.
///
/// Values come from builder-style setters or from environment variables via
/// [`PimConfig::from_env`]. Unset or unparsable variables keep the defaults.
use std::path::PathBuf;

use crate::error::{PimError, Result};

/// Default number of units requested when nothing else is configured.
pub const DEFAULT_NR_UNITS: usize = 4;

/// Default number of tasklets per unit.
pub const DEFAULT_NR_TASKLETS: usize = 16;

/// Bytes streamed through one tasklet cache per chunk.
pub const DEFAULT_CACHE_SIZE: usize = 1 << 8;

/// Size of one unit's MRAM bank (64 MiB).
pub const DEFAULT_MRAM_SIZE: usize = 64 * 1024 * 1024;

/// Size of the WRAM scratch heap shared by a unit's tasklets (64 KiB).
pub const DEFAULT_WRAM_HEAP_SIZE: usize = 64 * 1024;

/// Units the simulator offers when asked for "all available".
pub const DEFAULT_SIMULATED_POOL: usize = 64;

/// How many physical units to request from the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitRequest {
    /// Exactly this many units; fewer is an allocation failure.
    Count(usize),
    /// Every unit the backend can provide.
    All,
}

#[derive(Debug, Clone)]
pub struct PimConfig {
    pub units: UnitRequest,
    pub profile: String,
    pub binary_dir: PathBuf,
    pub log_file: Option<PathBuf>,
    pub tasklets: usize,
    pub cache_size: usize,
    pub mram_size: usize,
    pub wram_heap_size: usize,
    pub simulated_pool: usize,
}

impl Default for PimConfig {
    fn default() -> Self {
        Self {
            units: UnitRequest::Count(DEFAULT_NR_UNITS),
            profile: "backend=simulator".to_string(),
            binary_dir: PathBuf::from("./dpu"),
            log_file: None,
            tasklets: DEFAULT_NR_TASKLETS,
            cache_size: DEFAULT_CACHE_SIZE,
            mram_size: DEFAULT_MRAM_SIZE,
            wram_heap_size: DEFAULT_WRAM_HEAP_SIZE,
            simulated_pool: DEFAULT_SIMULATED_POOL,
        }
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|s| s.trim().parse::<usize>().ok())
}

impl PimConfig {
    /// Builds a configuration from the process environment.
    ///
    /// - `PIM_NR_DPUS`: unit count, `0` requests all available units.
    /// - `PIM_PROFILE`: backend profile string.
    /// - `PIM_BINARY_DIR`: directory holding the compiled device programs.
    /// - `PIM_LOG_FILE`: append-only execution log.
    /// - `PIM_NR_TASKLETS`, `PIM_CACHE_SIZE`: device execution shape.
    /// - `PIM_SIM_POOL`: units offered by the simulator.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = env_usize("PIM_NR_DPUS") {
            config.units = if n == 0 { UnitRequest::All } else { UnitRequest::Count(n) };
        }
        if let Ok(profile) = std::env::var("PIM_PROFILE") {
            config.profile = profile;
        }
        if let Ok(dir) = std::env::var("PIM_BINARY_DIR") {
            config.binary_dir = PathBuf::from(dir);
        }
        if let Ok(path) = std::env::var("PIM_LOG_FILE") {
            config.log_file = Some(PathBuf::from(path));
        }
        if let Some(n) = env_usize("PIM_NR_TASKLETS").filter(|n| *n > 0) {
            config.tasklets = n;
        }
        if let Some(n) = env_usize("PIM_CACHE_SIZE").filter(|n| *n > 0 && n % 8 == 0) {
            config.cache_size = n;
        }
        if let Some(n) = env_usize("PIM_SIM_POOL").filter(|n| *n > 0) {
            config.simulated_pool = n;
        }
        config
    }

    pub fn with_units(mut self, units: usize) -> Self {
        self.units = UnitRequest::Count(units);
        self
    }

    pub fn with_all_units(mut self) -> Self {
        self.units = UnitRequest::All;
        self
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = profile.into();
        self
    }

    pub fn with_binary_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.binary_dir = dir.into();
        self
    }

    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    pub fn with_tasklets(mut self, tasklets: usize) -> Self {
        self.tasklets = tasklets;
        self
    }

    pub fn with_cache_size(mut self, bytes: usize) -> Self {
        self.cache_size = bytes;
        self
    }

    pub fn with_mram_size(mut self, bytes: usize) -> Self {
        self.mram_size = bytes;
        self
    }

    pub fn with_simulated_pool(mut self, units: usize) -> Self {
        self.simulated_pool = units;
        self
    }

    /// Checks the execution shape before any unit is allocated.
    pub fn validate(&self) -> Result<()> {
        if let UnitRequest::Count(0) = self.units {
            return Err(PimError::InvalidParameters(
                "unit count must be positive".to_string(),
            ));
        }
        if self.tasklets == 0 {
            return Err(PimError::InvalidParameters(
                "at least one tasklet is required".to_string(),
            ));
        }
        if self.cache_size == 0 || self.cache_size % 8 != 0 {
            return Err(PimError::InvalidParameters(format!(
                "cache size {} must be a non-zero multiple of 8",
                self.cache_size
            )));
        }
        // MRAM addresses and transfer sizes travel as 32-bit fields.
        if self.mram_size == 0 || self.mram_size > u32::MAX as usize {
            return Err(PimError::InvalidParameters(format!(
                "MRAM size {} must be non-zero and fit in 32 bits",
                self.mram_size
            )));
        }
        // Three caches per tasklet: operand A, operand B and the result.
        let scratch = 3 * self.cache_size * self.tasklets;
        if scratch > self.wram_heap_size {
            return Err(PimError::InvalidParameters(format!(
                "{} tasklets with {}-byte caches need {} bytes of WRAM, only {} available",
                self.tasklets, self.cache_size, scratch, self.wram_heap_size
            )));
        }
        Ok(())
    }
}
