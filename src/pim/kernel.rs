/// Compiled device programs and their artifact names.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::device::programs::{Boot, DpuProgram, ElementwiseProgram, ModOpsProgram, TowerKernel};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KernelBinary {
    Boot,
    DcrtAdd,
    DcrtSub,
    DcrtMul,
    AddMod,
    SubMod,
    MultMod,
    ModOps,
}

impl KernelBinary {
    pub const ALL: [KernelBinary; 8] = [
        Self::Boot,
        Self::DcrtAdd,
        Self::DcrtSub,
        Self::DcrtMul,
        Self::AddMod,
        Self::SubMod,
        Self::MultMod,
        Self::ModOps,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            Self::Boot => "boot",
            Self::DcrtAdd => "dcrt-add",
            Self::DcrtSub => "dcrt-sub",
            Self::DcrtMul => "dcrt-mul",
            Self::AddMod => "add-mod",
            Self::SubMod => "sub-mod",
            Self::MultMod => "mult-mod",
            Self::ModOps => "mod-ops",
        }
    }

    pub fn path(self, binary_dir: &Path) -> PathBuf {
        binary_dir.join(self.file_name())
    }

    /// Identifies an artifact by file stem, ignoring its directory.
    pub fn from_path(path: &Path) -> Option<Self> {
        let stem = path.file_stem()?.to_str()?;
        Self::ALL.into_iter().find(|k| k.file_name() == stem)
    }

    /// Whether this is one of the tower kernels driven by `mram_modulus`.
    pub fn is_tower_kernel(self) -> bool {
        matches!(self, Self::DcrtAdd | Self::DcrtSub | Self::DcrtMul)
    }

    pub fn program(self) -> Arc<dyn DpuProgram> {
        match self {
            Self::Boot => Arc::new(Boot),
            Self::DcrtAdd => Arc::new(TowerKernel::Add),
            Self::DcrtSub => Arc::new(TowerKernel::Sub),
            Self::DcrtMul => Arc::new(TowerKernel::Mul),
            Self::AddMod => Arc::new(ElementwiseProgram::Add),
            Self::SubMod => Arc::new(ElementwiseProgram::Sub),
            Self::MultMod => Arc::new(ElementwiseProgram::Mul),
            Self::ModOps => Arc::new(ModOpsProgram),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_resolve_back() {
        let dir = Path::new("/opt/pim/dpu");
        for kernel in KernelBinary::ALL {
            let path = kernel.path(dir);
            assert_eq!(KernelBinary::from_path(&path), Some(kernel));
            assert_eq!(kernel.program().name(), kernel.file_name());
        }
        assert_eq!(KernelBinary::from_path(Path::new("dpu/mult-mod.dpu")), Some(KernelBinary::MultMod));
        assert_eq!(KernelBinary::from_path(Path::new("dpu/unknown")), None);
    }
}
