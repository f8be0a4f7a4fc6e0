/// Device programs, one per operation family.
///
/// Each program declares the WRAM symbols the host may write, decodes its
/// parameters from them on launch, validates them on tasklet 0 and streams
/// its operand regions through the tasklet caches with the matching
/// cache-level kernel from [`crate::arith::elementwise`].
use crate::arith::elementwise as ew;
use crate::arith::modular::{check_modulus, compute_mu};

use super::params::{
    ElementwiseKernel, ElementwiseMeta, ModKernel, ModOpsMeta, DATA_COPIED_IN_BYTES, META,
    MRAM_MODULUS, RESIDUE_BYTES,
};
use super::tasklet::StreamSpec;
use super::unit::DpuUnit;
use super::DeviceFault;

/// A program that can be loaded into a unit.
pub trait DpuProgram: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// WRAM symbols the host may write, with their sizes in bytes.
    fn host_symbols(&self) -> &'static [(&'static str, usize)];

    fn run(&self, unit: &mut DpuUnit) -> Result<(), DeviceFault>;
}

fn device_modulus(m: u64) -> Result<u64, DeviceFault> {
    check_modulus(m)
        .map(|_| m)
        .map_err(|_| DeviceFault::InvalidModulus(m))
}

/// Diagnostic program loaded right after allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Boot;

impl DpuProgram for Boot {
    fn name(&self) -> &'static str {
        "boot"
    }

    fn host_symbols(&self) -> &'static [(&'static str, usize)] {
        &[]
    }

    fn run(&self, unit: &mut DpuUnit) -> Result<(), DeviceFault> {
        let id = unit.id();
        let shape = unit.tasklets();
        unit.log_line(format_args!(
            "boot: unit {} up with {} tasklets, {}-byte caches",
            id, shape.tasklets, shape.cache_size
        ));
        Ok(())
    }
}

/// Tower kernels: operand A at MRAM offset 0, operand B right after it,
/// result written over A.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TowerKernel {
    Add,
    Sub,
    Mul,
}

const TOWER_SYMBOLS: &[(&str, usize)] = &[(MRAM_MODULUS, 8), (DATA_COPIED_IN_BYTES, 4)];

impl DpuProgram for TowerKernel {
    fn name(&self) -> &'static str {
        match self {
            Self::Add => "dcrt-add",
            Self::Sub => "dcrt-sub",
            Self::Mul => "dcrt-mul",
        }
    }

    fn host_symbols(&self) -> &'static [(&'static str, usize)] {
        TOWER_SYMBOLS
    }

    fn run(&self, unit: &mut DpuUnit) -> Result<(), DeviceFault> {
        let modulus = unit.symbol_u64(MRAM_MODULUS)?;
        let bytes = unit.symbol_u32(DATA_COPIED_IN_BYTES)? as usize;
        let op = *self;

        unit.stream(
            StreamSpec::in_place(0, Some(bytes), bytes),
            move || {
                let m = device_modulus(modulus)?;
                Ok(if op == Self::Mul { compute_mu(m) } else { 0 })
            },
            move |mu, a, b, _res| match op {
                Self::Add => ew::add_vector_eq(a, b, modulus),
                Self::Sub => ew::sub_vector_eq(a, b, modulus),
                Self::Mul => ew::mul_vector_eq(a, b, modulus, mu),
            },
        )?;

        unit.log_line(format_args!(
            "{}: {} residues mod {}",
            self.name(),
            bytes / RESIDUE_BYTES,
            modulus
        ));
        Ok(())
    }
}

/// Meta-driven elementwise kernels with scalar and vector right-hand sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementwiseProgram {
    Add,
    Sub,
    Mul,
}

const META_ELEMENTWISE_SYMBOLS: &[(&str, usize)] = &[(META, ElementwiseMeta::SIZE)];
const META_MOD_OPS_SYMBOLS: &[(&str, usize)] = &[(META, ModOpsMeta::SIZE)];

impl DpuProgram for ElementwiseProgram {
    fn name(&self) -> &'static str {
        match self {
            Self::Add => "add-mod",
            Self::Sub => "sub-mod",
            Self::Mul => "mult-mod",
        }
    }

    fn host_symbols(&self) -> &'static [(&'static str, usize)] {
        META_ELEMENTWISE_SYMBOLS
    }

    fn run(&self, unit: &mut DpuUnit) -> Result<(), DeviceFault> {
        let meta = ElementwiseMeta::from_bytes(unit.symbol(META)?)?;
        let len = meta.op1.size as usize;
        let a = meta.op1.start as usize;
        let res = meta.res.start as usize;
        let kernel = meta.kernel;
        if !kernel.is_scalar() && meta.op2.size != meta.op1.size {
            return Err(DeviceFault::BadSymbol(META.to_string()));
        }
        if !kernel.is_in_place() && meta.res.size != meta.op1.size {
            return Err(DeviceFault::BadSymbol(META.to_string()));
        }

        let spec = match kernel {
            ElementwiseKernel::Scalar => StreamSpec::out_of_place(a, None, res, len),
            ElementwiseKernel::ScalarEq => StreamSpec::in_place(a, None, len),
            ElementwiseKernel::Vector => {
                StreamSpec::out_of_place(a, Some(meta.op2.start as usize), res, len)
            }
            ElementwiseKernel::VectorEq => StreamSpec::in_place(a, Some(meta.op2.start as usize), len),
        };

        let family = *self;
        let (m, scalar, host_mu) = (meta.modulus, meta.op2.start, meta.mu);
        unit.stream(
            spec,
            move || {
                let m = device_modulus(m)?;
                Ok(match family {
                    Self::Mul if host_mu != 0 => host_mu,
                    Self::Mul => compute_mu(m),
                    _ => 0,
                })
            },
            move |mu, a, b, res| {
                use ElementwiseKernel::*;
                match (family, kernel) {
                    (Self::Add, Scalar) => ew::add_scalar(a, scalar, m, res),
                    (Self::Add, ScalarEq) => ew::add_scalar_eq(a, scalar, m),
                    (Self::Add, Vector) => ew::add_vector(a, b, m, res),
                    (Self::Add, VectorEq) => ew::add_vector_eq(a, b, m),
                    (Self::Sub, Scalar) => ew::sub_scalar(a, scalar, m, res),
                    (Self::Sub, ScalarEq) => ew::sub_scalar_eq(a, scalar, m),
                    (Self::Sub, Vector) => ew::sub_vector(a, b, m, res),
                    (Self::Sub, VectorEq) => ew::sub_vector_eq(a, b, m),
                    (Self::Mul, Scalar) => ew::mul_scalar(a, scalar, m, mu, res),
                    (Self::Mul, ScalarEq) => ew::mul_scalar_eq(a, scalar, m, mu),
                    (Self::Mul, Vector) => ew::mul_vector(a, b, m, mu, res),
                    (Self::Mul, VectorEq) => ew::mul_vector_eq(a, b, m, mu),
                }
            },
        )?;

        unit.log_line(format_args!(
            "{}: {:?} over {} residues mod {}",
            self.name(),
            kernel,
            len / RESIDUE_BYTES,
            m
        ));
        Ok(())
    }
}

/// The multiplexed mod-ops program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModOpsProgram;

impl ModOpsProgram {
    fn validate(meta: &ModOpsMeta) -> Result<u64, DeviceFault> {
        let m = device_modulus(meta.modulus)?;
        match meta.kernel {
            ModKernel::SwitchModulus => {
                device_modulus(meta.p)?;
            }
            ModKernel::ModNormal | ModKernel::ModEq if meta.p != 2 => {
                device_modulus(meta.p)?;
            }
            ModKernel::MultiplyAndRound | ModKernel::MultiplyAndRoundEq if meta.q == 0 => {
                return Err(DeviceFault::DivisionByZero("multiply-and-round"));
            }
            ModKernel::DivideAndRound | ModKernel::DivideAndRoundEq if meta.p == 0 => {
                return Err(DeviceFault::DivisionByZero("divide-and-round"));
            }
            _ => {}
        }
        Ok(m)
    }
}

impl DpuProgram for ModOpsProgram {
    fn name(&self) -> &'static str {
        "mod-ops"
    }

    fn host_symbols(&self) -> &'static [(&'static str, usize)] {
        META_MOD_OPS_SYMBOLS
    }

    fn run(&self, unit: &mut DpuUnit) -> Result<(), DeviceFault> {
        let meta = ModOpsMeta::from_bytes(unit.symbol(META)?)?;
        let kernel = meta.kernel;
        let len = meta.op.size as usize;
        let a = meta.op.start as usize;
        let spec = if kernel.is_in_place() {
            StreamSpec::in_place(a, None, len)
        } else {
            if meta.res.size != meta.op.size {
                return Err(DeviceFault::BadSymbol(META.to_string()));
            }
            StreamSpec::out_of_place(a, None, meta.res.start as usize, len)
        };

        let (m, p, q) = (meta.modulus, meta.p, meta.q);
        unit.stream(
            spec,
            move || Self::validate(&meta),
            move |_, a, _b, res| {
                use ModKernel::*;
                match kernel {
                    SwitchModulus => ew::switch_modulus_eq(a, m, p),
                    ModNormal => ew::modulus(a, m, p, res),
                    ModEq => ew::modulus_eq(a, m, p),
                    ModByTwo => ew::mod_by_two(a, m, res),
                    ModByTwoEq => ew::mod_by_two_eq(a, m),
                    ModExp => ew::mod_exp_vector(a, p, m, res),
                    ModExpEq => ew::mod_exp_vector_eq(a, p, m),
                    ModInverse => ew::mod_inverse_vector(a, m, res),
                    ModInverseEq => ew::mod_inverse_vector_eq(a, m),
                    MultiplyAndRound => ew::multiply_and_round_vector(a, m, p, q, res),
                    MultiplyAndRoundEq => ew::multiply_and_round_vector_eq(a, m, p, q),
                    DivideAndRound => ew::divide_and_round_vector(a, m, p, res),
                    DivideAndRoundEq => ew::divide_and_round_vector_eq(a, m, p),
                }
            },
        )?;

        unit.log_line(format_args!(
            "mod-ops: {:?} over {} residues mod {} (p = {}, q = {})",
            kernel,
            len / RESIDUE_BYTES,
            m,
            p,
            q
        ));
        Ok(())
    }
}
