/// Host-populated parameter blocks and the symbol names device programs expose.
///
/// Every block has a fixed little-endian layout so the host can broadcast it
/// as raw bytes into a unit's WRAM symbol. Layouts mirror C structs with
/// natural alignment: an [`Operand`] is a `u64` start plus a `u32` size padded
/// to 16 bytes.
use std::io::{Read, Write};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};

use super::DeviceFault;

/// Base of the MRAM heap; transfers to this target address unit memory.
pub const DPU_MRAM_HEAP_POINTER_NAME: &str = "__sys_used_mram_end";
/// Per-unit tower modulus read by the tower kernels.
pub const MRAM_MODULUS: &str = "mram_modulus";
/// Byte length of operand A (operand B follows immediately).
pub const DATA_COPIED_IN_BYTES: &str = "data_copied_in_bytes";
/// Parameter block of the meta-driven kernels.
pub const META: &str = "meta";

/// Size in bytes of one residue in unit memory.
pub const RESIDUE_BYTES: usize = std::mem::size_of::<u64>();

/// Encodes residues as little-endian bytes.
pub fn encode_residues(values: &[u64]) -> Vec<u8> {
    let mut bytes = vec![0u8; values.len() * RESIDUE_BYTES];
    LittleEndian::write_u64_into(values, &mut bytes);
    bytes
}

/// Decodes little-endian bytes into residues. Trailing partial words are ignored.
pub fn decode_residues(bytes: &[u8]) -> Vec<u64> {
    let words = bytes.len() / RESIDUE_BYTES;
    let mut values = vec![0u64; words];
    LittleEndian::read_u64_into(&bytes[..words * RESIDUE_BYTES], &mut values);
    values
}

/// A region of unit memory: byte offset from the MRAM heap base and byte size.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Operand {
    pub start: u64,
    pub size: u32,
}

impl Operand {
    pub const SIZE: usize = 16;

    pub fn new(start: u64, size: u32) -> Self {
        Self { start, size }
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u64::<LittleEndian>(self.start)?;
        writer.write_u32::<LittleEndian>(self.size)?;
        writer.write_u32::<LittleEndian>(0)?;
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let start = reader.read_u64::<LittleEndian>()?;
        let size = reader.read_u32::<LittleEndian>()?;
        let _padding = reader.read_u32::<LittleEndian>()?;
        Ok(Self { start, size })
    }
}

/// Selector of the elementwise add/sub/mul kernels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ElementwiseKernel {
    /// `res = op1 (+) scalar`
    Scalar = 0,
    /// `op1 = op1 (+) scalar`
    ScalarEq = 1,
    /// `res = op1 (+) op2`
    Vector = 2,
    /// `op1 = op1 (+) op2`
    VectorEq = 3,
}

impl ElementwiseKernel {
    pub fn is_in_place(self) -> bool {
        matches!(self, Self::ScalarEq | Self::VectorEq)
    }

    pub fn is_scalar(self) -> bool {
        matches!(self, Self::Scalar | Self::ScalarEq)
    }
}

impl TryFrom<u32> for ElementwiseKernel {
    type Error = DeviceFault;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Scalar),
            1 => Ok(Self::ScalarEq),
            2 => Ok(Self::Vector),
            3 => Ok(Self::VectorEq),
            other => Err(DeviceFault::UnknownKernel(other)),
        }
    }
}

/// Parameter block of the `add-mod`, `sub-mod` and `mult-mod` programs.
///
/// For scalar kernels `op2.start` carries the scalar itself. A zero `mu`
/// asks the device to compute the Barrett constant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ElementwiseMeta {
    pub op1: Operand,
    pub op2: Operand,
    pub res: Operand,
    pub modulus: u64,
    pub mu: u64,
    pub kernel: ElementwiseKernel,
}

impl ElementwiseMeta {
    pub const SIZE: usize = 3 * Operand::SIZE + 8 + 8 + 8;

    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        self.op1.write_to(writer)?;
        self.op2.write_to(writer)?;
        self.res.write_to(writer)?;
        writer.write_u64::<LittleEndian>(self.modulus)?;
        writer.write_u64::<LittleEndian>(self.mu)?;
        writer.write_u32::<LittleEndian>(self.kernel as u32)?;
        writer.write_u32::<LittleEndian>(0)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> std::io::Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(Self::SIZE);
        self.write_to(&mut bytes)?;
        Ok(bytes)
    }

    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self, DeviceFault> {
        let malformed = |_| DeviceFault::BadSymbol(META.to_string());
        let op1 = Operand::read_from(&mut bytes).map_err(malformed)?;
        let op2 = Operand::read_from(&mut bytes).map_err(malformed)?;
        let res = Operand::read_from(&mut bytes).map_err(malformed)?;
        let modulus = bytes.read_u64::<LittleEndian>().map_err(malformed)?;
        let mu = bytes.read_u64::<LittleEndian>().map_err(malformed)?;
        let kernel = bytes.read_u32::<LittleEndian>().map_err(malformed)?;
        Ok(Self {
            op1,
            op2,
            res,
            modulus,
            mu,
            kernel: ElementwiseKernel::try_from(kernel)?,
        })
    }
}

/// Selector of the multiplexed `mod-ops` program.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ModKernel {
    SwitchModulus = 0,
    ModNormal = 1,
    ModEq = 2,
    ModByTwo = 3,
    ModByTwoEq = 4,
    ModExp = 5,
    ModExpEq = 6,
    ModInverse = 7,
    ModInverseEq = 8,
    MultiplyAndRound = 9,
    MultiplyAndRoundEq = 10,
    DivideAndRound = 11,
    DivideAndRoundEq = 12,
}

impl ModKernel {
    pub const ALL: [ModKernel; 13] = [
        Self::SwitchModulus,
        Self::ModNormal,
        Self::ModEq,
        Self::ModByTwo,
        Self::ModByTwoEq,
        Self::ModExp,
        Self::ModExpEq,
        Self::ModInverse,
        Self::ModInverseEq,
        Self::MultiplyAndRound,
        Self::MultiplyAndRoundEq,
        Self::DivideAndRound,
        Self::DivideAndRoundEq,
    ];

    /// Whether the kernel overwrites its operand instead of writing `res`.
    pub fn is_in_place(self) -> bool {
        matches!(
            self,
            Self::SwitchModulus
                | Self::ModEq
                | Self::ModByTwoEq
                | Self::ModExpEq
                | Self::ModInverseEq
                | Self::MultiplyAndRoundEq
                | Self::DivideAndRoundEq
        )
    }
}

impl TryFrom<u32> for ModKernel {
    type Error = DeviceFault;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::ALL
            .get(value as usize)
            .copied()
            .ok_or(DeviceFault::UnknownKernel(value))
    }
}

/// Parameter block of the `mod-ops` program.
///
/// `modulus` is the current modulus of the operand. `p` and `q` are the
/// auxiliary parameters: the new modulus for switch/mod, the exponent for
/// mod-exp, the ratio `p/q` for multiply-and-round and the divisor (in `p`)
/// for divide-and-round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModOpsMeta {
    pub op: Operand,
    pub res: Operand,
    pub modulus: u64,
    pub p: u64,
    pub q: u64,
    pub kernel: ModKernel,
}

impl ModOpsMeta {
    pub const SIZE: usize = 2 * Operand::SIZE + 8 + 8 + 8 + 8;

    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        self.op.write_to(writer)?;
        self.res.write_to(writer)?;
        writer.write_u64::<LittleEndian>(self.modulus)?;
        writer.write_u64::<LittleEndian>(self.p)?;
        writer.write_u64::<LittleEndian>(self.q)?;
        writer.write_u32::<LittleEndian>(self.kernel as u32)?;
        writer.write_u32::<LittleEndian>(0)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> std::io::Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(Self::SIZE);
        self.write_to(&mut bytes)?;
        Ok(bytes)
    }

    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self, DeviceFault> {
        let malformed = |_| DeviceFault::BadSymbol(META.to_string());
        let op = Operand::read_from(&mut bytes).map_err(malformed)?;
        let res = Operand::read_from(&mut bytes).map_err(malformed)?;
        let modulus = bytes.read_u64::<LittleEndian>().map_err(malformed)?;
        let p = bytes.read_u64::<LittleEndian>().map_err(malformed)?;
        let q = bytes.read_u64::<LittleEndian>().map_err(malformed)?;
        let kernel = bytes.read_u32::<LittleEndian>().map_err(malformed)?;
        Ok(Self {
            op,
            res,
            modulus,
            p,
            q,
            kernel: ModKernel::try_from(kernel)?,
        })
    }
}
