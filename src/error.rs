//! Closed error taxonomy raised by stable hooks and the simulator kernel.
//!
//! Mirrors `original_source/pyv/exceptions.py` one-for-one, plus the kernel's
//! own oscillation guard (`FunctioningViolation`), which the fault-injection
//! harness treats as a catch-all (spec.md §7).

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Bits [1:0] of the instruction weren't `11`, the opcode wasn't
    /// recognized, or the funct3/funct7 combination is illegal for the
    /// opcode.
    IllegalInstruction { pc: u32, inst: u32 },
    /// The program counter exceeded the configured instruction-memory bound.
    PcOutOfBound { pc: u32 },
    /// A taken branch/jump target was not 4-byte aligned.
    InstructionAddressMisaligned { pc: u32 },
    /// A load or store hit an invalid memory address at tick time.
    SegmentationFault { addr: u32 },
    /// A memory access used a width outside of {1, 2, 4}.
    InvalidWidth { width: u32 },
    /// The propagation queue failed to reach a fixed point within the
    /// kernel's bounded iteration count: the module graph is oscillating.
    FunctioningViolation(String),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::IllegalInstruction { pc, inst } => write!(
                f,
                "Illegal instruction @ PC = 0x{pc:08X} detected: '0x{inst:08x}'"
            ),
            CoreError::PcOutOfBound { pc } => write!(f, "PC out of bound: {pc:08X}"),
            CoreError::InstructionAddressMisaligned { pc } => write!(
                f,
                "Target instruction address misaligned exception at PC = 0x{pc:08X}"
            ),
            CoreError::SegmentationFault { addr } => {
                write!(f, "Attempt to access invalid memory address: {addr:08X}")
            }
            CoreError::InvalidWidth { width } => write!(f, "Invalid memory width {width}"),
            CoreError::FunctioningViolation(msg) => write!(f, "functioning violation: {msg}"),
        }
    }
}

impl std::error::Error for CoreError {}

pub type CoreResult<T> = Result<T, CoreError>;
