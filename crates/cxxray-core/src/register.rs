//! Architecture-agnostic register representation.
//!
//! Only the general purpose registers matter here: they carry call arguments,
//! which is what the dataflow collaborator is queried about.

use crate::{Architecture, Error};

/// A general purpose register.
///
/// Each register is identified by its architecture and a numeric ID. The ID
/// is architecture-specific and should be interpreted accordingly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Register {
    /// The architecture this register belongs to.
    pub arch: Architecture,
    /// Architecture-specific register ID.
    pub id: u16,
}

impl Register {
    /// Creates a new register.
    pub fn new(arch: Architecture, id: u16) -> Self {
        Self { arch, id }
    }

    /// Looks a register up by its canonical name.
    pub fn parse(arch: Architecture, name: &str) -> Result<Self, Error> {
        let lower = name.to_ascii_lowercase();
        names(arch)
            .iter()
            .position(|n| *n == lower)
            .map(|id| Self::new(arch, id as u16))
            .ok_or_else(|| Error::UnknownRegister {
                arch: arch.name(),
                name: name.to_string(),
            })
    }

    /// Returns the canonical name for this register.
    pub fn name(&self) -> &'static str {
        names(self.arch)
            .get(self.id as usize)
            .copied()
            .unwrap_or("unknown")
    }

    /// Returns the size of the register in bits.
    pub fn size(&self) -> u16 {
        (self.arch.pointer_size() * 8) as u16
    }
}

impl std::fmt::Display for Register {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn names(arch: Architecture) -> &'static [&'static str] {
    match arch {
        Architecture::X86_64 => X86_64_NAMES,
        Architecture::X86 => X86_NAMES,
        Architecture::Arm64 => ARM64_NAMES,
        Architecture::RiscV64 => RISCV_NAMES,
        Architecture::Mips32 => MIPS_NAMES,
    }
}

// Index is the register ID.
const X86_64_NAMES: &[&str] = &[
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];

const X86_NAMES: &[&str] = &["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"];

const ARM64_NAMES: &[&str] = &[
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13",
    "x14", "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26",
    "x27", "x28", "x29", "x30", "sp",
];

const RISCV_NAMES: &[&str] = &[
    "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3", "a4",
    "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4",
    "t5", "t6",
];

const MIPS_NAMES: &[&str] = &[
    "zero", "at", "v0", "v1", "a0", "a1", "a2", "a3", "t0", "t1", "t2", "t3", "t4", "t5", "t6",
    "t7", "s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7", "t8", "t9", "k0", "k1", "gp", "sp",
    "fp", "ra",
];
