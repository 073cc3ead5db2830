//! Architecture identification and properties.

/// Supported CPU architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Architecture {
    /// x86-64 / AMD64
    X86_64,
    /// 32-bit x86
    X86,
    /// ARM 64-bit (AArch64)
    Arm64,
    /// RISC-V 64-bit
    RiscV64,
    /// 32-bit MIPS (branch delay slots)
    Mips32,
}

impl Architecture {
    /// Returns the pointer size in bytes for this architecture.
    pub fn pointer_size(&self) -> usize {
        match self {
            Self::X86_64 | Self::Arm64 | Self::RiscV64 => 8,
            Self::X86 | Self::Mips32 => 4,
        }
    }

    /// Returns the name of this architecture.
    pub fn name(&self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::X86 => "x86",
            Self::Arm64 => "arm64",
            Self::RiscV64 => "riscv64",
            Self::Mips32 => "mips32",
        }
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Endianness {
    #[default]
    Little,
    Big,
}
