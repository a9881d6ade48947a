//! Architecture and mode selection for an emulation context.

use crate::EngineError;

/// Architecture family implemented by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum Arch {
    /// Intel/AMD x86 family.
    #[default]
    X86,
}

impl Arch {
    /// Stable binding identifier.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        match self {
            Self::X86 => 4,
        }
    }

    /// Converts a binding identifier into an architecture.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidArgument`] for unknown or unsupported
    /// architecture identifiers.
    pub const fn from_u32(raw: u32) -> Result<Self, EngineError> {
        match raw {
            4 => Ok(Self::X86),
            _ => Err(EngineError::InvalidArgument("unsupported architecture")),
        }
    }
}

/// Processor mode of an x86 emulation context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum Mode {
    /// 16-bit mode with a flat address space.
    Real16,
    /// 32-bit flat protected mode.
    #[default]
    Protected32,
    /// 64-bit long mode.
    Long64,
}

impl Mode {
    /// Decoder bitness for this mode.
    #[must_use]
    pub const fn bitness(self) -> u32 {
        match self {
            Self::Real16 => 16,
            Self::Protected32 => 32,
            Self::Long64 => 64,
        }
    }

    /// Mask applied to linear addresses and the instruction pointer.
    #[must_use]
    pub const fn address_mask(self) -> u64 {
        match self {
            Self::Real16 => 0xFFFF,
            Self::Protected32 => 0xFFFF_FFFF,
            Self::Long64 => u64::MAX,
        }
    }

    /// Default stack slot width in bytes.
    #[must_use]
    pub const fn stack_width(self) -> u8 {
        match self {
            Self::Real16 => 2,
            Self::Protected32 => 4,
            Self::Long64 => 8,
        }
    }

    /// Stable binding identifier (the mode's bitness in bytes).
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.bitness() / 8
    }

    /// Converts a binding identifier into a mode.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidArgument`] for identifiers other than
    /// 2, 4 and 8.
    pub const fn from_u32(raw: u32) -> Result<Self, EngineError> {
        match raw {
            2 => Ok(Self::Real16),
            4 => Ok(Self::Protected32),
            8 => Ok(Self::Long64),
            _ => Err(EngineError::InvalidArgument("unsupported mode")),
        }
    }
}
