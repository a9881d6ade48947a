use thiserror::Error;

use crate::memory::AccessKind;

/// Fault classes used for statistics aggregation and policy decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum FaultClass {
    /// Access to an address with no mapping.
    Unmapped,
    /// Access to a mapping that lacks the required permission.
    Protection,
    /// Decoder or executor rejected the instruction.
    Decode,
}

/// Runtime fault taxonomy raised while a run is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(u8)]
pub enum FaultKind {
    /// Data read from unmapped memory.
    #[error("read from unmapped memory")]
    ReadUnmapped = 0x01,
    /// Data write to unmapped memory.
    #[error("write to unmapped memory")]
    WriteUnmapped = 0x02,
    /// Instruction fetch from unmapped memory.
    #[error("instruction fetch from unmapped memory")]
    FetchUnmapped = 0x03,
    /// Data read from memory without read permission.
    #[error("read from non-readable memory")]
    ReadProtected = 0x04,
    /// Data write to memory without write permission.
    #[error("write to non-writable memory")]
    WriteProtected = 0x05,
    /// Instruction fetch from memory without execute permission.
    #[error("instruction fetch from non-executable memory")]
    FetchProtected = 0x06,
    /// Undecodable or unsupported instruction.
    #[error("invalid instruction")]
    InvalidInstruction = 0x07,
    /// Interrupt or CPU exception with no interrupt hook to receive it.
    #[error("unhandled interrupt")]
    UnhandledInterrupt = 0x08,
}

impl FaultKind {
    /// Converts a fault kind to its stable byte value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Converts a stable byte value back into a fault kind.
    #[must_use]
    pub const fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::ReadUnmapped),
            0x02 => Some(Self::WriteUnmapped),
            0x03 => Some(Self::FetchUnmapped),
            0x04 => Some(Self::ReadProtected),
            0x05 => Some(Self::WriteProtected),
            0x06 => Some(Self::FetchProtected),
            0x07 => Some(Self::InvalidInstruction),
            0x08 => Some(Self::UnhandledInterrupt),
            _ => None,
        }
    }

    /// Unmapped-memory fault for the given access class.
    #[must_use]
    pub const fn unmapped(access: AccessKind) -> Self {
        match access {
            AccessKind::Read => Self::ReadUnmapped,
            AccessKind::Write => Self::WriteUnmapped,
            AccessKind::Fetch => Self::FetchUnmapped,
        }
    }

    /// Permission fault for the given access class.
    #[must_use]
    pub const fn protected(access: AccessKind) -> Self {
        match access {
            AccessKind::Read => Self::ReadProtected,
            AccessKind::Write => Self::WriteProtected,
            AccessKind::Fetch => Self::FetchProtected,
        }
    }

    /// Access class of a memory fault, `None` for decode-class faults.
    #[must_use]
    pub const fn access(self) -> Option<AccessKind> {
        match self {
            Self::ReadUnmapped | Self::ReadProtected => Some(AccessKind::Read),
            Self::WriteUnmapped | Self::WriteProtected => Some(AccessKind::Write),
            Self::FetchUnmapped | Self::FetchProtected => Some(AccessKind::Fetch),
            Self::InvalidInstruction | Self::UnhandledInterrupt => None,
        }
    }

    /// Returns the statistics class for this fault kind.
    #[must_use]
    pub const fn class(self) -> FaultClass {
        match self {
            Self::ReadUnmapped | Self::WriteUnmapped | Self::FetchUnmapped => FaultClass::Unmapped,
            Self::ReadProtected | Self::WriteProtected | Self::FetchProtected => {
                FaultClass::Protection
            }
            Self::InvalidInstruction | Self::UnhandledInterrupt => FaultClass::Decode,
        }
    }

    /// Maps the fault onto the binding error-code surface.
    #[must_use]
    pub const fn error_code(self) -> ErrorCode {
        match self {
            Self::ReadUnmapped => ErrorCode::ReadUnmapped,
            Self::WriteUnmapped => ErrorCode::WriteUnmapped,
            Self::FetchUnmapped => ErrorCode::FetchUnmapped,
            Self::ReadProtected | Self::WriteProtected | Self::FetchProtected => {
                ErrorCode::InvalidPermission
            }
            Self::InvalidInstruction | Self::UnhandledInterrupt => ErrorCode::InvalidInstruction,
        }
    }
}

/// A runtime fault with the address that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[error("{kind} at {address:#x}")]
pub struct Fault {
    /// What went wrong.
    pub kind: FaultKind,
    /// First byte of the failing access, or the instruction address for
    /// decode-class faults.
    pub address: u64,
}

impl Fault {
    /// Creates a fault record.
    #[must_use]
    pub const fn new(kind: FaultKind, address: u64) -> Self {
        Self { kind, address }
    }
}

/// Closed error-code enumeration surfaced to binding layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(u32)]
pub enum ErrorCode {
    /// Success.
    Ok = 0,
    /// Read from unmapped memory.
    ReadUnmapped = 1,
    /// Write to unmapped memory.
    WriteUnmapped = 2,
    /// Fetch from unmapped memory.
    FetchUnmapped = 3,
    /// Access violated mapping permissions.
    InvalidPermission = 4,
    /// Undecodable or unsupported instruction.
    InvalidInstruction = 5,
    /// Invalid parameter or handle.
    InvalidArgument = 6,
    /// Memory or hook capacity exhausted.
    ResourceExhausted = 7,
    /// Context is already executing.
    AlreadyRunning = 8,
}

impl ErrorCode {
    /// Converts the code to its stable numeric value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Converts a stable numeric value back into an error code.
    #[must_use]
    pub const fn from_u32(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Ok),
            1 => Some(Self::ReadUnmapped),
            2 => Some(Self::WriteUnmapped),
            3 => Some(Self::FetchUnmapped),
            4 => Some(Self::InvalidPermission),
            5 => Some(Self::InvalidInstruction),
            6 => Some(Self::InvalidArgument),
            7 => Some(Self::ResourceExhausted),
            8 => Some(Self::AlreadyRunning),
            _ => None,
        }
    }

    /// Collapses a result into its error code.
    #[must_use]
    pub const fn of<T>(result: &Result<T, EngineError>) -> Self {
        match result {
            Ok(_) => Self::Ok,
            Err(err) => err.code(),
        }
    }
}

/// Errors returned by engine operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum EngineError {
    /// A run terminated with a runtime fault.
    #[error("emulation fault: {0}")]
    Fault(#[from] Fault),
    /// A parameter, handle or identifier was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Memory or hook capacity was exhausted.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),
    /// `start` was called while the context was executing.
    #[error("emulation is already running")]
    AlreadyRunning,
}

impl EngineError {
    /// Maps this error onto the binding error-code surface.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Fault(fault) => fault.kind.error_code(),
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
            Self::AlreadyRunning => ErrorCode::AlreadyRunning,
        }
    }

    /// Returns the fault when this error is a runtime fault.
    #[must_use]
    pub const fn fault(&self) -> Option<Fault> {
        match self {
            Self::Fault(fault) => Some(*fault),
            Self::InvalidArgument(_) | Self::ResourceExhausted(_) | Self::AlreadyRunning => None,
        }
    }
}
