//! Access classes and mapping-parameter validation.

use crate::{EngineError, Permissions};

/// Default mapping granule (4 KiB pages).
pub const DEFAULT_PAGE_SIZE: u64 = 0x1000;

/// Longest x86 instruction encoding in bytes.
pub const MAX_INSTRUCTION_BYTES: usize = 15;

/// Class of a guest memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum AccessKind {
    /// Data read.
    Read,
    /// Data write.
    Write,
    /// Instruction fetch.
    Fetch,
}

impl AccessKind {
    /// Permission bit a region must carry to satisfy this access.
    #[must_use]
    pub const fn required_permission(self) -> Permissions {
        match self {
            Self::Read => Permissions::READ,
            Self::Write => Permissions::WRITE,
            Self::Fetch => Permissions::EXEC,
        }
    }
}

/// Validates `map`/`protect` parameters against the page granule.
///
/// # Errors
///
/// Returns [`EngineError::InvalidArgument`] when `size` is zero, when `base`
/// or `size` is not page aligned, or when the range wraps past the top of the
/// 64-bit address space.
pub fn validate_mapping_range(base: u64, size: u64, page_size: u64) -> Result<(), EngineError> {
    if size == 0 {
        return Err(EngineError::InvalidArgument("mapping size is zero"));
    }
    if base % page_size != 0 || size % page_size != 0 {
        return Err(EngineError::InvalidArgument(
            "mapping is not aligned to the page size",
        ));
    }
    if base.checked_add(size - 1).is_none() {
        return Err(EngineError::InvalidArgument(
            "mapping wraps the address space",
        ));
    }
    Ok(())
}

/// Validates a configured page size (non-zero power of two).
///
/// # Errors
///
/// Returns [`EngineError::InvalidArgument`] for zero or non power-of-two sizes.
pub const fn validate_page_size(page_size: u64) -> Result<(), EngineError> {
    if page_size.is_power_of_two() {
        Ok(())
    } else {
        Err(EngineError::InvalidArgument(
            "page size must be a power of two",
        ))
    }
}

/// Validates a scalar access width in bytes.
///
/// # Errors
///
/// Returns [`EngineError::InvalidArgument`] for widths other than 1, 2, 4, 8.
pub const fn validate_scalar_width(width: u8) -> Result<(), EngineError> {
    match width {
        1 | 2 | 4 | 8 => Ok(()),
        _ => Err(EngineError::InvalidArgument("unsupported access width")),
    }
}
