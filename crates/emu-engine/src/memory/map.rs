//! Mapped region records and permission flags.

use crate::EngineError;

bitflags::bitflags! {
    /// Access permissions of a mapped region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u32 {
        /// Guest data reads are allowed.
        const READ = 1 << 0;
        /// Guest data writes are allowed.
        const WRITE = 1 << 1;
        /// Guest instruction fetches are allowed.
        const EXEC = 1 << 2;
        /// Read, write and execute.
        const ALL = Self::READ.bits() | Self::WRITE.bits() | Self::EXEC.bits();
    }
}

impl Permissions {
    /// Converts binding permission bits, rejecting unknown bits.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidArgument`] when `raw` has bits outside
    /// [`Permissions::ALL`].
    pub fn from_raw(raw: u32) -> Result<Self, EngineError> {
        Self::from_bits(raw).ok_or(EngineError::InvalidArgument("unknown permission bits"))
    }
}

impl Default for Permissions {
    fn default() -> Self {
        Self::ALL
    }
}

/// Host-visible description of one mapped region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionInfo {
    /// Inclusive start address.
    pub base: u64,
    /// Length in bytes.
    pub size: u64,
    /// Current permissions.
    pub perms: Permissions,
}

impl RegionInfo {
    /// Inclusive last address of the region.
    #[must_use]
    pub const fn last(&self) -> u64 {
        self.base + (self.size - 1)
    }
}

/// One mapped region and its owned backing storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MappedRegion {
    pub(crate) base: u64,
    pub(crate) perms: Permissions,
    pub(crate) data: Vec<u8>,
}

impl MappedRegion {
    pub(crate) fn allocate(base: u64, size: u64, perms: Permissions) -> Result<Self, EngineError> {
        let len = usize::try_from(size)
            .map_err(|_| EngineError::ResourceExhausted("mapping exceeds host address space"))?;
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| EngineError::ResourceExhausted("backing allocation failed"))?;
        data.resize(len, 0);
        Ok(Self { base, perms, data })
    }

    pub(crate) fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub(crate) fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr - self.base < self.size()
    }

    /// Exclusive end, widened so the top page of the address space does not wrap.
    pub(crate) fn end_exclusive(&self) -> u128 {
        self.base as u128 + self.size() as u128
    }

    pub(crate) fn info(&self) -> RegionInfo {
        RegionInfo {
            base: self.base,
            size: self.size(),
            perms: self.perms,
        }
    }

    /// Splits off the tail starting at `addr`, which must lie inside the region.
    pub(crate) fn split_at(&mut self, addr: u64) -> Self {
        let offset = (addr - self.base) as usize;
        let tail = self.data.split_off(offset);
        Self {
            base: addr,
            perms: self.perms,
            data: tail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{MappedRegion, Permissions};
    use crate::EngineError;

    #[test]
    fn permission_bits_are_validated() {
        assert_eq!(Permissions::from_raw(7), Ok(Permissions::ALL));
        assert_eq!(
            Permissions::from_raw(1 | 4),
            Ok(Permissions::READ | Permissions::EXEC)
        );
        assert!(matches!(
            Permissions::from_raw(8),
            Err(EngineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn region_containment_respects_bounds() {
        let region = MappedRegion::allocate(0x1000, 0x1000, Permissions::READ).unwrap();
        assert!(!region.contains(0x0FFF));
        assert!(region.contains(0x1000));
        assert!(region.contains(0x1FFF));
        assert!(!region.contains(0x2000));
        assert_eq!(region.info().last(), 0x1FFF);
    }

    #[test]
    fn top_page_end_does_not_wrap() {
        let region =
            MappedRegion::allocate(0xFFFF_FFFF_FFFF_F000, 0x1000, Permissions::ALL).unwrap();
        assert_eq!(region.end_exclusive(), 1u128 << 64);
        assert!(region.contains(u64::MAX));
    }

    #[test]
    fn split_moves_tail_bytes() {
        let mut region = MappedRegion::allocate(0x1000, 0x2000, Permissions::ALL).unwrap();
        region.data[0x1000] = 0xAB;
        let tail = region.split_at(0x2000);
        assert_eq!(region.size(), 0x1000);
        assert_eq!(tail.base, 0x2000);
        assert_eq!(tail.size(), 0x1000);
        assert_eq!(tail.data[0], 0xAB);
    }
}
