//! Guest address space: page-granular mappings with permission checks.

#![allow(clippy::cast_possible_truncation)]

/// Access classes and mapping-parameter validation.
pub mod access;
/// Mapped region records and permission flags.
pub mod map;

pub use access::{
    validate_mapping_range, validate_page_size, validate_scalar_width, AccessKind,
    DEFAULT_PAGE_SIZE, MAX_INSTRUCTION_BYTES,
};
pub use map::{Permissions, RegionInfo};

use std::collections::BTreeMap;

use map::MappedRegion;
use tracing::debug;

use crate::{EngineError, Fault, FaultKind};

/// Default cap on the total number of mapped bytes per context (4 GiB).
pub const DEFAULT_MEMORY_LIMIT: u64 = 1 << 32;

/// Ordered set of non-overlapping mapped regions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSpace {
    regions: BTreeMap<u64, MappedRegion>,
    page_size: u64,
    limit: u64,
    mapped: u64,
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE, DEFAULT_MEMORY_LIMIT)
    }
}

impl AddressSpace {
    /// Creates an empty address space. `page_size` must already be validated.
    #[must_use]
    pub const fn new(page_size: u64, limit: u64) -> Self {
        Self {
            regions: BTreeMap::new(),
            page_size,
            limit,
            mapped: 0,
        }
    }

    /// Mapping granule in bytes.
    #[must_use]
    pub const fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Total number of mapped bytes.
    #[must_use]
    pub const fn mapped_bytes(&self) -> u64 {
        self.mapped
    }

    /// Maps a zero-filled region.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidArgument`] for misaligned, empty,
    /// wrapping or overlapping ranges, and [`EngineError::ResourceExhausted`]
    /// when the mapping limit would be exceeded or allocation fails.
    pub fn map(&mut self, base: u64, size: u64, perms: Permissions) -> Result<(), EngineError> {
        validate_mapping_range(base, size, self.page_size)?;
        let end = u128::from(base) + u128::from(size);
        if self.overlapping(base, end).next().is_some() {
            return Err(EngineError::InvalidArgument(
                "mapping overlaps an existing region",
            ));
        }
        if self.mapped.saturating_add(size) > self.limit {
            return Err(EngineError::ResourceExhausted("memory limit reached"));
        }

        let region = MappedRegion::allocate(base, size, perms)?;
        self.regions.insert(base, region);
        self.mapped += size;
        debug!(base, size, ?perms, "mapped region");
        Ok(())
    }

    /// Removes a mapping; `base`/`size` must match one region exactly.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidArgument`] when no region matches.
    pub fn unmap(&mut self, base: u64, size: u64) -> Result<(), EngineError> {
        match self.regions.get(&base) {
            Some(region) if region.size() == size => {}
            _ => {
                return Err(EngineError::InvalidArgument(
                    "no mapping matches the requested range",
                ))
            }
        }
        self.regions.remove(&base);
        self.mapped -= size;
        debug!(base, size, "unmapped region");
        Ok(())
    }

    /// Changes permissions of a page-aligned range, splitting regions at its edges.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidArgument`] for misaligned ranges or when
    /// any byte of the range is unmapped.
    pub fn protect(&mut self, base: u64, size: u64, perms: Permissions) -> Result<(), EngineError> {
        validate_mapping_range(base, size, self.page_size)?;
        if self.check_range(base, size as usize, None).is_err() {
            return Err(EngineError::InvalidArgument(
                "protect range is not fully mapped",
            ));
        }

        let end = u128::from(base) + u128::from(size);
        let affected: Vec<u64> = self.overlapping(base, end).map(|r| r.base).collect();
        for region_base in affected {
            let Some(mut region) = self.regions.remove(&region_base) else {
                continue;
            };
            if region.base < base {
                let tail = region.split_at(base);
                self.regions.insert(region.base, region);
                region = tail;
            }
            if region.end_exclusive() > end {
                // `end` lies strictly inside this region, so it fits in u64.
                let tail = region.split_at(end as u64);
                self.regions.insert(tail.base, tail);
            }
            region.perms = perms;
            self.regions.insert(region.base, region);
        }
        debug!(base, size, ?perms, "changed protection");
        Ok(())
    }

    /// Lists mapped regions in ascending address order.
    #[must_use]
    pub fn regions(&self) -> Vec<RegionInfo> {
        self.regions.values().map(MappedRegion::info).collect()
    }

    /// Removes every mapping.
    pub fn clear(&mut self) {
        self.regions.clear();
        self.mapped = 0;
    }

    fn overlapping(&self, base: u64, end: u128) -> impl Iterator<Item = &MappedRegion> + '_ {
        let before = self
            .regions
            .range(..base)
            .next_back()
            .map(|(_, region)| region)
            .filter(move |region| region.end_exclusive() > u128::from(base));
        let inside = self
            .regions
            .range(base..)
            .map(|(_, region)| region)
            .take_while(move |region| u128::from(region.base) < end);
        before.into_iter().chain(inside)
    }

    fn region_at(&self, addr: u64) -> Option<&MappedRegion> {
        self.regions
            .range(..=addr)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.contains(addr))
    }

    fn region_at_mut(&mut self, addr: u64) -> Option<&mut MappedRegion> {
        self.regions
            .range_mut(..=addr)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.contains(addr))
    }

    /// Checks that `len` bytes at `addr` are mapped and, when `access` is
    /// given, carry its permission. Adjacent regions are treated as contiguous.
    fn check_range(&self, addr: u64, len: usize, access: Option<AccessKind>) -> Result<(), Fault> {
        let unmapped = FaultKind::unmapped(access.unwrap_or(AccessKind::Read));
        let mut cursor = addr;
        let mut remaining = len as u64;
        while remaining > 0 {
            let Some(region) = self.region_at(cursor) else {
                return Err(Fault::new(unmapped, addr));
            };
            if let Some(kind) = access {
                if !region.perms.contains(kind.required_permission()) {
                    return Err(Fault::new(FaultKind::protected(kind), addr));
                }
            }
            let available = region.size() - (cursor - region.base);
            let take = remaining.min(available);
            remaining -= take;
            if remaining > 0 {
                cursor = cursor
                    .checked_add(take)
                    .ok_or_else(|| Fault::new(unmapped, addr))?;
            }
        }
        Ok(())
    }

    fn copy_out(&self, addr: u64, buf: &mut [u8]) {
        let mut cursor = addr;
        let mut done = 0;
        while done < buf.len() {
            let Some(region) = self.region_at(cursor) else {
                return;
            };
            let offset = (cursor - region.base) as usize;
            let take = (buf.len() - done).min(region.data.len() - offset);
            buf[done..done + take].copy_from_slice(&region.data[offset..offset + take]);
            done += take;
            cursor = cursor.wrapping_add(take as u64);
        }
    }

    fn copy_in(&mut self, addr: u64, data: &[u8]) {
        let mut cursor = addr;
        let mut done = 0;
        while done < data.len() {
            let Some(region) = self.region_at_mut(cursor) else {
                return;
            };
            let offset = (cursor - region.base) as usize;
            let take = (data.len() - done).min(region.data.len() - offset);
            region.data[offset..offset + take].copy_from_slice(&data[done..done + take]);
            done += take;
            cursor = cursor.wrapping_add(take as u64);
        }
    }

    /// Guest read with permission check. Nothing is read on failure.
    ///
    /// # Errors
    ///
    /// Returns an unmapped or permission fault at `addr`.
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), Fault> {
        self.check_range(addr, buf.len(), Some(AccessKind::Read))?;
        self.copy_out(addr, buf);
        Ok(())
    }

    /// Guest write with permission check. Nothing is written on failure.
    ///
    /// # Errors
    ///
    /// Returns an unmapped or permission fault at `addr`.
    pub fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), Fault> {
        self.check_range(addr, data.len(), Some(AccessKind::Write))?;
        self.copy_in(addr, data);
        Ok(())
    }

    /// Guest instruction fetch with execute permission check.
    ///
    /// # Errors
    ///
    /// Returns an unmapped or permission fetch fault at `addr`.
    pub fn fetch(&self, addr: u64, buf: &mut [u8]) -> Result<(), Fault> {
        self.check_range(addr, buf.len(), Some(AccessKind::Fetch))?;
        self.copy_out(addr, buf);
        Ok(())
    }

    /// Fetches up to `buf.len()` executable bytes at `addr`, stopping at the
    /// first byte that cannot be fetched. Returns the number of bytes copied.
    ///
    /// # Errors
    ///
    /// Returns a fetch fault when not even the first byte is fetchable.
    pub fn fetch_window(&self, addr: u64, buf: &mut [u8]) -> Result<usize, Fault> {
        self.check_range(addr, 1, Some(AccessKind::Fetch))?;
        let mut len = 1;
        while len < buf.len() {
            let Some(next) = addr.checked_add(len as u64) else {
                break;
            };
            if self.check_range(next, 1, Some(AccessKind::Fetch)).is_err() {
                break;
            }
            len += 1;
        }
        self.copy_out(addr, &mut buf[..len]);
        Ok(len)
    }

    /// Checks a guest access without performing it.
    ///
    /// # Errors
    ///
    /// Returns the fault the access would raise.
    pub fn probe(&self, addr: u64, len: usize, access: AccessKind) -> Result<(), Fault> {
        self.check_range(addr, len, Some(access))
    }

    /// Host read: requires mapped bytes, ignores permissions.
    ///
    /// # Errors
    ///
    /// Returns a [`FaultKind::ReadUnmapped`] fault at `addr`.
    pub fn host_read(&self, addr: u64, buf: &mut [u8]) -> Result<(), Fault> {
        self.check_range(addr, buf.len(), None)?;
        self.copy_out(addr, buf);
        Ok(())
    }

    /// Host write: requires mapped bytes, ignores permissions.
    ///
    /// # Errors
    ///
    /// Returns a [`FaultKind::WriteUnmapped`] fault at `addr`.
    pub fn host_write(&mut self, addr: u64, data: &[u8]) -> Result<(), Fault> {
        self.check_range(addr, data.len(), None)
            .map_err(|fault| Fault::new(FaultKind::WriteUnmapped, fault.address))?;
        self.copy_in(addr, data);
        Ok(())
    }

    /// Reads a little-endian scalar of `width` bytes (1, 2, 4 or 8).
    ///
    /// # Errors
    ///
    /// Returns the fault raised by the underlying access.
    pub fn read_scalar(&self, addr: u64, width: u8, access: AccessKind) -> Result<u64, Fault> {
        let mut bytes = [0u8; 8];
        let buf = &mut bytes[..usize::from(width)];
        self.check_range(addr, buf.len(), Some(access))?;
        self.copy_out(addr, buf);
        Ok(u64::from_le_bytes(bytes))
    }

    /// Writes the low `width` bytes of `value` little-endian.
    ///
    /// # Errors
    ///
    /// Returns the fault raised by the underlying write.
    pub fn write_scalar(&mut self, addr: u64, width: u8, value: u64) -> Result<(), Fault> {
        let bytes = value.to_le_bytes();
        self.write(addr, &bytes[..usize::from(width)])
    }
}

#[cfg(test)]
mod tests {
    use super::{AddressSpace, Permissions, RegionInfo, DEFAULT_PAGE_SIZE};
    use crate::{AccessKind, EngineError, Fault, FaultKind};

    fn space() -> AddressSpace {
        AddressSpace::default()
    }

    #[test]
    fn map_rejects_overlap_and_accepts_adjacent_regions() {
        let mut mem = space();
        mem.map(0x1000, 0x2000, Permissions::ALL).unwrap();
        assert!(matches!(
            mem.map(0x2000, 0x1000, Permissions::ALL),
            Err(EngineError::InvalidArgument(_))
        ));
        assert!(matches!(
            mem.map(0x0000, 0x2000, Permissions::ALL),
            Err(EngineError::InvalidArgument(_))
        ));
        mem.map(0x3000, 0x1000, Permissions::READ).unwrap();
        mem.map(0x0000, 0x1000, Permissions::READ).unwrap();
        assert_eq!(mem.regions().len(), 3);
        assert_eq!(mem.mapped_bytes(), 0x4000);
    }

    #[test]
    fn map_enforces_memory_limit() {
        let mut mem = AddressSpace::new(DEFAULT_PAGE_SIZE, 0x2000);
        mem.map(0x0000, 0x2000, Permissions::ALL).unwrap();
        assert!(matches!(
            mem.map(0x4000, 0x1000, Permissions::ALL),
            Err(EngineError::ResourceExhausted(_))
        ));
        mem.unmap(0x0000, 0x2000).unwrap();
        mem.map(0x4000, 0x1000, Permissions::ALL).unwrap();
    }

    #[test]
    fn unmap_requires_exact_match() {
        let mut mem = space();
        mem.map(0x1000, 0x2000, Permissions::ALL).unwrap();
        assert!(mem.unmap(0x1000, 0x1000).is_err());
        assert!(mem.unmap(0x2000, 0x1000).is_err());
        mem.unmap(0x1000, 0x2000).unwrap();
        assert!(mem.regions().is_empty());
        assert_eq!(mem.mapped_bytes(), 0);
    }

    #[test]
    fn reads_and_writes_report_first_byte_on_fault() {
        let mut mem = space();
        mem.map(0x1000, 0x1000, Permissions::READ | Permissions::WRITE)
            .unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(
            mem.read(0x5000, &mut buf),
            Err(Fault::new(FaultKind::ReadUnmapped, 0x5000))
        );
        assert_eq!(
            mem.write(0x1FFE, &[1, 2, 3, 4]),
            Err(Fault::new(FaultKind::WriteUnmapped, 0x1FFE))
        );
        // The straddling write committed nothing.
        let mut tail = [0u8; 2];
        mem.read(0x1FFE, &mut tail).unwrap();
        assert_eq!(tail, [0, 0]);
    }

    #[test]
    fn permission_faults_are_reported_per_access_class() {
        let mut mem = space();
        mem.map(0x1000, 0x1000, Permissions::READ).unwrap();
        mem.map(0x2000, 0x1000, Permissions::EXEC).unwrap();

        assert_eq!(
            mem.write(0x1000, &[1]),
            Err(Fault::new(FaultKind::WriteProtected, 0x1000))
        );
        let mut byte = [0u8; 1];
        assert_eq!(
            mem.fetch(0x1000, &mut byte),
            Err(Fault::new(FaultKind::FetchProtected, 0x1000))
        );
        assert_eq!(
            mem.read(0x2000, &mut byte),
            Err(Fault::new(FaultKind::ReadProtected, 0x2000))
        );
        mem.fetch(0x2000, &mut byte).unwrap();
    }

    #[test]
    fn accesses_may_span_adjacent_regions() {
        let mut mem = space();
        mem.map(0x1000, 0x1000, Permissions::ALL).unwrap();
        mem.map(0x2000, 0x1000, Permissions::ALL).unwrap();
        mem.write_scalar(0x1FFE, 4, 0xDEAD_BEEF).unwrap();
        assert_eq!(
            mem.read_scalar(0x1FFE, 4, AccessKind::Read).unwrap(),
            0xDEAD_BEEF
        );

        mem.protect(0x2000, 0x1000, Permissions::READ).unwrap();
        assert_eq!(
            mem.write_scalar(0x1FFE, 4, 0),
            Err(Fault::new(FaultKind::WriteProtected, 0x1FFE))
        );
        assert_eq!(
            mem.read_scalar(0x1FFE, 4, AccessKind::Read).unwrap(),
            0xDEAD_BEEF
        );
    }

    #[test]
    fn protect_splits_regions_at_range_edges() {
        let mut mem = space();
        mem.map(0x1000, 0x4000, Permissions::ALL).unwrap();
        mem.host_write(0x2000, &[0x5A]).unwrap();
        mem.protect(0x2000, 0x1000, Permissions::READ).unwrap();

        assert_eq!(
            mem.regions(),
            vec![
                RegionInfo {
                    base: 0x1000,
                    size: 0x1000,
                    perms: Permissions::ALL
                },
                RegionInfo {
                    base: 0x2000,
                    size: 0x1000,
                    perms: Permissions::READ
                },
                RegionInfo {
                    base: 0x3000,
                    size: 0x2000,
                    perms: Permissions::ALL
                },
            ]
        );
        assert_eq!(mem.read_scalar(0x2000, 1, AccessKind::Read).unwrap(), 0x5A);
        assert_eq!(mem.mapped_bytes(), 0x4000);
    }

    #[test]
    fn protect_rejects_partially_unmapped_ranges() {
        let mut mem = space();
        mem.map(0x1000, 0x1000, Permissions::ALL).unwrap();
        assert!(mem.protect(0x1000, 0x2000, Permissions::READ).is_err());
        assert_eq!(mem.regions()[0].perms, Permissions::ALL);
    }

    #[test]
    fn host_accesses_ignore_permissions() {
        let mut mem = space();
        mem.map(0x1000, 0x1000, Permissions::empty()).unwrap();
        mem.host_write(0x1000, &[1, 2, 3]).unwrap();
        let mut buf = [0u8; 3];
        mem.host_read(0x1000, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(
            mem.host_write(0x1FFF, &[1, 2]),
            Err(Fault::new(FaultKind::WriteUnmapped, 0x1FFF))
        );
        assert_eq!(
            mem.host_read(0x3000, &mut buf),
            Err(Fault::new(FaultKind::ReadUnmapped, 0x3000))
        );
    }

    #[test]
    fn fetch_window_stops_at_first_unfetchable_byte() {
        let mut mem = space();
        mem.map(0x1000, 0x1000, Permissions::ALL).unwrap();
        mem.host_write(0x1FFC, &[0x90, 0x90, 0x90, 0x90]).unwrap();
        let mut buf = [0u8; 15];
        assert_eq!(mem.fetch_window(0x1FFC, &mut buf), Ok(4));
        assert_eq!(&buf[..4], &[0x90; 4]);
        assert_eq!(
            mem.fetch_window(0x2000, &mut buf),
            Err(Fault::new(FaultKind::FetchUnmapped, 0x2000))
        );
    }

    #[test]
    fn zero_length_accesses_always_succeed() {
        let mem = space();
        let mut empty = [0u8; 0];
        mem.read(0xDEAD_0000, &mut empty).unwrap();
    }
}
