//! Virtual memory mappings
//!
//! A [`Mapping`] describes one contiguous virtual range backed by a window
//! into a [`MemoryObject`]. The [`MappingList`] keeps every mapping of an
//! address space sorted and non-overlapping; lookups binary-search it.
//! Mapping populations are small (tens of entries per process), so a flat
//! sorted vector beats a tree here.

extern crate alloc;

use alloc::{sync::Arc, vec::Vec};

use bitflags::bitflags;

use super::{memory_object::MemoryObject, PAGE_SHIFT, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};

bitflags! {
    /// Access rights of a mapping
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapRights: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

bitflags! {
    /// Mapping attributes
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u8 {
        /// Place at exactly the requested address, displacing an
        /// overlapping mapping. Only meaningful at installation time.
        const FIXED = 1 << 0;
    }
}

/// One contiguous virtual range backed by a memory-object window.
///
/// Cloning shares the backing object (its refcount goes up by one); the
/// interior-split path of `unmap` relies on this.
#[derive(Clone)]
pub struct Mapping {
    /// Backing object; this mapping owns one reference.
    pub(crate) object: Arc<MemoryObject>,
    /// First object page the window exposes.
    pub(crate) object_page: usize,
    /// Window length in pages.
    pub(crate) pages: usize,
    /// Base virtual page number.
    pub(crate) vpn: u64,
    /// Access rights.
    pub(crate) rights: MapRights,
    /// Attributes.
    pub(crate) flags: MapFlags,
}

impl Mapping {
    pub fn new(
        object: Arc<MemoryObject>,
        object_page: usize,
        pages: usize,
        vpn: u64,
        rights: MapRights,
        flags: MapFlags,
    ) -> Self {
        Self {
            object,
            object_page,
            pages,
            vpn,
            rights,
            flags,
        }
    }

    /// First byte of the range.
    pub fn start(&self) -> u64 {
        self.vpn << PAGE_SHIFT
    }

    /// One past the last byte of the range.
    pub fn end(&self) -> u64 {
        self.start() + (self.pages * PAGE_SIZE) as u64
    }

    /// Does `[addr, addr + len)` intersect this mapping?
    pub fn overlaps(&self, addr: u64, len: u64) -> bool {
        self.start() < addr.saturating_add(len) && addr < self.end()
    }

    /// A zero-length mapping is a removal marker, never stored across
    /// calls.
    pub fn is_empty(&self) -> bool {
        self.pages == 0
    }

    pub fn rights(&self) -> MapRights {
        self.rights
    }
}

impl core::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Mapping")
            .field("start", &format_args!("{:#x}", self.start()))
            .field("end", &format_args!("{:#x}", self.end()))
            .field("object_page", &self.object_page)
            .field("rights", &self.rights)
            .field("flags", &self.flags)
            .finish()
    }
}

/// Sorted, non-overlapping sequence of mappings.
#[derive(Default)]
pub struct MappingList {
    items: Vec<Mapping>,
}

impl MappingList {
    pub const fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> &Mapping {
        &self.items[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut Mapping {
        &mut self.items[index]
    }

    pub fn iter(&self) -> core::slice::Iter<'_, Mapping> {
        self.items.iter()
    }

    /// Index of the first mapping whose end lies above `addr`, or `None`
    /// past the last mapping. The result is a candidate only: `addr` may
    /// sit in the gap before it, so callers re-check with
    /// [`Mapping::overlaps`].
    pub fn find(&self, addr: u64) -> Option<usize> {
        let idx = self.items.partition_point(|m| m.end() <= addr);
        (idx < self.items.len()).then_some(idx)
    }

    /// Insert at `index`; the caller picks the position that keeps the
    /// list sorted.
    pub fn insert_at(&mut self, index: usize, mapping: Mapping) {
        self.items.insert(index, mapping);
    }

    pub fn remove_at(&mut self, index: usize) -> Mapping {
        self.items.remove(index)
    }

    pub fn push(&mut self, mapping: Mapping) {
        self.items.push(mapping);
    }

    /// Resolve the byte range `[addr, addr + len)` to the half-open index
    /// range of mappings that cover it. `len` must be non-zero. Fails
    /// when either endpoint is unmapped or the covering mappings leave a
    /// gap inside the range.
    pub fn span(&self, addr: u64, len: usize) -> KernelResult<(usize, usize)> {
        if self.items.is_empty() {
            return Err(KernelError::InvalidAddress { addr });
        }

        let beg = self
            .find(addr)
            .filter(|&i| self.items[i].overlaps(addr, 1))
            .ok_or(KernelError::InvalidAddress { addr })?;

        let last = addr
            .checked_add(len as u64 - 1)
            .ok_or(KernelError::InvalidAddress { addr })?;
        let end = self
            .find(last)
            .filter(|&i| self.items[i].overlaps(last, 1))
            .ok_or(KernelError::InvalidAddress { addr: last })?;

        for i in beg..end {
            if self.items[i].end() != self.items[i + 1].start() {
                return Err(KernelError::InvalidAddress {
                    addr: self.items[i].end(),
                });
            }
        }

        Ok((beg, end + 1))
    }

    /// Invariant verification: strict ordering, no overlap, non-empty
    /// mappings, everything inside user space. Call sites gate on
    /// `config::DEBUG_CHECKS`.
    pub fn assert_consistent(&self) {
        use super::{USER_VIRT_BASE, USER_VIRT_END};

        let mut prev_end = 0u64;
        for m in &self.items {
            assert!(m.pages >= 1, "stored mapping with zero pages");
            assert!(
                m.start() >= USER_VIRT_BASE && m.end() <= USER_VIRT_END,
                "mapping {:?} escapes user space",
                m
            );
            assert!(
                m.start() >= prev_end,
                "mapping {:?} overlaps or reorders its predecessor",
                m
            );
            prev_end = m.end();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(vpn: u64, pages: usize) -> Mapping {
        let object = MemoryObject::new(pages.max(1)).unwrap();
        Mapping::new(
            object,
            0,
            pages,
            vpn,
            MapRights::READ | MapRights::WRITE,
            MapFlags::empty(),
        )
    }

    fn list(ranges: &[(u64, usize)]) -> MappingList {
        let mut list = MappingList::new();
        for &(vpn, pages) in ranges {
            list.push(mapping(vpn, pages));
        }
        list
    }

    // --- Mapping tests ---

    #[test]
    fn test_mapping_derived_bounds() {
        let m = mapping(0x10, 4);
        assert_eq!(m.start(), 0x10000);
        assert_eq!(m.end(), 0x14000);
        assert!(!m.is_empty());
    }

    #[test]
    fn test_mapping_overlaps() {
        let m = mapping(0x10, 4); // [0x10000, 0x14000)
        assert!(m.overlaps(0x10000, 1));
        assert!(m.overlaps(0x13FFF, 1));
        assert!(m.overlaps(0xF000, 0x2000));
        assert!(!m.overlaps(0x14000, 1));
        assert!(!m.overlaps(0xF000, 0x1000));
        assert!(!m.overlaps(0x0, 0x10000));
    }

    #[test]
    fn test_mapping_clone_shares_object() {
        let m = mapping(0x10, 4);
        let clone = m.clone();
        assert_eq!(Arc::strong_count(&m.object), 2);
        drop(clone);
        assert_eq!(Arc::strong_count(&m.object), 1);
    }

    // --- MappingList tests ---

    #[test]
    fn test_find_on_empty_list() {
        let list = MappingList::new();
        assert_eq!(list.find(0x1000), None);
    }

    #[test]
    fn test_find_returns_first_end_above() {
        let list = list(&[(0x10, 4), (0x20, 2)]); // [0x10000,0x14000) [0x20000,0x22000)
        assert_eq!(list.find(0x0), Some(0));
        assert_eq!(list.find(0x10000), Some(0));
        assert_eq!(list.find(0x13FFF), Some(0));
        // In the gap: candidate is the next mapping, which does not overlap.
        let idx = list.find(0x18000).unwrap();
        assert_eq!(idx, 1);
        assert!(!list.get(idx).overlaps(0x18000, 1));
        assert_eq!(list.find(0x21FFF), Some(1));
        assert_eq!(list.find(0x22000), None);
    }

    #[test]
    fn test_insert_remove_keep_order() {
        let mut list = list(&[(0x10, 1), (0x30, 1)]);
        list.insert_at(1, mapping(0x20, 1));
        let starts: Vec<u64> = list.iter().map(|m| m.start()).collect();
        assert_eq!(starts, [0x10000, 0x20000, 0x30000]);

        let removed = list.remove_at(1);
        assert_eq!(removed.start(), 0x20000);
        assert_eq!(list.len(), 2);
        list.assert_consistent();
    }

    #[test]
    fn test_span_single_mapping() {
        let list = list(&[(0x10, 4)]);
        assert_eq!(list.span(0x10000, 0x4000).unwrap(), (0, 1));
        assert_eq!(list.span(0x11234, 0x100).unwrap(), (0, 1));
    }

    #[test]
    fn test_span_contiguous_mappings() {
        let list = list(&[(0x10, 2), (0x12, 2)]); // contiguous at 0x12000
        assert_eq!(list.span(0x11000, 0x2000).unwrap(), (0, 2));
    }

    #[test]
    fn test_span_rejects_gap() {
        let list = list(&[(0x10, 1), (0x12, 1)]); // hole at 0x11000
        assert_eq!(
            list.span(0x10000, 0x3000),
            Err(KernelError::InvalidAddress { addr: 0x11000 })
        );
    }

    #[test]
    fn test_span_rejects_unmapped_endpoints() {
        let list = list(&[(0x10, 2)]);
        assert!(list.span(0xF000, 0x1000).is_err());
        assert!(list.span(0x11000, 0x2000).is_err());
        assert!(MappingList::new().span(0x1000, 1).is_err());
    }

    #[test]
    #[should_panic(expected = "overlaps or reorders")]
    fn test_assert_consistent_catches_overlap() {
        let mut list = MappingList::new();
        list.push(mapping(0x10, 4));
        list.push(mapping(0x12, 1));
        list.assert_consistent();
    }
}
