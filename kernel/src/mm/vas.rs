//! Virtual address spaces
//!
//! A `VirtualAddressSpace` owns the mapping catalog of one process and
//! (lazily) a hardware page-table root. Installing a mapping touches only
//! the catalog; hardware entries materialize on first fault. Removing a
//! range eagerly drops its hardware entries so a released page can never
//! stay reachable. Kernel copies into and out of the space tunnel through
//! the backing memory objects, so the space does not need to be active on
//! any CPU.
//!
//! Capability sharing is `Arc` cloning: every holder sees the same
//! catalog and root. Dropping the last reference tears down the mapping
//! list (releasing each backing-object reference) and the page-table
//! tree; the space must not be loaded on any CPU at that point.

extern crate alloc;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use super::{
    mapping::{MapFlags, MapRights, Mapping, MappingList},
    memory_object::MemoryObject,
    page_fault::AccessType,
    page_table::{self, PageFlags, PageMapper},
    tlb::FlushBatch,
    VirtualAddress, PAGE_SHIFT, PAGE_SIZE, USER_VIRT_BASE, USER_VIRT_END,
};
use crate::{
    arch, config,
    error::{KernelError, KernelResult},
};

/// One user address space.
pub struct VirtualAddressSpace {
    /// Physical address of the page-table root (CR3 on x86_64); 0 until
    /// [`start`](Self::start) allocates one. Written under the mapping
    /// lock, read lock-free by `switch_to`.
    root: AtomicU64,
    /// The mapping catalog.
    mappings: Mutex<MappingList>,
}

/// Address-space statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VasStats {
    pub mapping_count: usize,
    pub mapped_pages: usize,
}

impl VirtualAddressSpace {
    /// Create an empty address space with no hardware root.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            root: AtomicU64::new(0),
            mappings: Mutex::new(MappingList::new()),
        })
    }

    /// Allocate and publish the page-table root on first call; later
    /// calls are no-ops.
    pub fn start(&self) -> KernelResult<()> {
        let _mappings = self.mappings.lock();
        if self.root.load(Ordering::Acquire) != 0 {
            return Ok(());
        }
        let root = page_table::alloc_root()?;
        self.root.store(root, Ordering::Release);
        if config::TRACE_VM_CALLS {
            log::trace!("vas: started with root {:#x}", root);
        }
        Ok(())
    }

    /// Load this space's page-table root on the current CPU.
    ///
    /// The space must have been started; faulting on a space whose root
    /// was never built is a kernel bug, not a recoverable error.
    pub fn switch_to(&self) {
        let root = self.root.load(Ordering::Acquire);
        assert!(root != 0, "switch to an address space that was never started");
        arch::write_page_table_root(root);
    }

    /// Physical page-table root, or 0 when not started.
    pub fn page_table_root(&self) -> u64 {
        self.root.load(Ordering::Acquire)
    }

    /// Install a mapping of `pages` pages of `object`, starting at object
    /// page `object_page`, and return its base address.
    ///
    /// With [`MapFlags::FIXED`] the range lands exactly at `vaddr`,
    /// replacing an overlapping mapping wholesale; otherwise `vaddr` is a
    /// hint and the first sufficient gap wins. The object reference is
    /// consumed: on any failure it is released before returning.
    ///
    /// No hardware entries are written; pages materialize on first fault.
    /// `vaddr` must be page-aligned (caller contract).
    pub fn map(
        &self,
        object: Arc<MemoryObject>,
        object_page: usize,
        vaddr: VirtualAddress,
        pages: usize,
        rights: MapRights,
        flags: MapFlags,
    ) -> KernelResult<VirtualAddress> {
        if config::TRACE_VM_CALLS {
            log::trace!(
                "vas: map {:#x} pages={} rights={:?} flags={:?}",
                vaddr.as_u64(),
                pages,
                rights,
                flags
            );
        }
        if pages == 0 {
            return Err(KernelError::InvalidArgument { name: "pages" });
        }
        assert!(
            vaddr.is_page_aligned(),
            "map: unaligned address {:#x}",
            vaddr.as_u64()
        );
        Self::check_user_range(vaddr, pages)?;
        if object_page
            .checked_add(pages)
            .map_or(true, |end| end > object.page_count())
        {
            return Err(KernelError::OutOfBounds {
                addr: vaddr.as_u64(),
            });
        }

        let mut mappings = self.mappings.lock();
        let base = if flags.contains(MapFlags::FIXED) {
            Self::place_fixed(&mut mappings, object, object_page, vaddr, pages, rights, flags)?
        } else {
            Self::place_hint(&mut mappings, object, object_page, vaddr, pages, rights, flags)?
        };

        if config::DEBUG_CHECKS {
            mappings.assert_consistent();
        }
        if config::LOG_VM_STATS {
            log::debug!("vas: {:?}", Self::stats_of(&mappings));
        }
        Ok(base)
    }

    /// Remove `[vaddr, vaddr + pages * 4096)` from the space. Mappings
    /// partially covered by the range are trimmed or split; fully covered
    /// ones are dropped. Hardware entries for the range are removed
    /// eagerly and the local TLB flushed. Unmapping an already-empty
    /// range is a no-op, so the operation is idempotent.
    pub fn unmap(&self, vaddr: VirtualAddress, pages: usize) -> KernelResult<()> {
        if config::TRACE_VM_CALLS {
            log::trace!("vas: unmap {:#x} pages={}", vaddr.as_u64(), pages);
        }
        assert!(
            vaddr.is_page_aligned(),
            "unmap: unaligned address {:#x}",
            vaddr.as_u64()
        );
        if pages == 0 {
            return Ok(());
        }
        Self::check_user_range(vaddr, pages)?;

        let b = vaddr.as_u64();
        let b_end = b + (pages * PAGE_SIZE) as u64;

        let mut mappings = self.mappings.lock();
        if let Some(mut i) = mappings.find(b) {
            while i < mappings.len() {
                let m = mappings.get_mut(i);
                let (a, a_end) = (m.start(), m.end());
                if b_end <= a || a_end <= b {
                    break;
                }
                if a < b && b_end < a_end {
                    // Hole in the middle: keep the head, split off a tail
                    // that shares the backing object.
                    let mut tail = m.clone();
                    m.pages -= ((a_end - b) >> PAGE_SHIFT) as usize;
                    let shift = ((b_end - a) >> PAGE_SHIFT) as usize;
                    tail.vpn += shift as u64;
                    tail.object_page += shift;
                    tail.pages -= shift;
                    mappings.insert_at(i + 1, tail);
                    break;
                }
                if b <= a && a_end <= b_end {
                    // Fully covered: flag for removal below.
                    m.pages = 0;
                } else if b <= a {
                    // Range covers the head: advance the base.
                    let shift = ((b_end - a) >> PAGE_SHIFT) as usize;
                    m.vpn += shift as u64;
                    m.object_page += shift;
                    m.pages -= shift;
                } else {
                    // Range covers the tail: shrink.
                    m.pages -= ((a_end - b) >> PAGE_SHIFT) as usize;
                }
                if mappings.get(i).is_empty() {
                    // Releases the mapping's object reference.
                    mappings.remove_at(i);
                } else {
                    i += 1;
                }
            }
        }

        // Eagerly drop hardware entries so released pages cannot stay
        // reachable through a stale PTE. Entries that were never
        // materialized simply are not there.
        let root = self.root.load(Ordering::Acquire);
        if root != 0 {
            // SAFETY: we hold the mapping lock, which serializes every
            // access to this space's tree.
            let mut mapper = unsafe { PageMapper::from_root(root) };
            let mut batch = FlushBatch::new();
            for p in 0..pages {
                let addr = b + (p * PAGE_SIZE) as u64;
                match mapper.unmap_frame(VirtualAddress::new(addr)) {
                    Ok(_) => batch.add(addr),
                    Err(err) => log::debug!("vas: no entry to unmap at {:#x}: {}", addr, err),
                }
            }
            batch.commit();
        }

        if config::DEBUG_CHECKS {
            mappings.assert_consistent();
        }
        if config::LOG_VM_STATS {
            log::debug!("vas: {:?}", Self::stats_of(&mappings));
        }
        Ok(())
    }

    /// Copy `dst.len()` bytes out of the space starting at `vaddr`,
    /// tunneling through the backing objects. Works on spaces that were
    /// never started or are active on another CPU. Fails with
    /// `InvalidAddress` unless the whole range is covered by mappings
    /// with no gap.
    pub fn read(&self, vaddr: VirtualAddress, dst: &mut [u8]) -> KernelResult<()> {
        if dst.is_empty() {
            return Ok(());
        }
        let mappings = self.mappings.lock();
        let (beg, end) = mappings.span(vaddr.as_u64(), dst.len())?;
        let mut addr = vaddr.as_u64();
        let mut pos = 0;
        for i in beg..end {
            let m = mappings.get(i);
            let offset = (addr - m.start()) as usize;
            let limit = (m.pages * PAGE_SIZE - offset).min(dst.len() - pos);
            m.object
                .read(m.object_page * PAGE_SIZE + offset, &mut dst[pos..pos + limit])?;
            pos += limit;
            addr += limit as u64;
        }
        Ok(())
    }

    /// Copy `src` into the space starting at `vaddr`. Same contract as
    /// [`read`](Self::read).
    pub fn write(&self, vaddr: VirtualAddress, src: &[u8]) -> KernelResult<()> {
        if src.is_empty() {
            return Ok(());
        }
        let mappings = self.mappings.lock();
        let (beg, end) = mappings.span(vaddr.as_u64(), src.len())?;
        let mut addr = vaddr.as_u64();
        let mut pos = 0;
        for i in beg..end {
            let m = mappings.get(i);
            let offset = (addr - m.start()) as usize;
            let limit = (m.pages * PAGE_SIZE - offset).min(src.len() - pos);
            m.object
                .write(m.object_page * PAGE_SIZE + offset, &src[pos..pos + limit])?;
            pos += limit;
            addr += limit as u64;
        }
        Ok(())
    }

    /// Resolve a page fault at `vaddr`: check the mapping's rights for
    /// the access kind, ask the backing object for the physical page
    /// (with write intent for write faults, which is where a
    /// copy-on-write object forks), install the hardware entry, and flush
    /// the local TLB.
    ///
    /// Faulting on a space that was never started is a kernel bug and
    /// asserts, as does a fault whose translation is already installed.
    pub fn page_fault(&self, access: AccessType, vaddr: VirtualAddress) -> KernelResult<()> {
        let vaddr = vaddr.align_down();
        let addr = vaddr.as_u64();
        if config::TRACE_VM_CALLS {
            log::trace!("vas: page fault {:?} at {:#x}", access, addr);
        }

        let mappings = self.mappings.lock();
        let idx = mappings
            .find(addr)
            .filter(|&i| mappings.get(i).overlaps(addr, 1))
            .ok_or(KernelError::NotMapped { addr })?;
        let m = mappings.get(idx);

        match access {
            AccessType::Read if !m.rights().contains(MapRights::READ) => {
                return Err(KernelError::ReadFault { addr });
            }
            AccessType::Write if !m.rights().contains(MapRights::WRITE) => {
                return Err(KernelError::WriteFault { addr });
            }
            AccessType::Execute if !m.rights().contains(MapRights::EXECUTE) => {
                return Err(KernelError::ExecFault { addr });
            }
            _ => {}
        }

        let root = self.root.load(Ordering::Acquire);
        assert!(root != 0, "page fault on an address space that was never started");

        let page_offset = ((addr - m.start()) >> PAGE_SHIFT) as usize;
        let frame = m
            .object
            .commit_page(m.object_page + page_offset, access == AccessType::Write)?;

        // SAFETY: the mapping lock serializes access to this space's tree.
        let mut mapper = unsafe { PageMapper::from_root(root) };
        if let Some((present, _)) = mapper.translate(vaddr) {
            // The rights check passed, so a fault with this very
            // translation installed cannot happen. A differing frame
            // means the object handed out a new page; fall through and
            // repoint the entry.
            assert!(present != frame, "spurious page fault at {:#x}", addr);
        }
        mapper.map_frame(vaddr, frame, PageFlags::from_rights(m.rights()))?;
        arch::flush_tlb_address(addr);
        Ok(())
    }

    /// Change the rights of the mappings covering `[vaddr, vaddr + pages
    /// * 4096)`. The range must line up with mapping boundaries (no
    /// partial-mapping protection changes). Live hardware entries are
    /// rewritten and flushed; entries not yet materialized pick up the
    /// new rights on their first fault.
    pub fn protect(
        &self,
        vaddr: VirtualAddress,
        pages: usize,
        rights: MapRights,
    ) -> KernelResult<()> {
        if config::TRACE_VM_CALLS {
            log::trace!(
                "vas: protect {:#x} pages={} rights={:?}",
                vaddr.as_u64(),
                pages,
                rights
            );
        }
        assert!(
            vaddr.is_page_aligned(),
            "protect: unaligned address {:#x}",
            vaddr.as_u64()
        );
        if pages == 0 {
            return Ok(());
        }
        Self::check_user_range(vaddr, pages)?;

        let len = pages * PAGE_SIZE;
        let mut mappings = self.mappings.lock();
        let (beg, end) = mappings.span(vaddr.as_u64(), len)?;
        if mappings.get(beg).start() != vaddr.as_u64()
            || mappings.get(end - 1).end() != vaddr.as_u64() + len as u64
        {
            return Err(KernelError::InvalidArgument { name: "range" });
        }

        for i in beg..end {
            mappings.get_mut(i).rights = rights;
        }

        let root = self.root.load(Ordering::Acquire);
        if root != 0 {
            // SAFETY: the mapping lock serializes access to this space's
            // tree.
            let mut mapper = unsafe { PageMapper::from_root(root) };
            let mut batch = FlushBatch::new();
            let flags = PageFlags::from_rights(rights);
            for p in 0..pages {
                let addr = vaddr.as_u64() + (p * PAGE_SIZE) as u64;
                if mapper.update_flags(VirtualAddress::new(addr), flags).is_ok() {
                    batch.add(addr);
                }
            }
            batch.commit();
        }
        Ok(())
    }

    /// Current mapping statistics.
    pub fn stats(&self) -> VasStats {
        Self::stats_of(&self.mappings.lock())
    }

    fn stats_of(mappings: &MappingList) -> VasStats {
        VasStats {
            mapping_count: mappings.len(),
            mapped_pages: mappings.iter().map(|m| m.pages).sum(),
        }
    }

    /// Reject ranges that overflow or escape user space.
    fn check_user_range(vaddr: VirtualAddress, pages: usize) -> KernelResult<()> {
        let out_of_bounds = KernelError::OutOfBounds {
            addr: vaddr.as_u64(),
        };
        let len = (pages as u64)
            .checked_mul(PAGE_SIZE as u64)
            .ok_or(out_of_bounds)?;
        let end = vaddr.as_u64().checked_add(len).ok_or(out_of_bounds)?;
        if end > USER_VIRT_END {
            return Err(out_of_bounds);
        }
        Ok(())
    }

    /// Fixed placement: install at exactly `vaddr`. A mapping overlapping
    /// the new range is replaced wholesale, releasing its object
    /// reference.
    #[allow(clippy::too_many_arguments)]
    fn place_fixed(
        mappings: &mut MappingList,
        object: Arc<MemoryObject>,
        object_page: usize,
        vaddr: VirtualAddress,
        pages: usize,
        rights: MapRights,
        flags: MapFlags,
    ) -> KernelResult<VirtualAddress> {
        let addr = vaddr.as_u64();
        if addr == 0 {
            return Err(KernelError::InvalidAddress { addr });
        }
        let len = (pages * PAGE_SIZE) as u64;
        let mapping = Mapping::new(object, object_page, pages, vaddr.page_number(), rights, flags);

        match mappings.find(addr) {
            Some(idx) if mappings.get(idx).overlaps(addr, len) => {
                // Whole-slot displacement, even on partial overlap; the
                // old mapping's object reference drops here.
                *mappings.get_mut(idx) = mapping;
            }
            Some(idx) if mappings.get(idx).start() < addr => {
                mappings.insert_at(idx + 1, mapping);
            }
            Some(idx) => mappings.insert_at(idx, mapping),
            None => mappings.push(mapping),
        }
        Ok(vaddr)
    }

    /// Hint placement: take the first free gap that fits, searching from
    /// the gap holding `vaddr` toward the top of user space, then
    /// wrapping around to the gaps below. Wrapped candidates are placed
    /// flush against the following mapping.
    #[allow(clippy::too_many_arguments)]
    fn place_hint(
        mappings: &mut MappingList,
        object: Arc<MemoryObject>,
        object_page: usize,
        vaddr: VirtualAddress,
        pages: usize,
        rights: MapRights,
        flags: MapFlags,
    ) -> KernelResult<VirtualAddress> {
        if mappings.is_empty() {
            return Self::place_fixed(mappings, object, object_page, vaddr, pages, rights, flags);
        }

        let need = (pages * PAGE_SIZE) as u64;
        // First candidate: the gap holding the hint, or the gap right
        // after the mapping holding it.
        let start = match mappings.find(vaddr.as_u64()) {
            Some(mid) if mappings.get(mid).overlaps(vaddr.as_u64(), 1) => mid + 1,
            Some(mid) => mid,
            None => 0,
        };

        // The free gap preceding mapping `i`; past the last mapping the
        // gap runs to the top of user space.
        let gap = |mappings: &MappingList, i: usize| -> (u64, u64) {
            let base = if i == 0 {
                USER_VIRT_BASE
            } else {
                mappings.get(i - 1).end()
            };
            let limit = if i == mappings.len() {
                USER_VIRT_END
            } else {
                mappings.get(i).start()
            };
            (base, limit)
        };

        for i in start..=mappings.len() {
            let (base, limit) = gap(mappings, i);
            if limit - base >= need {
                return Self::place_fixed(
                    mappings,
                    object,
                    object_page,
                    VirtualAddress::new(base),
                    pages,
                    rights,
                    flags,
                );
            }
        }
        for i in 0..start {
            let (base, limit) = gap(mappings, i);
            if limit - base >= need {
                return Self::place_fixed(
                    mappings,
                    object,
                    object_page,
                    VirtualAddress::new(limit - need),
                    pages,
                    rights,
                    flags,
                );
            }
        }

        Err(KernelError::OutOfVirtualMemory { pages })
    }

    /// Snapshot of `(start, end, object_page)` per mapping, for tests.
    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> alloc::vec::Vec<(u64, u64, usize)> {
        self.mappings
            .lock()
            .iter()
            .map(|m| (m.start(), m.end(), m.object_page))
            .collect()
    }
}

impl Drop for VirtualAddressSpace {
    fn drop(&mut self) {
        // Mapping drops release the backing-object references; the tree
        // only ever owns table frames.
        let root = *self.root.get_mut();
        if root != 0 {
            page_table::free_root_tree(root);
        }
    }
}
