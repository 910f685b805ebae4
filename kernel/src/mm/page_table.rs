//! Hardware page table
//!
//! Four-level x86_64 paging structures and the walker that installs and
//! removes leaf entries. All tables are reached through the kernel's
//! linear physical-memory window, so the walker works on any root, not
//! just the active one.

use core::ops::{Index, IndexMut};

use super::{
    frame_allocator::FRAME_ALLOCATOR, mapping::MapRights, phys_to_virt_addr, FrameNumber,
    VirtualAddress, PAGE_SHIFT, PAGE_SIZE,
};
use crate::error::{KernelError, KernelResult};

/// Number of entries in a page table
pub const PAGE_TABLE_ENTRIES: usize = 512;

/// Physical-address bits of a page table entry.
const ENTRY_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Flag bits of a page table entry (low attribute bits plus NX).
const ENTRY_FLAGS_MASK: u64 = 0x8000_0000_0000_0FFF;

/// First kernel-half slot in the top-level table. Entries from here up are
/// shared across address spaces.
pub const KERNEL_L4_START: usize = 256;

/// Hardware page table entry flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags(pub u64);

impl PageFlags {
    pub const PRESENT: Self = Self(1 << 0);
    pub const WRITABLE: Self = Self(1 << 1);
    pub const USER: Self = Self(1 << 2);
    pub const WRITE_THROUGH: Self = Self(1 << 3);
    pub const NO_CACHE: Self = Self(1 << 4);
    pub const ACCESSED: Self = Self(1 << 5);
    pub const DIRTY: Self = Self(1 << 6);
    pub const HUGE: Self = Self(1 << 7);
    pub const GLOBAL: Self = Self(1 << 8);
    pub const NO_EXECUTE: Self = Self(1 << 63);

    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Leaf-entry flags for a user mapping with the given rights.
    pub fn from_rights(rights: MapRights) -> Self {
        let mut flags = Self::PRESENT | Self::USER;
        if rights.contains(MapRights::WRITE) {
            flags = flags | Self::WRITABLE;
        }
        if !rights.contains(MapRights::EXECUTE) {
            flags = flags | Self::NO_EXECUTE;
        }
        flags
    }
}

impl core::ops::BitOr for PageFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Page table entry
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct PageTableEntry {
    entry: u64,
}

impl PageTableEntry {
    pub const fn empty() -> Self {
        Self { entry: 0 }
    }

    pub const fn is_present(&self) -> bool {
        self.entry & PageFlags::PRESENT.0 != 0
    }

    /// Physical frame this entry points to, if present.
    pub fn frame(&self) -> Option<FrameNumber> {
        if self.is_present() {
            Some(FrameNumber::new((self.entry & ENTRY_ADDR_MASK) >> PAGE_SHIFT))
        } else {
            None
        }
    }

    pub const fn flags(&self) -> PageFlags {
        PageFlags(self.entry & ENTRY_FLAGS_MASK)
    }

    pub fn set(&mut self, frame: FrameNumber, flags: PageFlags) {
        self.entry = (frame.as_u64() << PAGE_SHIFT) | flags.0;
    }

    pub fn clear(&mut self) {
        self.entry = 0;
    }
}

/// A page table with 512 entries
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; PAGE_TABLE_ENTRIES],
}

impl PageTable {
    pub fn zero(&mut self) {
        for entry in &mut self.entries {
            entry.clear();
        }
    }
}

impl Index<usize> for PageTable {
    type Output = PageTableEntry;

    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

/// Virtual address broken down into the four table indices
#[derive(Debug, Clone, Copy)]
pub struct VirtualAddressBreakdown {
    pub l4_index: usize,
    pub l3_index: usize,
    pub l2_index: usize,
    pub l1_index: usize,
}

impl VirtualAddressBreakdown {
    pub fn new(addr: VirtualAddress) -> Self {
        let addr = addr.as_u64();
        Self {
            l4_index: ((addr >> 39) & 0x1FF) as usize,
            l3_index: ((addr >> 30) & 0x1FF) as usize,
            l2_index: ((addr >> 21) & 0x1FF) as usize,
            l1_index: ((addr >> 12) & 0x1FF) as usize,
        }
    }
}

/// View a physical table frame through the physical-memory window.
///
/// # Safety
///
/// `phys` must be the physical address of a live page table, and the
/// caller must hold whatever lock makes access to that hierarchy
/// exclusive.
unsafe fn table_at<'a>(phys: u64) -> &'a mut PageTable {
    // SAFETY: the window maps all of physical memory; exclusivity is the
    // caller's contract.
    unsafe { &mut *(phys_to_virt_addr(phys) as *mut PageTable) }
}

/// Allocate and zero one frame for use as a page table.
fn alloc_table_frame() -> KernelResult<u64> {
    let frame = FRAME_ALLOCATOR
        .lock()
        .allocate_frames(1)
        .map_err(|_| KernelError::OutOfMemory {
            requested: PAGE_SIZE,
        })?;
    let phys = frame.as_u64() << PAGE_SHIFT;
    // SAFETY: freshly allocated frame, reached through the window.
    unsafe {
        core::ptr::write_bytes(phys_to_virt_addr(phys) as *mut u8, 0, PAGE_SIZE);
    }
    Ok(phys)
}

/// Allocate a new top-level page table and share the kernel half into it.
///
/// The kernel-half entries (and with them the physical-memory window,
/// which lives in the kernel half) are copied from the CPU's current root.
/// When no root is live (host builds), the table is left empty below the
/// copy, which is all the unit tests need.
pub fn alloc_root() -> KernelResult<u64> {
    let root = alloc_table_frame()?;

    let boot_root = crate::arch::read_page_table_root();
    if boot_root != 0 {
        // SAFETY: both roots are live page tables; the new one is not yet
        // published anywhere.
        let boot_l4 = unsafe { table_at(boot_root) };
        let new_l4 = unsafe { table_at(root) };
        for i in KERNEL_L4_START..PAGE_TABLE_ENTRIES {
            if boot_l4[i].is_present() {
                new_l4[i] = boot_l4[i];
            }
        }
    }

    Ok(root)
}

/// Free the user half of a page-table tree and the root itself.
///
/// Walks top-level entries below [`KERNEL_L4_START`] and releases every
/// intermediate table frame. Kernel-half entries are shared with every
/// other address space and are left alone. Leaf data frames are owned by
/// memory objects, never by the tree, so only table frames are freed.
///
/// The root must not be loaded on any CPU when this runs.
pub fn free_root_tree(root: u64) {
    if root == 0 {
        return;
    }

    // SAFETY: the root is no longer reachable by any CPU, so this walker
    // has exclusive access.
    let l4 = unsafe { table_at(root) };
    for l4_idx in 0..KERNEL_L4_START {
        let Some(l3_frame) = l4[l4_idx].frame() else {
            continue;
        };
        let l3 = unsafe { table_at(l3_frame.as_u64() << PAGE_SHIFT) };
        for l3_idx in 0..PAGE_TABLE_ENTRIES {
            let entry = l3[l3_idx];
            if !entry.is_present() || entry.flags().contains(PageFlags::HUGE) {
                continue;
            }
            let l2_frame = entry.frame().unwrap();
            let l2 = unsafe { table_at(l2_frame.as_u64() << PAGE_SHIFT) };
            for l2_idx in 0..PAGE_TABLE_ENTRIES {
                let entry = l2[l2_idx];
                if !entry.is_present() || entry.flags().contains(PageFlags::HUGE) {
                    continue;
                }
                let l1_frame = entry.frame().unwrap();
                FRAME_ALLOCATOR.lock().free_frames(l1_frame, 1).ok();
            }
            FRAME_ALLOCATOR.lock().free_frames(l2_frame, 1).ok();
        }
        FRAME_ALLOCATOR.lock().free_frames(l3_frame, 1).ok();
    }

    FRAME_ALLOCATOR
        .lock()
        .free_frames(FrameNumber::new(root >> PAGE_SHIFT), 1)
        .ok();
}

/// Walker over one page-table tree
pub struct PageMapper {
    l4: *mut PageTable,
}

impl PageMapper {
    /// Bind a walker to a page-table root.
    ///
    /// # Safety
    ///
    /// `root` must be the physical address of a live top-level table, and
    /// the caller must serialize all access to that tree for the walker's
    /// lifetime.
    pub unsafe fn from_root(root: u64) -> Self {
        Self {
            l4: phys_to_virt_addr(root) as *mut PageTable,
        }
    }

    /// Install a leaf entry for `virt`, creating intermediate tables as
    /// needed. An existing entry is overwritten, which is how a mapping
    /// repoints a page after the backing object hands out a new frame.
    pub fn map_frame(
        &mut self,
        virt: VirtualAddress,
        frame: FrameNumber,
        flags: PageFlags,
    ) -> KernelResult<()> {
        let idx = VirtualAddressBreakdown::new(virt);
        // SAFETY: exclusivity per the from_root contract.
        let l4 = unsafe { &mut *self.l4 };

        let l3 = Self::child_or_create(&mut l4[idx.l4_index])?;
        let l2 = Self::child_or_create(&mut l3[idx.l3_index])?;
        let l1 = Self::child_or_create(&mut l2[idx.l2_index])?;

        l1[idx.l1_index].set(frame, flags | PageFlags::PRESENT);
        Ok(())
    }

    /// Remove the leaf entry for `virt`, returning the frame it pointed
    /// to.
    pub fn unmap_frame(&mut self, virt: VirtualAddress) -> KernelResult<FrameNumber> {
        let not_mapped = KernelError::NotMapped {
            addr: virt.as_u64(),
        };
        let idx = VirtualAddressBreakdown::new(virt);
        // SAFETY: exclusivity per the from_root contract.
        let l4 = unsafe { &mut *self.l4 };

        let l3 = Self::child(&l4[idx.l4_index]).ok_or(not_mapped)?;
        let l2 = Self::child(&l3[idx.l3_index]).ok_or(not_mapped)?;
        let l1 = Self::child(&l2[idx.l2_index]).ok_or(not_mapped)?;

        let entry = &mut l1[idx.l1_index];
        let frame = entry.frame().ok_or(not_mapped)?;
        entry.clear();
        Ok(frame)
    }

    /// Look up the leaf entry for `virt`.
    pub fn translate(&self, virt: VirtualAddress) -> Option<(FrameNumber, PageFlags)> {
        let idx = VirtualAddressBreakdown::new(virt);
        // SAFETY: exclusivity per the from_root contract.
        let l4 = unsafe { &mut *self.l4 };

        let l3 = Self::child(&l4[idx.l4_index])?;
        let l2 = Self::child(&l3[idx.l3_index])?;
        let l1 = Self::child(&l2[idx.l2_index])?;

        let entry = &l1[idx.l1_index];
        Some((entry.frame()?, entry.flags()))
    }

    /// Rewrite the flag bits of a present leaf entry.
    pub fn update_flags(&mut self, virt: VirtualAddress, flags: PageFlags) -> KernelResult<()> {
        let not_mapped = KernelError::NotMapped {
            addr: virt.as_u64(),
        };
        let idx = VirtualAddressBreakdown::new(virt);
        // SAFETY: exclusivity per the from_root contract.
        let l4 = unsafe { &mut *self.l4 };

        let l3 = Self::child(&l4[idx.l4_index]).ok_or(not_mapped)?;
        let l2 = Self::child(&l3[idx.l3_index]).ok_or(not_mapped)?;
        let l1 = Self::child(&l2[idx.l2_index]).ok_or(not_mapped)?;

        let entry = &mut l1[idx.l1_index];
        let frame = entry.frame().ok_or(not_mapped)?;
        entry.set(frame, flags | PageFlags::PRESENT);
        Ok(())
    }

    fn child<'a>(entry: &PageTableEntry) -> Option<&'a mut PageTable> {
        let frame = entry.frame()?;
        // SAFETY: a present non-leaf entry points at a table frame the
        // walker owns exclusively.
        Some(unsafe { table_at(frame.as_u64() << PAGE_SHIFT) })
    }

    fn child_or_create<'a>(entry: &mut PageTableEntry) -> KernelResult<&'a mut PageTable> {
        if !entry.is_present() {
            let phys = alloc_table_frame()?;
            entry.set(
                FrameNumber::new(phys >> PAGE_SHIFT),
                PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER,
            );
        }
        Ok(Self::child(entry).unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::test_pool;

    #[test]
    fn test_breakdown_indices() {
        let idx = VirtualAddressBreakdown::new(VirtualAddress::new(0x7F80_4030_2000));
        assert_eq!(idx.l4_index, 255, "bits 47..39");
        assert_eq!(idx.l3_index, 1, "bits 38..30");
        assert_eq!(idx.l2_index, 1, "bits 29..21");
        assert_eq!(idx.l1_index, 0x102, "bits 20..12");
    }

    #[test]
    fn test_entry_round_trip() {
        let mut entry = PageTableEntry::empty();
        assert!(!entry.is_present());
        entry.set(
            FrameNumber::new(0x1234),
            PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::NO_EXECUTE,
        );
        assert!(entry.is_present());
        assert_eq!(entry.frame(), Some(FrameNumber::new(0x1234)));
        assert!(entry.flags().contains(PageFlags::WRITABLE));
        assert!(entry.flags().contains(PageFlags::NO_EXECUTE));
        entry.clear();
        assert!(!entry.is_present());
    }

    #[test]
    fn test_flags_from_rights() {
        let rw = PageFlags::from_rights(MapRights::READ | MapRights::WRITE);
        assert!(rw.contains(PageFlags::PRESENT | PageFlags::USER | PageFlags::WRITABLE));
        assert!(rw.contains(PageFlags::NO_EXECUTE));

        let rx = PageFlags::from_rights(MapRights::READ | MapRights::EXECUTE);
        assert!(!rx.contains(PageFlags::WRITABLE));
        assert!(!rx.contains(PageFlags::NO_EXECUTE));
    }

    #[test]
    fn test_map_translate_unmap() {
        test_pool::init();
        let root = alloc_root().expect("root allocation should succeed");
        let mut mapper = unsafe { PageMapper::from_root(root) };

        let virt = VirtualAddress::new(0x40_0000);
        let frame = FRAME_ALLOCATOR.lock().allocate_frames(1).unwrap();

        assert!(mapper.translate(virt).is_none());
        mapper
            .map_frame(virt, frame, PageFlags::from_rights(MapRights::READ))
            .expect("mapping a fresh page should succeed");

        let (found, flags) = mapper.translate(virt).expect("entry should be present");
        assert_eq!(found, frame);
        assert!(flags.contains(PageFlags::PRESENT | PageFlags::USER));

        let removed = mapper.unmap_frame(virt).expect("unmap should succeed");
        assert_eq!(removed, frame);
        assert!(mapper.translate(virt).is_none());
        assert_eq!(
            mapper.unmap_frame(virt),
            Err(KernelError::NotMapped {
                addr: virt.as_u64()
            })
        );

        FRAME_ALLOCATOR.lock().free_frames(frame, 1).unwrap();
        free_root_tree(root);
    }

    #[test]
    fn test_map_frame_overwrites_existing_entry() {
        test_pool::init();
        let root = alloc_root().unwrap();
        let mut mapper = unsafe { PageMapper::from_root(root) };

        let virt = VirtualAddress::new(0x80_0000);
        let first = FRAME_ALLOCATOR.lock().allocate_frames(1).unwrap();
        let second = FRAME_ALLOCATOR.lock().allocate_frames(1).unwrap();

        mapper
            .map_frame(virt, first, PageFlags::from_rights(MapRights::READ))
            .unwrap();
        mapper
            .map_frame(
                virt,
                second,
                PageFlags::from_rights(MapRights::READ | MapRights::WRITE),
            )
            .unwrap();

        let (found, flags) = mapper.translate(virt).unwrap();
        assert_eq!(found, second);
        assert!(flags.contains(PageFlags::WRITABLE));

        mapper.unmap_frame(virt).unwrap();
        let mut allocator = FRAME_ALLOCATOR.lock();
        allocator.free_frames(first, 1).unwrap();
        allocator.free_frames(second, 1).unwrap();
        drop(allocator);
        free_root_tree(root);
    }

    #[test]
    fn test_update_flags() {
        test_pool::init();
        let root = alloc_root().unwrap();
        let mut mapper = unsafe { PageMapper::from_root(root) };

        let virt = VirtualAddress::new(0xC0_0000);
        let frame = FRAME_ALLOCATOR.lock().allocate_frames(1).unwrap();
        mapper
            .map_frame(virt, frame, PageFlags::from_rights(MapRights::READ))
            .unwrap();

        mapper
            .update_flags(virt, PageFlags::from_rights(MapRights::READ | MapRights::WRITE))
            .expect("updating a present entry should succeed");
        let (found, flags) = mapper.translate(virt).unwrap();
        assert_eq!(found, frame);
        assert!(flags.contains(PageFlags::WRITABLE));

        assert_eq!(
            mapper.update_flags(VirtualAddress::new(0xD0_0000), PageFlags::PRESENT),
            Err(KernelError::NotMapped { addr: 0xD0_0000 })
        );

        mapper.unmap_frame(virt).unwrap();
        FRAME_ALLOCATOR.lock().free_frames(frame, 1).unwrap();
        free_root_tree(root);
    }
}
