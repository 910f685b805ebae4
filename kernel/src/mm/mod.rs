//! Memory management
//!
//! Physical frame allocation, the hardware page table, backing memory
//! objects, and the per-process virtual address space built on top of
//! them.

pub mod frame_allocator;
pub mod heap;
pub mod mapping;
pub mod memory_object;
pub mod page_fault;
pub mod page_table;
pub mod tlb;
pub mod vas;

use core::sync::atomic::{AtomicU64, Ordering};

pub use frame_allocator::{FrameNumber, FRAME_ALLOCATOR};

/// Size of a page and of a physical frame, in bytes.
pub const PAGE_SIZE: usize = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u64 = 12;

/// Alias kept for call sites that talk about physical memory.
pub const FRAME_SIZE: usize = PAGE_SIZE;

/// First usable user-space address. The zero page stays unmapped so null
/// dereferences always fault.
pub const USER_VIRT_BASE: u64 = 0x1000;

/// End of user space (exclusive): the bottom half of the 48-bit canonical
/// address range.
pub const USER_VIRT_END: u64 = 0x8000_0000_0000;

/// Physical memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(pub u64);

impl PhysicalAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_frame(&self) -> FrameNumber {
        FrameNumber::new(self.0 >> PAGE_SHIFT)
    }
}

/// Virtual memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualAddress(pub u64);

impl VirtualAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Validate a raw user-supplied address: must be canonical and inside
    /// user space.
    pub const fn from_user(addr: u64) -> Option<Self> {
        if addr < USER_VIRT_END {
            Some(Self(addr))
        } else {
            None
        }
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Virtual page number (address with the page offset stripped).
    pub const fn page_number(&self) -> u64 {
        self.0 >> PAGE_SHIFT
    }

    /// Byte offset within the page.
    pub const fn page_offset(&self) -> usize {
        (self.0 & (PAGE_SIZE as u64 - 1)) as usize
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 & (PAGE_SIZE as u64 - 1) == 0
    }

    /// Round down to the containing page boundary.
    pub const fn align_down(&self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u64 - 1))
    }

    pub const fn add(&self, offset: u64) -> Self {
        Self(self.0 + offset)
    }
}

/// Offset of the kernel's linear mapping of physical memory. Published
/// once during platform bring-up; stays 0 on host builds where "physical"
/// addresses are directly dereferenceable.
static PHYS_MEM_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Translate a physical address into a kernel-accessible virtual address
/// through the linear physical-memory window.
pub fn phys_to_virt_addr(phys: u64) -> u64 {
    PHYS_MEM_OFFSET.load(Ordering::Acquire) + phys
}

/// Bring up the memory subsystem: publish the physical window offset and
/// hand the usable physical range to the frame allocator.
pub fn init(phys_mem_offset: u64, start_frame: FrameNumber, frame_count: usize) {
    PHYS_MEM_OFFSET.store(phys_mem_offset, Ordering::Release);
    FRAME_ALLOCATOR.lock().init(start_frame, frame_count);
    log::info!(
        "mm: {} frames usable starting at frame {}",
        frame_count,
        start_frame.as_u64()
    );
}

/// Test memory pool: a leaked, page-aligned host allocation handed to the
/// frame allocator so unit tests exercise real frame contents and real
/// page-table walks. "Physical" addresses are host pointers (window
/// offset 0).
#[cfg(test)]
pub(crate) mod test_pool {
    use super::*;

    /// 2048 pages = 8 MiB.
    const POOL_PAGES: usize = 2048;

    /// Initialize the shared pool exactly once across all tests.
    pub fn init() {
        use std::sync::Once;
        static ONCE: Once = Once::new();
        ONCE.call_once(|| {
            let layout = std::alloc::Layout::from_size_align(POOL_PAGES * PAGE_SIZE, PAGE_SIZE)
                .expect("pool layout");
            // SAFETY: layout has non-zero size; the allocation is leaked
            // and stays valid for the whole test process.
            let base = unsafe { std::alloc::alloc_zeroed(layout) };
            assert!(!base.is_null(), "test pool allocation failed");
            let start_frame = FrameNumber::new(base as u64 >> PAGE_SHIFT);
            FRAME_ALLOCATOR.lock().init(start_frame, POOL_PAGES);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_address_page_decomposition() {
        let addr = VirtualAddress::new(0x12345);
        assert_eq!(addr.page_number(), 0x12);
        assert_eq!(addr.page_offset(), 0x345);
        assert_eq!(addr.align_down(), VirtualAddress::new(0x12000));
        assert!(!addr.is_page_aligned());
        assert!(addr.align_down().is_page_aligned());
    }

    #[test]
    fn test_virtual_address_from_user() {
        assert_eq!(
            VirtualAddress::from_user(0x1000),
            Some(VirtualAddress::new(0x1000))
        );
        assert_eq!(
            VirtualAddress::from_user(USER_VIRT_END - 1),
            Some(VirtualAddress::new(USER_VIRT_END - 1))
        );
        assert_eq!(VirtualAddress::from_user(USER_VIRT_END), None);
        assert_eq!(VirtualAddress::from_user(0xFFFF_8000_0000_0000), None);
    }

    #[test]
    fn test_physical_address_frame_round_trip() {
        let addr = PhysicalAddress::new(0x5000);
        assert_eq!(addr.as_frame().as_u64(), 5);
        assert_eq!(addr.as_frame().as_addr(), addr);
    }
}
