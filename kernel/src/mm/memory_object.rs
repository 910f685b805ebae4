//! Backing memory objects
//!
//! A `MemoryObject` is a reference-counted container of physical pages.
//! Mappings hold `Arc` references to a window inside one object; the same
//! object can back windows in many address spaces at once. Pages are
//! committed lazily and stored sparsely: creation allocates only
//! bookkeeping, and a physical frame appears the first time a page is
//! touched by a fault or a kernel copy. An object may therefore span far
//! more pages than physical memory holds.

extern crate alloc;

use alloc::{collections::BTreeMap, sync::Arc};

use spin::Mutex;

use super::{
    frame_allocator::FRAME_ALLOCATOR, phys_to_virt_addr, FrameNumber, PAGE_SHIFT, PAGE_SIZE,
};
use crate::error::{KernelError, KernelResult};

/// A refcounted set of lazily committed physical pages.
pub struct MemoryObject {
    /// Logical size in pages; fixed at creation.
    page_count: usize,
    /// Committed pages, keyed by logical page index.
    pages: Mutex<BTreeMap<usize, FrameNumber>>,
}

impl MemoryObject {
    /// Create an object spanning `page_count` pages, none of them
    /// committed yet.
    pub fn new(page_count: usize) -> KernelResult<Arc<Self>> {
        if page_count == 0 {
            return Err(KernelError::InvalidArgument { name: "page_count" });
        }
        Ok(Arc::new(Self {
            page_count,
            pages: Mutex::new(BTreeMap::new()),
        }))
    }

    /// Number of pages this object spans.
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Physical frame backing logical page `index`, committing a
    /// zero-filled frame on first touch.
    ///
    /// `for_write` signals write intent; it is the hook where a
    /// copy-on-write object would fork a shared page before handing it
    /// out. This object serves shared pages in place.
    pub fn commit_page(&self, index: usize, for_write: bool) -> KernelResult<FrameNumber> {
        let _ = for_write;
        if index >= self.page_count {
            return Err(KernelError::OutOfBounds { addr: index as u64 });
        }
        let mut pages = self.pages.lock();
        if let Some(frame) = pages.get(&index) {
            return Ok(*frame);
        }

        let frame = FRAME_ALLOCATOR
            .lock()
            .allocate_frames(1)
            .map_err(|_| KernelError::OutOfMemory {
                requested: PAGE_SIZE,
            })?;
        // SAFETY: freshly allocated frame, reached through the physical
        // window.
        unsafe {
            core::ptr::write_bytes(
                phys_to_virt_addr(frame.as_u64() << PAGE_SHIFT) as *mut u8,
                0,
                PAGE_SIZE,
            );
        }
        pages.insert(index, frame);
        Ok(frame)
    }

    /// Copy bytes out of the object starting at `offset`.
    pub fn read(&self, offset: usize, dst: &mut [u8]) -> KernelResult<()> {
        self.copy(offset, dst.len(), false, |page_virt, chunk, pos| {
            // SAFETY: `page_virt` addresses a committed frame through the
            // window; `chunk` bytes fit in both the page and `dst`.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    page_virt as *const u8,
                    dst[pos..].as_mut_ptr(),
                    chunk,
                );
            }
        })
    }

    /// Copy bytes into the object starting at `offset`.
    pub fn write(&self, offset: usize, src: &[u8]) -> KernelResult<()> {
        self.copy(offset, src.len(), true, |page_virt, chunk, pos| {
            // SAFETY: `page_virt` addresses a committed frame through the
            // window; `chunk` bytes fit in both the page and `src`.
            unsafe {
                core::ptr::copy_nonoverlapping(src[pos..].as_ptr(), page_virt as *mut u8, chunk);
            }
        })
    }

    /// Shared page-by-page copy loop for `read`/`write`. The closure gets
    /// the window address of the current chunk, the chunk length, and the
    /// running offset into the caller's buffer.
    fn copy(
        &self,
        offset: usize,
        len: usize,
        for_write: bool,
        mut op: impl FnMut(u64, usize, usize),
    ) -> KernelResult<()> {
        if len == 0 {
            return Ok(());
        }
        let end = offset.checked_add(len).ok_or(KernelError::OutOfBounds {
            addr: offset as u64,
        })?;
        if end > self.page_count * PAGE_SIZE {
            return Err(KernelError::OutOfBounds {
                addr: offset as u64,
            });
        }

        let mut pos = 0;
        while pos < len {
            let byte = offset + pos;
            let page = byte / PAGE_SIZE;
            let page_offset = byte % PAGE_SIZE;
            let chunk = (PAGE_SIZE - page_offset).min(len - pos);

            let frame = self.commit_page(page, for_write)?;
            let page_virt = phys_to_virt_addr(frame.as_u64() << PAGE_SHIFT) + page_offset as u64;
            op(page_virt, chunk, pos);
            pos += chunk;
        }
        Ok(())
    }
}

impl Drop for MemoryObject {
    fn drop(&mut self) {
        let pages = self.pages.get_mut();
        let mut allocator = FRAME_ALLOCATOR.lock();
        for frame in pages.values() {
            allocator.free_frames(*frame, 1).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::test_pool;
    use alloc::{vec, vec::Vec};

    #[test]
    fn test_zero_page_count_rejected() {
        assert_eq!(
            MemoryObject::new(0).err(),
            Some(KernelError::InvalidArgument { name: "page_count" })
        );
    }

    #[test]
    fn test_commit_is_lazy_and_stable() {
        test_pool::init();
        let object = MemoryObject::new(4).unwrap();
        assert_eq!(object.page_count(), 4);

        let first = object.commit_page(2, false).unwrap();
        let again = object.commit_page(2, true).unwrap();
        assert_eq!(first, again, "a committed page must keep its frame");

        let other = object.commit_page(3, false).unwrap();
        assert_ne!(first, other);
    }

    #[test]
    fn test_commit_out_of_bounds() {
        let object = MemoryObject::new(2).unwrap();
        assert_eq!(
            object.commit_page(2, false),
            Err(KernelError::OutOfBounds { addr: 2 })
        );
    }

    #[test]
    fn test_huge_object_costs_nothing_until_touched() {
        // A sparse object may span the whole of user space.
        let object = MemoryObject::new(1 << 35).unwrap();
        assert_eq!(object.page_count(), 1 << 35);
    }

    #[test]
    fn test_committed_pages_are_zeroed() {
        test_pool::init();
        let object = MemoryObject::new(1).unwrap();
        let mut buf = [0xAAu8; 64];
        object.read(100, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 64]);
    }

    #[test]
    fn test_write_read_round_trip_across_pages() {
        test_pool::init();
        let object = MemoryObject::new(3).unwrap();

        let data: Vec<u8> = (0..PAGE_SIZE + 123).map(|i| (i % 251) as u8).collect();
        let offset = PAGE_SIZE - 17;
        object.write(offset, &data).unwrap();

        let mut back = vec![0u8; data.len()];
        object.read(offset, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_copy_bounds_checked() {
        test_pool::init();
        let object = MemoryObject::new(1).unwrap();
        let mut buf = [0u8; 32];
        assert_eq!(
            object.read(PAGE_SIZE - 16, &mut buf),
            Err(KernelError::OutOfBounds {
                addr: (PAGE_SIZE - 16) as u64
            })
        );
        assert!(object.write(PAGE_SIZE, &[1]).is_err());
    }

    #[test]
    fn test_empty_copy_succeeds_anywhere() {
        let object = MemoryObject::new(1).unwrap();
        assert!(object.read(usize::MAX, &mut []).is_ok());
        assert!(object.write(usize::MAX, &[]).is_ok());
    }
}
