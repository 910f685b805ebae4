//! Kernel heap bring-up
//!
//! The bare-metal global allocator is a `linked_list_allocator::LockedHeap`
//! (see `lib.rs`). This module wires it to a physical region during boot.
//! Host builds use the system allocator and never call in here.

/// Initialize the kernel heap over `[start, start + size)`.
///
/// # Safety
///
/// The range must be mapped, writable, unused by anything else, and handed
/// to the heap exactly once.
#[cfg(target_os = "none")]
pub unsafe fn init(start: usize, size: usize) {
    // SAFETY: forwarded caller contract.
    unsafe {
        crate::ALLOCATOR.lock().init(start as *mut u8, size);
    }
    log::info!("heap: {} KiB at {:#x}", size / 1024, start);
}

/// Bytes currently free in the kernel heap.
#[cfg(target_os = "none")]
pub fn free_bytes() -> usize {
    crate::ALLOCATOR.lock().free()
}
