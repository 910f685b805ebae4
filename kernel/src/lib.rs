//! Ferrite kernel library
//!
//! Memory-management core of the Ferrite kernel: physical frame
//! allocation, hardware page tables, refcounted backing objects, and the
//! per-process virtual address space. The crate is `no_std`; unit tests
//! build for the host target with the standard harness and run the real
//! code paths over a test memory pool.

#![no_std]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

// Host target: link std so unit tests can allocate and use the standard
// test harness.
#[cfg(not(target_os = "none"))]
extern crate std;

// Bare metal uses the kernel heap; the host delegates to the system
// allocator.
#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap allocation failed: {:?}", layout);
}

pub mod arch;
pub mod config;
pub mod error;
pub mod logger;
pub mod mm;

pub use error::{KernelError, KernelResult};
pub use mm::{
    mapping::{MapFlags, MapRights},
    memory_object::MemoryObject,
    page_fault::{handle_user_fault, AccessType, PageFaultInfo},
    vas::{VirtualAddressSpace, VasStats},
    FrameNumber, PhysicalAddress, VirtualAddress,
};
