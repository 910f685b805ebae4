//! Architecture support
//!
//! Privileged CPU operations the memory subsystem depends on. Only x86_64
//! has a real implementation; other architectures get inert stubs so the
//! portable code keeps compiling.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "x86_64")]
pub use x86_64::{flush_tlb_address, flush_tlb_all, read_page_table_root, write_page_table_root};

#[cfg(not(target_arch = "x86_64"))]
mod stub {
    /// No page-table root on this architecture yet.
    pub fn read_page_table_root() -> u64 {
        0
    }

    pub fn write_page_table_root(_root: u64) {}

    pub fn flush_tlb_address(_addr: u64) {}

    pub fn flush_tlb_all() {}
}

#[cfg(not(target_arch = "x86_64"))]
pub use stub::{flush_tlb_address, flush_tlb_all, read_page_table_root, write_page_table_root};
