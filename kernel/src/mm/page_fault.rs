//! Page fault entry
//!
//! Architecture trap handlers decode their fault state into a
//! [`PageFaultInfo`] and hand it to [`handle_user_fault`], which dispatches
//! into the faulting address space. Resolution errors are returned to the
//! trap handler, which turns them into a signal for the offending task.

use super::{vas::VirtualAddressSpace, VirtualAddress};
use crate::error::KernelResult;

/// The access kind that triggered a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

/// Fault state collected by the architecture trap handler.
#[derive(Debug, Clone, Copy)]
pub struct PageFaultInfo {
    /// The virtual address that caused the fault.
    pub faulting_address: u64,
    /// What kind of access faulted.
    pub access: AccessType,
    /// Whether the page was present (permission violation) or absent.
    pub was_present: bool,
    /// Whether the fault occurred while executing in user mode.
    pub was_user_mode: bool,
    /// Instruction pointer at the time of the fault.
    pub instruction_pointer: u64,
}

/// Resolve a user page fault against an address space.
///
/// The faulting address is truncated to its page; lazy materialization and
/// permission checks happen inside the address space.
pub fn handle_user_fault(space: &VirtualAddressSpace, info: PageFaultInfo) -> KernelResult<()> {
    space.page_fault(info.access, VirtualAddress::new(info.faulting_address))
}

/// Build a [`PageFaultInfo`] from an x86_64 page fault error code and CR2.
///
/// Error code bits (from Intel SDM):
/// - Bit 0 (P):    0 = not-present, 1 = protection violation
/// - Bit 1 (W/R):  0 = read, 1 = write
/// - Bit 2 (U/S):  0 = supervisor, 1 = user
/// - Bit 4 (I/D):  1 = instruction fetch
#[cfg(target_arch = "x86_64")]
pub fn from_x86_64(error_code: u64, cr2: u64, rip: u64) -> PageFaultInfo {
    let was_present = (error_code & 1) != 0;
    let was_write = (error_code & 2) != 0;
    let was_user = (error_code & 4) != 0;
    let was_fetch = (error_code & 16) != 0;

    let access = if was_fetch {
        AccessType::Execute
    } else if was_write {
        AccessType::Write
    } else {
        AccessType::Read
    };

    PageFaultInfo {
        faulting_address: cr2,
        access,
        was_present,
        was_user_mode: was_user,
        instruction_pointer: rip,
    }
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::*;

    #[test]
    fn test_decode_not_present_read() {
        let info = from_x86_64(0b0000, 0x4000_1000, 0x40_0000);
        assert_eq!(info.access, AccessType::Read);
        assert!(!info.was_present);
        assert!(!info.was_user_mode);
        assert_eq!(info.faulting_address, 0x4000_1000);
    }

    #[test]
    fn test_decode_user_write_protection() {
        let info = from_x86_64(0b0111, 0x1234, 0x40_0000);
        assert_eq!(info.access, AccessType::Write);
        assert!(info.was_present);
        assert!(info.was_user_mode);
    }

    #[test]
    fn test_decode_instruction_fetch_wins_over_write() {
        let info = from_x86_64(0b1_0010, 0x8000, 0x40_0000);
        assert_eq!(info.access, AccessType::Execute);
    }
}
