//! Kernel error types
//!
//! A single value-error enum shared across the kernel. Errors carry enough
//! payload to diagnose the failing call without string formatting at the
//! failure site.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// A call argument was rejected before any state changed.
    InvalidArgument {
        name: &'static str,
    },
    /// The address itself is unusable (zero fixed placement, or a byte
    /// range not fully covered by mappings).
    InvalidAddress {
        addr: u64,
    },
    /// A range escapes user space or its backing object, including
    /// arithmetic overflow while computing the range end.
    OutOfBounds {
        addr: u64,
    },
    /// Physical frame or heap exhaustion.
    OutOfMemory {
        requested: usize,
    },
    /// No free virtual-address gap large enough for the request.
    OutOfVirtualMemory {
        pages: usize,
    },
    /// No mapping covers the address.
    NotMapped {
        addr: u64,
    },
    /// Read access to a mapping without read rights.
    ReadFault {
        addr: u64,
    },
    /// Write access to a mapping without write rights.
    WriteFault {
        addr: u64,
    },
    /// Instruction fetch from a mapping without execute rights.
    ExecFault {
        addr: u64,
    },
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument { name } => write!(f, "Invalid argument '{}'", name),
            Self::InvalidAddress { addr } => write!(f, "Invalid address: {:#x}", addr),
            Self::OutOfBounds { addr } => write!(f, "Range out of bounds at {:#x}", addr),
            Self::OutOfMemory { requested } => {
                write!(f, "Out of memory: requested {} bytes", requested)
            }
            Self::OutOfVirtualMemory { pages } => {
                write!(f, "No free virtual range of {} pages", pages)
            }
            Self::NotMapped { addr } => write!(f, "No mapping at {:#x}", addr),
            Self::ReadFault { addr } => write!(f, "Read access denied at {:#x}", addr),
            Self::WriteFault { addr } => write!(f, "Write access denied at {:#x}", addr),
            Self::ExecFault { addr } => write!(f, "Execute access denied at {:#x}", addr),
        }
    }
}
