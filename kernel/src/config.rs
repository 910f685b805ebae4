//! Compile-time kernel configuration
//!
//! Build-time switches for diagnostics. Branches on these constants fold
//! away entirely when disabled.

/// Verify mapping-list invariants (ordering, non-overlap, user-space
/// bounds) at the exit of every mutating address-space operation.
pub const DEBUG_CHECKS: bool = cfg!(debug_assertions);

/// Trace every public address-space operation through the kernel log.
pub const TRACE_VM_CALLS: bool = false;

/// Log address-space statistics after mutating operations.
pub const LOG_VM_STATS: bool = false;
