//! TLB flush batching
//!
//! Collects the addresses touched by a multi-page page-table update and
//! flushes them in one go. Small batches get individual `invlpg` flushes;
//! past [`FlushBatch::MAX_BATCH`] addresses a full TLB flush is cheaper.
//!
//! Only the current CPU is flushed. A multiprocessor port must track
//! which CPUs carry the affected root and send invalidation IPIs before
//! the batch commit returns.

use crate::arch;

/// Batched TLB flush accumulator.
pub struct FlushBatch {
    addresses: [u64; Self::MAX_BATCH],
    count: usize,
}

impl FlushBatch {
    const MAX_BATCH: usize = 16;

    pub const fn new() -> Self {
        Self {
            addresses: [0; Self::MAX_BATCH],
            count: 0,
        }
    }

    /// Record an address. Does not flush yet.
    #[inline]
    pub fn add(&mut self, addr: u64) {
        if self.count < Self::MAX_BATCH {
            self.addresses[self.count] = addr;
        }
        // Counting past MAX_BATCH switches commit to a full flush.
        self.count += 1;
    }

    /// Flush everything recorded.
    pub fn commit(self) {
        if self.count == 0 {
            return;
        }
        if self.count > Self::MAX_BATCH {
            arch::flush_tlb_all();
        } else {
            for addr in &self.addresses[..self.count] {
                arch::flush_tlb_address(*addr);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl Default for FlushBatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_counts_past_capacity() {
        let mut batch = FlushBatch::new();
        assert!(batch.is_empty());
        for i in 0..40 {
            batch.add(i * 0x1000);
        }
        assert_eq!(batch.len(), 40);
        // Commit on the host is a no-op; it must not panic on overflow.
        batch.commit();
    }

    #[test]
    fn test_empty_commit() {
        FlushBatch::new().commit();
    }
}
