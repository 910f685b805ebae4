//! Physical frame allocator
//!
//! A bitmap allocator over the usable physical range. First-fit contiguous
//! allocation with double-free detection. Expected allocation sizes are
//! small (single frames for page tables and demand-committed pages), so a
//! flat bitmap scan is sufficient.

use spin::Mutex;

use super::{PhysicalAddress, PAGE_SHIFT};

/// Words in the bitmap; each word tracks 64 frames. 2048 words cover
/// 128 Ki frames (512 MiB), which bounds the range one allocator instance
/// can manage.
const BITMAP_WORDS: usize = 2048;

/// Physical frame number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameNumber(u64);

impl FrameNumber {
    pub const fn new(num: u64) -> Self {
        Self(num)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_addr(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 << PAGE_SHIFT)
    }
}

/// Frame allocator errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAllocatorError {
    /// No contiguous run of free frames is large enough.
    OutOfMemory,
    /// Frame outside the managed range, or double free.
    InvalidFrame,
    /// Zero-sized or over-capacity request.
    InvalidSize,
}

/// Bitmap frame allocator. Bit set = frame free.
pub struct FrameAllocator {
    bitmap: [u64; BITMAP_WORDS],
    start_frame: FrameNumber,
    total_frames: usize,
    free_frames: usize,
}

impl FrameAllocator {
    pub const fn new() -> Self {
        Self {
            bitmap: [0; BITMAP_WORDS],
            start_frame: FrameNumber::new(0),
            total_frames: 0,
            free_frames: 0,
        }
    }

    /// Hand a physical range to the allocator. Frames beyond the bitmap
    /// capacity are ignored.
    pub fn init(&mut self, start_frame: FrameNumber, frame_count: usize) {
        let frame_count = frame_count.min(BITMAP_WORDS * 64);
        self.bitmap = [0; BITMAP_WORDS];
        for i in 0..frame_count {
            self.bitmap[i / 64] |= 1 << (i % 64);
        }
        self.start_frame = start_frame;
        self.total_frames = frame_count;
        self.free_frames = frame_count;
    }

    /// Allocate `count` physically contiguous frames.
    pub fn allocate_frames(&mut self, count: usize) -> Result<FrameNumber, FrameAllocatorError> {
        if count == 0 || count > self.total_frames {
            return Err(FrameAllocatorError::InvalidSize);
        }

        let mut consecutive = 0;
        let mut run_start = 0;
        for bit in 0..self.total_frames {
            if self.bitmap[bit / 64] & (1 << (bit % 64)) != 0 {
                if consecutive == 0 {
                    run_start = bit;
                }
                consecutive += 1;
                if consecutive == count {
                    for i in run_start..run_start + count {
                        self.bitmap[i / 64] &= !(1 << (i % 64));
                    }
                    self.free_frames -= count;
                    return Ok(FrameNumber::new(self.start_frame.as_u64() + run_start as u64));
                }
            } else {
                consecutive = 0;
            }
        }

        Err(FrameAllocatorError::OutOfMemory)
    }

    /// Return `count` frames starting at `frame` to the free pool.
    pub fn free_frames(
        &mut self,
        frame: FrameNumber,
        count: usize,
    ) -> Result<(), FrameAllocatorError> {
        let offset = frame
            .as_u64()
            .checked_sub(self.start_frame.as_u64())
            .ok_or(FrameAllocatorError::InvalidFrame)? as usize;
        if offset + count > self.total_frames {
            return Err(FrameAllocatorError::InvalidFrame);
        }

        // Check the whole run for double frees before mutating anything.
        for i in offset..offset + count {
            if self.bitmap[i / 64] & (1 << (i % 64)) != 0 {
                return Err(FrameAllocatorError::InvalidFrame);
            }
        }
        for i in offset..offset + count {
            self.bitmap[i / 64] |= 1 << (i % 64);
        }
        self.free_frames += count;
        Ok(())
    }

    /// Frames currently free.
    pub fn free_count(&self) -> usize {
        self.free_frames
    }

    /// Frames managed in total.
    pub fn total_count(&self) -> usize {
        self.total_frames
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Global frame allocator instance.
pub static FRAME_ALLOCATOR: Mutex<FrameAllocator> = Mutex::new(FrameAllocator::new());

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(count: usize) -> FrameAllocator {
        let mut allocator = FrameAllocator::new();
        allocator.init(FrameNumber::new(100), count);
        allocator
    }

    #[test]
    fn test_allocate_single_frame() {
        let mut allocator = fresh(64);
        let frame = allocator
            .allocate_frames(1)
            .expect("single frame allocation from fresh allocator should succeed");
        assert_eq!(frame.as_u64(), 100);
        assert_eq!(allocator.free_count(), 63);
    }

    #[test]
    fn test_allocate_contiguous_run() {
        let mut allocator = fresh(64);
        let first = allocator.allocate_frames(1).unwrap();
        let run = allocator
            .allocate_frames(10)
            .expect("10-frame contiguous allocation should succeed");
        assert_eq!(run.as_u64(), first.as_u64() + 1);
    }

    #[test]
    fn test_free_and_reallocate() {
        let mut allocator = fresh(64);
        let run = allocator.allocate_frames(8).unwrap();
        allocator
            .free_frames(run, 8)
            .expect("freeing previously allocated frames should succeed");
        let again = allocator
            .allocate_frames(8)
            .expect("re-allocation after free should succeed");
        assert_eq!(again, run);
    }

    #[test]
    fn test_double_free_detected() {
        let mut allocator = fresh(64);
        let frame = allocator.allocate_frames(1).unwrap();
        allocator.free_frames(frame, 1).unwrap();
        assert_eq!(
            allocator.free_frames(frame, 1),
            Err(FrameAllocatorError::InvalidFrame)
        );
    }

    #[test]
    fn test_exhaustion() {
        let mut allocator = fresh(4);
        allocator.allocate_frames(4).unwrap();
        assert_eq!(
            allocator.allocate_frames(1),
            Err(FrameAllocatorError::OutOfMemory)
        );
    }

    #[test]
    fn test_zero_size_rejected() {
        let mut allocator = fresh(4);
        assert_eq!(
            allocator.allocate_frames(0),
            Err(FrameAllocatorError::InvalidSize)
        );
    }

    #[test]
    fn test_free_outside_range_rejected() {
        let mut allocator = fresh(4);
        assert_eq!(
            allocator.free_frames(FrameNumber::new(10), 1),
            Err(FrameAllocatorError::InvalidFrame)
        );
    }
}
