//! The physical frame allocator.
//!
//! [`UserPool`] owns a fixed arena of page-sized frames and hands them
//! out by index. Exhaustion is not an error here: the caller (the frame
//! table) evicts and retries. Frame payloads are reached through
//! [`UserPool::with_frame`], which serializes access per frame.

use crate::mm::PAGE_SIZE;
use crate::sync::SpinLock;

bitflags::bitflags! {
    /// Allocation flags for [`UserPool::get_page`].
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct PallocFlags: u32 {
        /// Allocate from the user pool.
        const USER = 1 << 0;
        /// Zero the frame before returning it.
        const ZERO = 1 << 1;
    }
}

/// Index of a physical frame in the user pool.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub struct FrameId(pub usize);

/// A fixed pool of user frames.
pub struct UserPool {
    slots: Vec<SpinLock<Box<[u8; PAGE_SIZE]>>>,
    free: SpinLock<Vec<FrameId>>,
}

impl UserPool {
    /// Creates a pool of `frames` zeroed frames.
    pub fn new(frames: usize) -> Self {
        let mut slots = Vec::with_capacity(frames);
        slots.resize_with(frames, || SpinLock::new(Box::new([0u8; PAGE_SIZE])));
        UserPool {
            slots,
            free: SpinLock::new((0..frames).rev().map(FrameId).collect()),
        }
    }

    /// Allocates a frame, or `None` if the pool is empty.
    pub fn get_page(&self, flags: PallocFlags) -> Option<FrameId> {
        debug_assert!(flags.contains(PallocFlags::USER));
        let frame = self.free.lock().pop()?;
        if flags.contains(PallocFlags::ZERO) {
            self.with_frame(frame, |data| data.fill(0));
        }
        Some(frame)
    }

    /// Returns `frame` to the pool.
    pub fn free_page(&self, frame: FrameId) {
        let mut free = self.free.lock();
        debug_assert!(!free.contains(&frame), "double free of {:?}", frame);
        free.push(frame);
    }

    /// Runs `op` on the frame's payload.
    pub fn with_frame<R>(&self, frame: FrameId, op: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R) -> R {
        op(&mut self.slots[frame.0].lock())
    }

    /// Total number of frames in the pool.
    pub fn total(&self) -> usize {
        self.slots.len()
    }

    /// Number of frames currently free.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhausts_and_recycles() {
        let pool = UserPool::new(2);
        let a = pool.get_page(PallocFlags::USER).unwrap();
        let b = pool.get_page(PallocFlags::USER).unwrap();
        assert_ne!(a, b);
        assert!(pool.get_page(PallocFlags::USER).is_none());
        pool.free_page(a);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.get_page(PallocFlags::USER), Some(a));
    }

    #[test]
    fn zero_flag_clears_stale_contents() {
        let pool = UserPool::new(1);
        let f = pool.get_page(PallocFlags::USER).unwrap();
        pool.with_frame(f, |data| data.fill(0xaa));
        pool.free_page(f);

        let f = pool.get_page(PallocFlags::USER | PallocFlags::ZERO).unwrap();
        pool.with_frame(f, |data| assert!(data.iter().all(|&b| b == 0)));
    }
}
