//! The swap manager.
//!
//! The swap device is partitioned into page-sized slots of
//! [`SECTORS_PER_PAGE`] consecutive sectors; slot `i` occupies sectors
//! `[8i, 8i + 8)`. A bitmap tracks slot usage: a set bit is an occupied
//! slot holding exactly one evicted anonymous page.
//!
//! Running out of swap is unrecoverable, and loading from a slot the
//! bitmap says is free indicates corrupted paging state; both panic.

use crate::dev::{BlockDevice, Sector, SECTOR_SIZE};
use crate::mm::palloc::{FrameId, UserPool};
use crate::mm::SECTORS_PER_PAGE;
use crate::sync::SpinLock;
use std::sync::Arc;

/// Index of a page-sized slot on the swap device.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SwapSlot(pub usize);

/// Slot allocation and page transfer for the swap device.
pub struct SwapManager {
    device: Arc<dyn BlockDevice>,
    map: SpinLock<Box<[u64]>>,
    slots: usize,
}

impl SwapManager {
    /// Creates a swap manager over `device`. Every slot starts free.
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let slots = device.size() as usize / SECTORS_PER_PAGE;
        log::info!("swap: {} slots available", slots);
        SwapManager {
            device,
            map: SpinLock::new(vec![0u64; slots.div_ceil(64)].into_boxed_slice()),
            slots,
        }
    }

    /// Writes the contents of `frame` to a freshly allocated slot.
    ///
    /// # Panics
    /// Panics when the swap device is full.
    pub(crate) fn dump(&self, pool: &UserPool, frame: FrameId) -> SwapSlot {
        let mut map = self.map.lock();
        let slot = self.scan_and_flip(&mut map).expect("swap: out of swap slots");
        pool.with_frame(frame, |data| {
            for i in 0..SECTORS_PER_PAGE {
                let chunk: &[u8; SECTOR_SIZE] = data[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]
                    .try_into()
                    .expect("sector-sized chunk");
                self.device
                    .write(Sector((slot.0 * SECTORS_PER_PAGE + i) as u32), chunk);
            }
        });
        log::debug!("swap: dumped {:?} to {:?}", frame, slot);
        slot
    }

    /// Reads `slot` back into `frame` and frees the slot.
    ///
    /// # Panics
    /// Panics if the slot is free; a load from a free slot means the
    /// paging state is corrupt.
    pub(crate) fn load(&self, slot: SwapSlot, pool: &UserPool, frame: FrameId) {
        let mut map = self.map.lock();
        let (word, off) = (slot.0 / 64, slot.0 % 64);
        assert!(map[word] & (1 << off) != 0, "swap: loading a free slot");
        map[word] &= !(1 << off);
        pool.with_frame(frame, |data| {
            let mut buf = [0u8; SECTOR_SIZE];
            for i in 0..SECTORS_PER_PAGE {
                self.device
                    .read(Sector((slot.0 * SECTORS_PER_PAGE + i) as u32), &mut buf);
                data[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE].copy_from_slice(&buf);
            }
        });
        log::debug!("swap: loaded {:?} into {:?}", slot, frame);
    }

    /// Frees `slot` without reading it, for pages discarded at process
    /// exit.
    pub(crate) fn free_slot(&self, slot: SwapSlot) {
        let mut map = self.map.lock();
        let (word, off) = (slot.0 / 64, slot.0 % 64);
        assert!(map[word] & (1 << off) != 0, "swap: freeing a free slot");
        map[word] &= !(1 << off);
    }

    /// Number of occupied slots.
    pub fn slots_in_use(&self) -> usize {
        self.map
            .lock()
            .iter()
            .map(|word| word.count_ones() as usize)
            .sum()
    }

    fn scan_and_flip(&self, map: &mut [u64]) -> Option<SwapSlot> {
        for (word_idx, word) in map.iter_mut().enumerate() {
            if *word != u64::MAX {
                let off = word.trailing_ones() as usize;
                let slot = word_idx * 64 + off;
                if slot >= self.slots {
                    return None;
                }
                *word |= 1 << off;
                return Some(SwapSlot(slot));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dev::MemDisk;
    use crate::mm::palloc::PallocFlags;

    fn fixture(slots: u32) -> (SwapManager, UserPool) {
        let device = Arc::new(MemDisk::new(slots * SECTORS_PER_PAGE as u32));
        (SwapManager::new(device), UserPool::new(2))
    }

    #[test]
    fn dump_then_load_roundtrips() {
        let (swap, pool) = fixture(4);
        let f = pool.get_page(PallocFlags::USER).unwrap();
        pool.with_frame(f, |data| {
            for (i, b) in data.iter_mut().enumerate() {
                *b = (i % 251) as u8;
            }
        });
        let slot = swap.dump(&pool, f);
        assert_eq!(swap.slots_in_use(), 1);

        let g = pool.get_page(PallocFlags::USER | PallocFlags::ZERO).unwrap();
        swap.load(slot, &pool, g);
        assert_eq!(swap.slots_in_use(), 0);
        pool.with_frame(g, |data| {
            assert!(data.iter().enumerate().all(|(i, &b)| b == (i % 251) as u8));
        });
    }

    #[test]
    fn slots_are_reused_after_load() {
        let (swap, pool) = fixture(1);
        let f = pool.get_page(PallocFlags::USER).unwrap();
        let slot = swap.dump(&pool, f);
        swap.load(slot, &pool, f);
        // The single slot is free again.
        assert_eq!(swap.dump(&pool, f), slot);
    }

    #[test]
    #[should_panic(expected = "out of swap slots")]
    fn full_swap_is_fatal() {
        let (swap, pool) = fixture(1);
        let f = pool.get_page(PallocFlags::USER).unwrap();
        swap.dump(&pool, f);
        swap.dump(&pool, f);
    }

    #[test]
    #[should_panic(expected = "loading a free slot")]
    fn loading_a_free_slot_is_fatal() {
        let (swap, pool) = fixture(2);
        let f = pool.get_page(PallocFlags::USER).unwrap();
        swap.load(SwapSlot(0), &pool, f);
    }
}
