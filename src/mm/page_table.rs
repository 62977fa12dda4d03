//! The per-process page table.
//!
//! A software model of the hardware structure: it maps page-aligned
//! user addresses to frames and keeps the accessed/dirty bits that the
//! MMU would set on a real machine. Address-translating accessors set
//! those bits through [`PageTable::mark_access`]; eviction reads and
//! clears them to run its second-chance policy.

use crate::mm::palloc::FrameId;
use crate::mm::Va;
use std::collections::BTreeMap;

bitflags::bitflags! {
    /// Flag bits of a page table entry.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct PteFlags: u32 {
        /// Writes permitted.
        const WRITABLE = 1 << 0;
        /// Referenced since the bit was last cleared.
        const ACCESSED = 1 << 1;
        /// Modified since the page was loaded.
        const DIRTY = 1 << 2;
    }
}

/// One page table entry.
#[derive(Clone, Copy, Debug)]
pub struct Pte {
    frame: FrameId,
    flags: PteFlags,
}

impl Pte {
    /// The mapped frame.
    pub fn frame(&self) -> FrameId {
        self.frame
    }

    /// Whether writes are permitted.
    pub fn is_writable(&self) -> bool {
        self.flags.contains(PteFlags::WRITABLE)
    }

    /// Whether the page was referenced since the last clear.
    pub fn is_accessed(&self) -> bool {
        self.flags.contains(PteFlags::ACCESSED)
    }

    /// Whether the page was modified.
    pub fn is_dirty(&self) -> bool {
        self.flags.contains(PteFlags::DIRTY)
    }
}

/// Page table of one process.
#[derive(Default)]
pub struct PageTable {
    entries: BTreeMap<Va, Pte>,
}

impl PageTable {
    /// Creates an empty page table.
    pub fn new() -> Self {
        PageTable::default()
    }

    /// Maps `va` to `frame`. Returns `false` if `va` is already mapped.
    pub fn set_page(&mut self, va: Va, frame: FrameId, writable: bool) -> bool {
        debug_assert_eq!(va.page_offset(), 0);
        if self.entries.contains_key(&va) {
            return false;
        }
        let mut flags = PteFlags::empty();
        if writable {
            flags |= PteFlags::WRITABLE;
        }
        self.entries.insert(va, Pte { frame, flags });
        true
    }

    /// Unmaps `va`, returning the frame it pointed to.
    pub fn clear_page(&mut self, va: Va) -> Option<FrameId> {
        self.entries.remove(&va.page_down()).map(|pte| pte.frame)
    }

    /// The entry mapping `va`, if resident.
    pub fn lookup(&self, va: Va) -> Option<&Pte> {
        self.entries.get(&va.page_down())
    }

    /// Whether the page holding `va` was referenced.
    pub fn is_accessed(&self, va: Va) -> bool {
        self.lookup(va).is_some_and(|pte| pte.is_accessed())
    }

    /// Sets or clears the accessed bit of the page holding `va`.
    pub fn set_accessed(&mut self, va: Va, accessed: bool) {
        if let Some(pte) = self.entries.get_mut(&va.page_down()) {
            pte.flags.set(PteFlags::ACCESSED, accessed);
        }
    }

    /// Whether the page holding `va` was modified.
    pub fn is_dirty(&self, va: Va) -> bool {
        self.lookup(va).is_some_and(|pte| pte.is_dirty())
    }

    /// Records a user access the way the MMU would: sets the accessed
    /// bit, and the dirty bit for writes.
    pub fn mark_access(&mut self, va: Va, write: bool) {
        if let Some(pte) = self.entries.get_mut(&va.page_down()) {
            pte.flags |= PteFlags::ACCESSED;
            if write {
                pte.flags |= PteFlags::DIRTY;
            }
        }
    }
}
