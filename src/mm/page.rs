//! The supplemental page table.
//!
//! The hardware page table only knows about resident pages. The
//! supplemental page table is the kernel's side of the story: one entry
//! per user page a process has set up, recording how to (re)materialize
//! the page on a fault. The common header — address, writability, pin
//! state, residency — sits outside the per-kind payload.
//!
//! Page kinds:
//!
//! - [`PageKind::Elf`] — a lazily loaded executable segment page: read
//!   `read_bytes` from the file at `ofs`, zero the rest. A clean ELF
//!   page is evicted by dropping it (it can be re-read); a dirtied one
//!   is promoted to [`PageKind::Swap`] on its first eviction.
//! - [`PageKind::Mmap`] — a page of a memory-mapped file. Dirty pages
//!   are written back to the file at their original offset, on eviction
//!   and on `munmap`.
//! - [`PageKind::Swap`] — an anonymous page (stack, or a promoted ELF
//!   page). While resident or never evicted the slot is `None`; after
//!   eviction it names the swap slot holding the contents.
//!
//! A pinned entry is never chosen for eviction; the syscall layer pins
//! user buffers for the duration of a kernel operation (see
//! [`crate::mm::uaccess`]).

use crate::fs::inode::Inode;
use crate::mm::swap::SwapSlot;
use crate::mm::Va;
use std::collections::BTreeMap;

/// How a lazy page is materialized, with its per-kind payload.
///
/// File handles clone on insertion, which keeps the backing inode open
/// for as long as any entry references it.
pub enum PageKind {
    /// Executable segment page, lazily read from the image file.
    Elf {
        /// Backing file handle.
        file: Inode,
        /// Byte offset of the page's data within the file.
        ofs: usize,
        /// Bytes to read from the file; the rest of the page is zeroed.
        read_bytes: usize,
        /// Bytes to zero after `read_bytes`.
        zero_bytes: usize,
    },
    /// Page of a memory-mapped file.
    Mmap {
        /// Backing file handle.
        file: Inode,
        /// Byte offset of the page's data within the file.
        ofs: usize,
        /// Bytes backed by the file; the tail past EOF is zeroed.
        read_bytes: usize,
        /// Bytes to zero after `read_bytes`.
        zero_bytes: usize,
    },
    /// Anonymous page, swapped out to `slot` when not resident.
    Swap {
        /// Occupied swap slot, once the page has been evicted.
        slot: Option<SwapSlot>,
    },
}

/// One supplemental page table entry.
pub struct SptEntry {
    /// Page-aligned user address.
    pub va: Va,
    /// Whether user writes are permitted.
    pub writable: bool,
    /// Exempt from eviction while set.
    pub pinned: bool,
    /// Whether a frame currently backs the page.
    pub present: bool,
    /// How to materialize the page.
    pub kind: PageKind,
}

/// Per-process map from user page to its supplemental entry.
#[derive(Default)]
pub struct SupPageTable {
    entries: BTreeMap<Va, SptEntry>,
}

impl SupPageTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        SupPageTable::default()
    }

    /// The entry covering `va`, if any.
    pub fn get(&self, va: Va) -> Option<&SptEntry> {
        self.entries.get(&va.page_down())
    }

    /// Mutable access to the entry covering `va`.
    pub fn get_mut(&mut self, va: Va) -> Option<&mut SptEntry> {
        self.entries.get_mut(&va.page_down())
    }

    /// Registers `entry`. Returns `false` if the page already has one;
    /// a process never holds two entries for the same page.
    pub fn insert(&mut self, entry: SptEntry) -> bool {
        debug_assert_eq!(entry.va.page_offset(), 0);
        match self.entries.entry(entry.va) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
        }
    }

    /// Unlinks and returns the entry covering `va`.
    pub fn remove(&mut self, va: Va) -> Option<SptEntry> {
        self.entries.remove(&va.page_down())
    }

    /// Iterates over all entries.
    pub fn iter(&self) -> impl Iterator<Item = &SptEntry> {
        self.entries.values()
    }
}
