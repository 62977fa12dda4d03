//! The frame table and second-chance eviction.
//!
//! One entry per user frame in use, recording the owning address space
//! and the user page it backs. Owners are held weakly and the frame is
//! re-resolved through the owner's page table at eviction time, so no
//! raw back-pointer can outlive its target.
//!
//! Eviction scans the table up to twice. An entry whose accessed bit is
//! set gets a second chance: the bit is cleared and the scan moves on.
//! The first unpinned, unreferenced entry becomes the victim:
//!
//! - its PTE is cleared so the owner faults on the next touch,
//! - a dirty mmap page is written back to its file,
//! - an anonymous page is dumped to swap,
//! - a dirty ELF page is promoted to anonymous and dumped; a clean one
//!   is simply dropped and will be re-read from the executable,
//!
//! and the frame returns to the pool. The table lock is never held
//! across victim I/O; only the victim's space lock is, which keeps its
//! supplemental entry stable while the page is on its way out.
//!
//! If every frame is pinned there is nothing left to steal and the
//! kernel panics.

use crate::mm::mm_struct::SpaceShared;
use crate::mm::page::PageKind;
use crate::mm::palloc::{FrameId, PallocFlags};
use crate::mm::{Va, Vm, PAGE_SIZE};
use crate::sync::SpinLock;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

pub(crate) struct FrameEntry {
    pub space: Weak<SpaceShared>,
    pub va: Va,
}

/// Owner tracking for every user frame in use.
pub struct FrameTable {
    pub(crate) entries: SpinLock<BTreeMap<FrameId, FrameEntry>>,
}

impl FrameTable {
    pub(crate) fn new() -> Self {
        FrameTable {
            entries: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Number of frames currently tracked.
    pub fn resident(&self) -> usize {
        self.entries.lock().len()
    }

    /// The user page a frame currently backs, if any. Lets callers audit
    /// the frame ↔ page-table linkage.
    pub fn mapped_va(&self, frame: FrameId) -> Option<Va> {
        self.entries.lock().get(&frame).map(|e| e.va)
    }
}

impl Vm {
    /// Obtains a user frame for `va` of `space`, evicting until the pool
    /// yields one. The new frame is linked in the frame table before it
    /// is returned.
    pub(crate) fn frame_get(&self, space: &Arc<SpaceShared>, va: Va, flags: PallocFlags) -> FrameId {
        loop {
            {
                let mut table = self.frames.entries.lock();
                if let Some(frame) = self.pool.get_page(flags) {
                    table.insert(
                        frame,
                        FrameEntry {
                            space: Arc::downgrade(space),
                            va,
                        },
                    );
                    return frame;
                }
            }
            self.frame_evict();
        }
    }

    /// Unlinks `frame` and returns it to the pool.
    ///
    /// # Panics
    /// Panics if the frame is not tracked; freeing an unknown frame is a
    /// kernel bug.
    pub(crate) fn frame_free(&self, frame: FrameId) {
        let removed = self.frames.entries.lock().remove(&frame);
        assert!(removed.is_some(), "freeing untracked {:?}", frame);
        self.pool.free_page(frame);
    }

    /// Frees one frame by second-chance eviction.
    ///
    /// # Panics
    /// Panics when every tracked frame is pinned.
    fn frame_evict(&self) {
        loop {
            let mut saw_unpinned = false;
            for _round in 0..2 {
                let candidates: Vec<FrameId> =
                    self.frames.entries.lock().keys().copied().collect();
                for frame in candidates {
                    let Some((weak_space, va)) = self
                        .frames
                        .entries
                        .lock()
                        .get(&frame)
                        .map(|e| (e.space.clone(), e.va))
                    else {
                        continue;
                    };
                    let Some(space) = weak_space.upgrade() else {
                        // The owner died without freeing; reclaim directly.
                        saw_unpinned = true;
                        if self.frames.entries.lock().remove(&frame).is_some() {
                            self.pool.free_page(frame);
                            return;
                        }
                        continue;
                    };
                    // Never block on a space while holding scan state: a
                    // busy owner just loses its turn this round.
                    let Ok(mut guard) = space.0.try_lock() else {
                        saw_unpinned = true;
                        continue;
                    };
                    let sp = &mut *guard;
                    let Some(spte) = sp.spt.get_mut(va) else {
                        saw_unpinned = true;
                        continue;
                    };
                    if spte.pinned {
                        continue;
                    }
                    saw_unpinned = true;
                    if !spte.present {
                        continue;
                    }
                    let Some(pte) = sp.pt.lookup(va) else {
                        continue;
                    };
                    if pte.frame() != frame {
                        continue;
                    }
                    if pte.is_accessed() {
                        // Second chance: clear and move on.
                        sp.pt.set_accessed(va, false);
                        continue;
                    }

                    // Victim found. Unhook it, then route the contents.
                    let dirty = pte.is_dirty();
                    sp.pt.clear_page(va);
                    spte.present = false;
                    self.frames.entries.lock().remove(&frame);

                    enum Route {
                        FileBack {
                            file: crate::fs::inode::Inode,
                            ofs: usize,
                            read_bytes: usize,
                        },
                        ToSwap {
                            promote: bool,
                        },
                        Drop,
                    }
                    let route = match &spte.kind {
                        PageKind::Mmap {
                            file,
                            ofs,
                            read_bytes,
                            ..
                        } if dirty => Route::FileBack {
                            file: file.clone(),
                            ofs: *ofs,
                            read_bytes: *read_bytes,
                        },
                        PageKind::Swap { .. } => Route::ToSwap { promote: false },
                        PageKind::Elf { .. } if dirty => Route::ToSwap { promote: true },
                        // Clean file-backed pages are re-read from their
                        // file on the next fault.
                        PageKind::Mmap { .. } | PageKind::Elf { .. } => Route::Drop,
                    };
                    match route {
                        Route::FileBack {
                            file,
                            ofs,
                            read_bytes,
                        } => {
                            let mut bounce = Box::new([0u8; PAGE_SIZE]);
                            self.pool
                                .with_frame(frame, |data| bounce.copy_from_slice(data));
                            let _io = self.io_lock.lock().unwrap();
                            file.write_at(&bounce[..read_bytes], ofs);
                        }
                        Route::ToSwap { promote } => {
                            let slot = self.swap.dump(&self.pool, frame);
                            if promote {
                                spte.kind = PageKind::Swap { slot: Some(slot) };
                            } else if let PageKind::Swap { slot: s } = &mut spte.kind {
                                *s = Some(slot);
                            }
                        }
                        Route::Drop => {}
                    }
                    drop(guard);

                    self.pool.free_page(frame);
                    log::debug!("frame: evicted {:?} backing {:?}", frame, va);
                    return;
                }
            }

            if !saw_unpinned {
                let tracked = self.frames.entries.lock().len();
                assert!(tracked > 0, "nothing to evict from an empty frame table");
                panic!("frame table: every frame is pinned");
            }
            // Accessed bits were cleared or owners were busy; another
            // sweep will make progress.
            std::thread::yield_now();
        }
    }
}
