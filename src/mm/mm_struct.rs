//! Per-process virtual memory.
//!
//! An [`MmStruct`] owns a process's supplemental page table, its page
//! table, and its memory-map registry, all under one lock so the
//! "present implies mapped" invariant is never observable mid-update.
//! It resolves page faults (loading lazy pages or growing the stack),
//! implements `mmap`/`munmap`, and tears everything down at exit.
//!
//! Loading is staged to keep lock hold times bounded: the entry is
//! pinned and its load plan captured under the space lock, the file or
//! swap I/O runs with the lock dropped, and the frame is installed
//! under the lock again. The pin keeps eviction away from the page for
//! the duration.

use crate::fs::inode::Inode;
use crate::mm::page::{PageKind, SptEntry, SupPageTable};
use crate::mm::page_table::PageTable;
use crate::mm::palloc::{FrameId, PallocFlags};
use crate::mm::swap::SwapSlot;
use crate::mm::{Va, Vm, PAGE_SIZE, PHYS_BASE, STACK_LIMIT, STACK_SLACK};
use crate::KernelError;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Identifier of one `mmap` mapping within a process.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MapId(pub u32);

pub(crate) struct Space {
    pub spt: SupPageTable,
    pub pt: PageTable,
    pub mmaps: BTreeMap<u32, Vec<Va>>,
    pub next_mapid: u32,
}

/// A process address space behind its lock, shared with the frame table.
pub(crate) struct SpaceShared(pub Mutex<Space>);

/// The virtual-memory side of one process.
pub struct MmStruct {
    vm: Arc<Vm>,
    pub(crate) space: Arc<SpaceShared>,
}

enum LoadPlan {
    File {
        file: Inode,
        ofs: usize,
        read_bytes: usize,
        writable: bool,
    },
    Swap {
        slot: SwapSlot,
        writable: bool,
    },
}

impl MmStruct {
    /// Creates an empty address space on `vm`.
    pub fn new(vm: Arc<Vm>) -> Self {
        MmStruct {
            vm,
            space: Arc::new(SpaceShared(Mutex::new(Space {
                spt: SupPageTable::new(),
                pt: PageTable::new(),
                mmaps: BTreeMap::new(),
                next_mapid: 1,
            }))),
        }
    }

    /// The machine-wide VM state this space allocates from.
    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    /// Registers a lazily loaded executable-segment page: `read_bytes`
    /// from `file` at `ofs`, then `zero_bytes` of zeros. Called by the
    /// loader for each page of a segment.
    pub fn link_segment(
        &self,
        file: &Inode,
        ofs: usize,
        va: Va,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<(), KernelError> {
        if va.page_offset() != 0 || !va.is_user() || read_bytes + zero_bytes != PAGE_SIZE {
            return Err(KernelError::InvalidArgument);
        }
        let mut sp = self.space.0.lock().unwrap();
        let inserted = sp.spt.insert(SptEntry {
            va,
            writable,
            pinned: false,
            present: false,
            kind: PageKind::Elf {
                file: file.clone(),
                ofs,
                read_bytes,
                zero_bytes,
            },
        });
        if inserted {
            Ok(())
        } else {
            Err(KernelError::InvalidArgument)
        }
    }

    /// Maps the whole of `file` at `addr`, page by page, lazily.
    ///
    /// `addr` must be page-aligned, nonzero, and in user space, the file
    /// must be nonempty, and no page of the range may already be in use.
    pub fn mmap(&self, file: &Inode, addr: Va) -> Result<MapId, KernelError> {
        let len = file.length();
        if addr.0 == 0 || addr.page_offset() != 0 || !addr.is_user() || len == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let pages = len.div_ceil(PAGE_SIZE);
        if addr.0 + pages * PAGE_SIZE > PHYS_BASE {
            return Err(KernelError::InvalidArgument);
        }

        let mut sp = self.space.0.lock().unwrap();
        for i in 0..pages {
            if sp.spt.get(addr + i * PAGE_SIZE).is_some() {
                return Err(KernelError::InvalidArgument);
            }
        }

        let mut vas = Vec::with_capacity(pages);
        let mut remaining = len;
        let mut ofs = 0;
        for i in 0..pages {
            let va = addr + i * PAGE_SIZE;
            let read_bytes = remaining.min(PAGE_SIZE);
            sp.spt.insert(SptEntry {
                va,
                writable: true,
                pinned: false,
                present: false,
                kind: PageKind::Mmap {
                    file: file.clone(),
                    ofs,
                    read_bytes,
                    zero_bytes: PAGE_SIZE - read_bytes,
                },
            });
            vas.push(va);
            remaining -= read_bytes;
            ofs += read_bytes;
        }
        let id = sp.next_mapid;
        sp.next_mapid += 1;
        sp.mmaps.insert(id, vas);
        log::debug!("mm: mmap {:?} at {:?}, {} pages", file.sector(), addr, pages);
        Ok(MapId(id))
    }

    /// Unmaps mapping `id`: dirty pages are written back through the
    /// file, frames are freed, and the supplemental entries dropped.
    pub fn munmap(&self, id: MapId) -> Result<(), KernelError> {
        let mut sp = self.space.0.lock().unwrap();
        let vas = sp.mmaps.remove(&id.0).ok_or(KernelError::InvalidArgument)?;
        log::debug!("mm: munmap {:?}, {} pages", id, vas.len());
        for va in vas {
            self.unmap_page(&mut sp, va);
        }
        Ok(())
    }

    /// Drops the page at `va` from the space: writes a dirty mmap page
    /// back to its file, releases the frame or swap slot, and removes
    /// the supplemental entry.
    fn unmap_page(&self, sp: &mut Space, va: Va) {
        let Some(spte) = sp.spt.remove(va) else {
            return;
        };
        if spte.present {
            if let Some(pte) = sp.pt.lookup(va) {
                let frame = pte.frame();
                if pte.is_dirty() {
                    if let PageKind::Mmap {
                        file,
                        ofs,
                        read_bytes,
                        ..
                    } = &spte.kind
                    {
                        let mut bounce = Box::new([0u8; PAGE_SIZE]);
                        self.vm
                            .pool
                            .with_frame(frame, |data| bounce.copy_from_slice(data));
                        let _io = self.vm.io_lock.lock().unwrap();
                        file.write_at(&bounce[..*read_bytes], *ofs);
                    }
                }
                sp.pt.clear_page(va);
                self.vm.frame_free(frame);
            }
        } else if let PageKind::Swap {
            slot: Some(slot), ..
        } = spte.kind
        {
            // Discard the swapped-out copy so the slot count matches the
            // set of live swapped pages.
            self.vm.swap.free_slot(slot);
        }
    }

    /// Resolves a fault at `addr` (`write` says what the access was,
    /// `esp` is the faulting thread's user stack pointer).
    ///
    /// A fault on a registered lazy page loads it. A fault with no entry
    /// grows the stack when `addr` is inside the stack window and close
    /// enough to `esp`; anything else is a bad address and the caller
    /// terminates the process.
    pub fn page_fault(&self, addr: Va, write: bool, esp: Va) -> Result<(), KernelError> {
        if !addr.is_user() {
            return Err(KernelError::BadAddress);
        }
        let page = addr.page_down();
        enum Decision {
            Nothing,
            Load,
            MaybeGrow,
        }
        let decision = {
            let sp = self.space.0.lock().unwrap();
            match sp.spt.get(page) {
                Some(spte) => {
                    if write && !spte.writable {
                        return Err(KernelError::InvalidAccess);
                    }
                    if spte.present {
                        Decision::Nothing
                    } else {
                        Decision::Load
                    }
                }
                None => Decision::MaybeGrow,
            }
        };
        match decision {
            Decision::Nothing => Ok(()),
            Decision::Load => self.load_page(page),
            Decision::MaybeGrow => {
                if is_stack_growth(addr, esp) {
                    self.stack_growth(addr)
                } else {
                    Err(KernelError::BadAddress)
                }
            }
        }
    }

    /// Makes the lazy page at `page` resident.
    fn load_page(&self, page: Va) -> Result<(), KernelError> {
        let (plan, was_pinned) = {
            let mut sp = self.space.0.lock().unwrap();
            let spte = sp.spt.get_mut(page).ok_or(KernelError::BadAddress)?;
            if spte.present {
                return Ok(());
            }
            let was_pinned = spte.pinned;
            spte.pinned = true;
            let plan = match &spte.kind {
                PageKind::Elf {
                    file,
                    ofs,
                    read_bytes,
                    ..
                }
                | PageKind::Mmap {
                    file,
                    ofs,
                    read_bytes,
                    ..
                } => LoadPlan::File {
                    file: file.clone(),
                    ofs: *ofs,
                    read_bytes: *read_bytes,
                    writable: spte.writable,
                },
                PageKind::Swap { slot } => LoadPlan::Swap {
                    slot: (*slot).expect("anonymous page absent with no swap slot"),
                    writable: spte.writable,
                },
            };
            (plan, was_pinned)
        };

        let result = self.load_into_frame(page, plan);

        let mut sp = self.space.0.lock().unwrap();
        if let Some(spte) = sp.spt.get_mut(page) {
            spte.pinned = was_pinned;
        }
        result
    }

    fn load_into_frame(&self, page: Va, plan: LoadPlan) -> Result<(), KernelError> {
        let vm = &self.vm;
        match plan {
            LoadPlan::File {
                file,
                ofs,
                read_bytes,
                writable,
            } => {
                let flags = if read_bytes == 0 {
                    PallocFlags::USER | PallocFlags::ZERO
                } else {
                    PallocFlags::USER
                };
                let frame = vm.frame_get(&self.space, page, flags);
                if read_bytes > 0 {
                    let mut bounce = Box::new([0u8; PAGE_SIZE]);
                    let n = {
                        let _io = vm.io_lock.lock().unwrap();
                        file.read_at(&mut bounce[..read_bytes], ofs)
                    };
                    if n != read_bytes {
                        vm.frame_free(frame);
                        return Err(KernelError::BadAddress);
                    }
                    vm.pool.with_frame(frame, |data| {
                        data[..read_bytes].copy_from_slice(&bounce[..read_bytes]);
                        data[read_bytes..].fill(0);
                    });
                }
                self.install(page, frame, writable, None)
            }
            LoadPlan::Swap { slot, writable } => {
                let frame = vm.frame_get(&self.space, page, PallocFlags::USER);
                vm.swap.load(slot, &vm.pool, frame);
                self.install(page, frame, writable, Some(PageKind::Swap { slot: None }))
            }
        }
    }

    /// Publishes a loaded frame: installs the PTE and flips the entry to
    /// present, atomically under the space lock.
    fn install(
        &self,
        page: Va,
        frame: FrameId,
        writable: bool,
        new_kind: Option<PageKind>,
    ) -> Result<(), KernelError> {
        let mut sp = self.space.0.lock().unwrap();
        let found = match sp.spt.get_mut(page) {
            Some(spte) => {
                if let Some(kind) = new_kind {
                    spte.kind = kind;
                }
                spte.present = true;
                true
            }
            None => false,
        };
        if !found {
            // The mapping vanished while we were loading.
            drop(sp);
            self.vm.frame_free(frame);
            return Err(KernelError::BadAddress);
        }
        let installed = sp.pt.set_page(page, frame, writable);
        debug_assert!(installed, "PTE already present for {:?}", page);
        Ok(())
    }

    /// Creates a fresh, zeroed, writable anonymous page at `addr`'s
    /// page, for a fault inside the stack window.
    fn stack_growth(&self, addr: Va) -> Result<(), KernelError> {
        let page = addr.page_down();
        if PHYS_BASE - page.0 > STACK_LIMIT {
            return Err(KernelError::BadAddress);
        }
        {
            let mut sp = self.space.0.lock().unwrap();
            let inserted = sp.spt.insert(SptEntry {
                va: page,
                writable: true,
                pinned: true,
                present: false,
                kind: PageKind::Swap { slot: None },
            });
            if !inserted {
                return Err(KernelError::InvalidArgument);
            }
        }
        let frame = self
            .vm
            .frame_get(&self.space, page, PallocFlags::USER | PallocFlags::ZERO);

        let mut sp = self.space.0.lock().unwrap();
        sp.pt.set_page(page, frame, true);
        let spte = sp.spt.get_mut(page).expect("stack page vanished mid-growth");
        spte.present = true;
        spte.pinned = false;
        log::debug!("mm: stack grown to {:?}", page);
        Ok(())
    }

    /// The frame backing `va`, if resident. Lets callers audit the
    /// page-table ↔ frame-table linkage.
    pub fn translate(&self, va: Va) -> Option<FrameId> {
        self.space
            .0
            .lock()
            .unwrap()
            .pt
            .lookup(va)
            .map(|pte| pte.frame())
    }

    /// Whether the page holding `va` is resident.
    pub fn is_resident(&self, va: Va) -> bool {
        self.space
            .0
            .lock()
            .unwrap()
            .spt
            .get(va)
            .is_some_and(|spte| spte.present)
    }

    /// Whether the page holding `va` is anonymous (stack, or an ELF page
    /// promoted by a dirty eviction).
    pub fn is_anonymous(&self, va: Va) -> bool {
        self.space
            .0
            .lock()
            .unwrap()
            .spt
            .get(va)
            .is_some_and(|spte| matches!(spte.kind, PageKind::Swap { .. }))
    }

    /// Number of pages currently swapped out.
    pub fn swapped_pages(&self) -> usize {
        self.space
            .0
            .lock()
            .unwrap()
            .spt
            .iter()
            .filter(|spte| !spte.present && matches!(spte.kind, PageKind::Swap { slot: Some(_) }))
            .count()
    }

    /// Clears the accessed bit of the page holding `va`, as a timer tick
    /// sweep would.
    pub fn clear_accessed(&self, va: Va) {
        self.space.0.lock().unwrap().pt.set_accessed(va, false);
    }
}

/// Stack-growth heuristic: inside the stack window, and at or above
/// `esp - 32` (x86 `PUSHA` faults that far below the stack pointer).
fn is_stack_growth(addr: Va, esp: Va) -> bool {
    PHYS_BASE - addr.page_down().0 <= STACK_LIMIT && addr.0 + STACK_SLACK >= esp.0
}

impl Drop for MmStruct {
    /// Process exit: write dirty mmap pages back, release every frame
    /// and swap slot, drop all supplemental entries.
    fn drop(&mut self) {
        let mut sp = self.space.0.lock().unwrap();
        sp.mmaps.clear();
        let pages: Vec<Va> = sp.spt.iter().map(|spte| spte.va).collect();
        for va in pages {
            self.unmap_page(&mut sp, va);
        }
    }
}
