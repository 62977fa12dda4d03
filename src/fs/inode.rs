//! The inode layer.
//!
//! An inode is the on-disk index of one file or directory. It occupies
//! exactly one sector and maps a byte offset to the data sector holding
//! it through a three-tier scheme:
//!
//! ```text
//!              ┌───────────────────────────┐
//!              │       DiskInode           │
//!              ├───────────────────────────┤
//!              │ sectors[0]   → data       │
//!              │ ...                       │
//!              │ sectors[122] → data       │
//!              │ sectors[123] ───────────┐ │  singly indirect
//!              │ sectors[124] ────────┐  │ │  doubly indirect
//!              └──────────────────────┼──┼─┘
//!                                     │  │
//!          ┌──────────────────────────┘  └──────┐
//!   ┌──────▼───────┐                        ┌───▼──────────┐
//!   │ 128 pointers │                        │ 128 pointers │
//!   │ to indirect  │── ... ──┐              │ to data      │
//!   └──────────────┘         │              └──────────────┘
//!                     ┌──────▼───────┐
//!                     │ 128 pointers │
//!                     │ to data      │
//!                     └──────────────┘
//! ```
//!
//! A zero pointer is a **hole**: reads of a hole return zeros, and the
//! write path allocates the missing tree nodes on demand. The maximum
//! file size is `(123 + 128 + 128²) · 512 B ≈ 8.4 MiB`.
//!
//! In memory, the open-inode registry in [`FileSys`] guarantees a single
//! [`Inode`] state per sector: opening the same sector twice yields
//! handles to the same underlying inode, cloning a handle reopens it,
//! and dropping the last handle of a removed inode erases its sector
//! tree from disk.
//!
//! Writers and the deny-write mechanism coordinate through a live-writer
//! count: `deny_write` drains active writers before taking effect, and
//! while any denier is registered, `write_at` refuses and returns 0.

use crate::dev::{Sector, SECTOR_SIZE};
use crate::fs::cache::{CacheGuard, LockMode};
use crate::fs::FileSys;
use crate::KernelError;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// Number of direct data pointers in an inode.
pub const DIRECT_MAX: usize = 123;
/// Number of sector pointers held by one indirect sector.
pub const PTRS_PER_SECTOR: usize = SECTOR_SIZE / core::mem::size_of::<u32>();
/// Total pointer slots in an inode: direct, singly, doubly indirect.
const SECTOR_SLOTS: usize = DIRECT_MAX + 2;
/// Identifies an inode sector.
pub(crate) const INODE_MAGIC: u32 = 0x494e_4f44;
/// Maximum file size addressable by the index, in bytes.
pub const MAX_LENGTH: usize =
    (DIRECT_MAX + PTRS_PER_SECTOR + PTRS_PER_SECTOR * PTRS_PER_SECTOR) * SECTOR_SIZE;

/// What an inode stores.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum InodeType {
    /// A regular file.
    File = 0,
    /// A directory (directory semantics live in outer layers).
    Directory = 1,
}

impl TryFrom<u32> for InodeType {
    type Error = KernelError;
    fn try_from(value: u32) -> Result<Self, KernelError> {
        match value {
            0 => Ok(InodeType::File),
            1 => Ok(InodeType::Directory),
            _ => Err(KernelError::FilesystemCorrupted("unknown inode type")),
        }
    }
}

/// On-disk inode. Must be exactly one sector.
#[repr(C)]
pub(crate) struct DiskInode {
    /// Sector pointers: `[0, 123)` direct, `[123]` singly indirect,
    /// `[124]` doubly indirect. Zero means unallocated.
    pub sectors: [u32; SECTOR_SLOTS],
    /// Value of an [`InodeType`].
    pub ftype: u32,
    /// File size in bytes.
    pub length: u32,
    /// Must be [`INODE_MAGIC`].
    pub magic: u32,
}

const _: () = assert!(core::mem::size_of::<DiskInode>() == SECTOR_SIZE);

impl DiskInode {
    /// Views a cache buffer as an on-disk inode.
    pub(crate) fn view(block: &[u8; SECTOR_SIZE]) -> &DiskInode {
        debug_assert_eq!(
            block.as_ptr() as usize % core::mem::align_of::<DiskInode>(),
            0
        );
        // Safety: cache payloads are 8-aligned and the struct is exactly
        // one sector of plain integers.
        unsafe { &*(block.as_ptr() as *const DiskInode) }
    }

    pub(crate) fn view_mut(block: &mut [u8; SECTOR_SIZE]) -> &mut DiskInode {
        debug_assert_eq!(
            block.as_ptr() as usize % core::mem::align_of::<DiskInode>(),
            0
        );
        // Safety: as in `view`, plus the caller holds exclusive rights.
        unsafe { &mut *(block.as_mut_ptr() as *mut DiskInode) }
    }
}

/// Views an indirect sector as a pointer array.
fn ptrs(block: &[u8; SECTOR_SIZE]) -> &[u32; PTRS_PER_SECTOR] {
    debug_assert_eq!(block.as_ptr() as usize % core::mem::align_of::<u32>(), 0);
    // Safety: cache payloads are 8-aligned; an indirect sector is plain
    // `u32`s.
    unsafe { &*(block.as_ptr() as *const [u32; PTRS_PER_SECTOR]) }
}

fn ptrs_mut(block: &mut [u8; SECTOR_SIZE]) -> &mut [u32; PTRS_PER_SECTOR] {
    debug_assert_eq!(block.as_ptr() as usize % core::mem::align_of::<u32>(), 0);
    // Safety: as in `ptrs`, plus the caller holds exclusive rights.
    unsafe { &mut *(block.as_mut_ptr() as *mut [u32; PTRS_PER_SECTOR]) }
}

/// Path through the index to a logical data sector: the slots to follow
/// at each level, and how many levels there are (1 = direct, 2 = singly
/// indirect, 3 = doubly indirect).
fn resolve_offsets(mut index: usize) -> (usize, [usize; 3]) {
    if index < DIRECT_MAX {
        return (1, [index, 0, 0]);
    }
    index -= DIRECT_MAX;
    if index < PTRS_PER_SECTOR {
        return (2, [DIRECT_MAX, index, 0]);
    }
    index -= PTRS_PER_SECTOR;
    assert!(index < PTRS_PER_SECTOR * PTRS_PER_SECTOR);
    (
        3,
        [
            DIRECT_MAX + 1,
            index / PTRS_PER_SECTOR,
            index % PTRS_PER_SECTOR,
        ],
    )
}

/// Levels of indirection below pointer slot `slot` of an inode.
fn hierarchy(slot: usize) -> usize {
    (slot >= DIRECT_MAX) as usize + (slot >= DIRECT_MAX + 1) as usize
}

fn slot_of(guard: &CacheGuard<'_>, root: bool, idx: usize) -> u32 {
    if root {
        DiskInode::view(guard.inner()).sectors[idx]
    } else {
        ptrs(guard.inner())[idx]
    }
}

fn set_slot(guard: &mut CacheGuard<'_>, root: bool, idx: usize, value: u32) {
    if root {
        DiskInode::view_mut(guard.inner_mut()).sectors[idx] = value;
    } else {
        ptrs_mut(guard.inner_mut())[idx] = value;
    }
}

#[derive(Default)]
struct DenyState {
    /// Writes refused while positive.
    deny_write_cnt: u32,
    /// Writers currently inside `write_at`.
    write_cnt: u32,
}

/// Shared state of one open inode. One per sector, enforced by the
/// registry in [`FileSys`].
pub(crate) struct InodeInner {
    sector: Sector,
    /// Number of live handles; transitions are guarded by the registry
    /// lock.
    open_cnt: AtomicU32,
    removed: AtomicBool,
    deny: Mutex<DenyState>,
    no_write: Condvar,
    lock: Mutex<()>,
}

impl InodeInner {
    /// The open count, for registry-guarded transitions in [`FileSys`].
    pub(crate) fn open_cnt_ref(&self) -> &AtomicU32 {
        &self.open_cnt
    }

    pub(crate) fn new(sector: Sector) -> Self {
        InodeInner {
            sector,
            open_cnt: AtomicU32::new(1),
            removed: AtomicBool::new(false),
            deny: Mutex::new(DenyState::default()),
            no_write: Condvar::new(),
            lock: Mutex::new(()),
        }
    }
}

/// A handle to an open inode.
///
/// Cloning reopens the inode; dropping closes it. Dropping the last
/// handle of a removed inode frees every sector it owns.
pub struct Inode {
    pub(crate) fs: Arc<FileSys>,
    pub(crate) inner: Arc<InodeInner>,
}

impl Clone for Inode {
    fn clone(&self) -> Self {
        let _reg = self.fs.inodes.lock();
        self.inner.open_cnt.fetch_add(1, Ordering::Relaxed);
        Inode {
            fs: self.fs.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        let mut reg = self.fs.inodes.lock();
        if self.inner.open_cnt.fetch_sub(1, Ordering::AcqRel) == 1 {
            reg.remove(&self.inner.sector);
            drop(reg);
            if self.inner.removed.load(Ordering::Acquire) {
                erase(&self.fs, self.inner.sector);
            }
        }
    }
}

impl Inode {
    /// The sector holding this inode, which doubles as its number.
    pub fn sector(&self) -> Sector {
        self.inner.sector
    }

    /// The inode's type, read through the cache.
    pub fn itype(&self) -> InodeType {
        let g = self.fs.cache.lock(self.inner.sector, LockMode::Shared);
        InodeType::try_from(DiskInode::view(g.inner()).ftype).expect("inode type corrupted")
    }

    /// Current file length in bytes.
    pub fn length(&self) -> usize {
        let g = self.fs.cache.lock(self.inner.sector, LockMode::Shared);
        DiskInode::view(g.inner()).length as usize
    }

    /// Marks the inode for deletion once the last handle closes.
    pub fn remove(&self) {
        self.inner.removed.store(true, Ordering::Release);
    }

    /// Serializes composite operations on this inode (used by directory
    /// code in outer layers).
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.inner.lock.lock().unwrap()
    }

    fn open_cnt(&self) -> u32 {
        self.inner.open_cnt.load(Ordering::Acquire)
    }

    /// Walks the index to the data sector containing byte `offset`.
    ///
    /// The walk descends with shared locks. When `allocate` is set and a
    /// pointer is zero, the parent is re-locked exclusively and the
    /// pointer re-checked — another writer may have filled it — before a
    /// fresh sector is claimed from the free map, linked, and zeroed.
    /// The read path never allocates: a zero pointer yields `Ok(None)`.
    ///
    /// On success the data sector's buffer is returned locked in `mode`.
    fn data_block(
        &self,
        offset: usize,
        mode: LockMode,
        allocate: bool,
    ) -> Result<Option<CacheGuard<'_>>, KernelError> {
        debug_assert!(!allocate || mode == LockMode::Exclusive);
        let (depth, offs) = resolve_offsets(offset / SECTOR_SIZE);
        let cache = &self.fs.cache;
        let mut cur = self.inner.sector;
        let mut level = 0;
        loop {
            let root = level == 0;
            let parent = cache.lock(cur, LockMode::Shared);
            let next = slot_of(&parent, root, offs[level]);
            if next != 0 {
                if level == depth - 1 {
                    // Hint the sequentially-next pointer to the readahead
                    // worker on the read path.
                    // TODO: hints stop at indirect-block boundaries; carry
                    // them across by peeking the next indirect sector.
                    if !allocate {
                        let limit = if root { DIRECT_MAX } else { PTRS_PER_SECTOR };
                        if offs[level] + 1 < limit {
                            let ahead = slot_of(&parent, root, offs[level] + 1);
                            if ahead != 0 {
                                cache.readahead(Sector(ahead));
                            }
                        }
                    }
                    drop(parent);
                    return Ok(Some(cache.lock(Sector(next), mode)));
                }
                drop(parent);
                cur = Sector(next);
                level += 1;
                continue;
            }
            drop(parent);

            if !allocate {
                return Ok(None);
            }

            // Re-check under the exclusive lock; a racing writer may have
            // allocated this slot already.
            let mut parent = cache.lock(cur, LockMode::Exclusive);
            if slot_of(&parent, root, offs[level]) != 0 {
                continue;
            }
            let Some(new) = self.fs.free_map.allocate() else {
                return Err(KernelError::NoSpace);
            };
            set_slot(&mut parent, root, offs[level], new.0);
            parent.mark_dirty();
            let mut child = cache.lock(new, LockMode::Exclusive);
            child.set_zero();
            drop(parent);

            if level == depth - 1 {
                return Ok(Some(child));
            }
            drop(child);
            cur = new;
            level += 1;
        }
    }

    /// Reads up to `buf.len()` bytes starting at `offset`, stopping at
    /// the end of the file. Holes read as zeros. Returns the number of
    /// bytes read.
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        let mut bytes_read = 0;
        let mut offset = offset;
        let mut size = buf.len();
        while size > 0 {
            let sector_ofs = offset % SECTOR_SIZE;
            let inode_left = self.length().saturating_sub(offset);
            let chunk = size.min(inode_left).min(SECTOR_SIZE - sector_ofs);
            if chunk == 0 {
                break;
            }
            let Ok(block) = self.data_block(offset, LockMode::Shared, false) else {
                break;
            };
            let out = &mut buf[bytes_read..bytes_read + chunk];
            match block {
                Some(g) => out.copy_from_slice(&g.inner()[sector_ofs..sector_ofs + chunk]),
                None => out.fill(0),
            }
            size -= chunk;
            offset += chunk;
            bytes_read += chunk;
        }
        bytes_read
    }

    /// Writes `buf` at `offset`, extending the file as needed up to the
    /// index maximum. Returns the number of bytes written: 0 while
    /// writes are denied, and possibly short if the device fills up or
    /// the index maximum is hit.
    ///
    /// The new length is published only after the data is in the cache,
    /// so concurrent readers past the old length see either zeros (a
    /// hole) or the new bytes, never uninitialized data.
    pub fn write_at(&self, buf: &[u8], offset: usize) -> usize {
        {
            let mut deny = self.inner.deny.lock().unwrap();
            if deny.deny_write_cnt > 0 {
                return 0;
            }
            deny.write_cnt += 1;
        }

        let mut written = 0;
        let mut offset = offset;
        let mut size = buf.len();
        while size > 0 {
            let sector_ofs = offset % SECTOR_SIZE;
            let inode_left = MAX_LENGTH.saturating_sub(offset);
            let chunk = size.min(inode_left).min(SECTOR_SIZE - sector_ofs);
            if chunk == 0 {
                break;
            }
            let Ok(Some(mut g)) = self.data_block(offset, LockMode::Exclusive, true) else {
                break;
            };
            g.inner_mut()[sector_ofs..sector_ofs + chunk]
                .copy_from_slice(&buf[written..written + chunk]);
            g.mark_dirty();
            drop(g);

            size -= chunk;
            offset += chunk;
            written += chunk;
        }
        self.publish_length(offset);

        let mut deny = self.inner.deny.lock().unwrap();
        deny.write_cnt -= 1;
        if deny.write_cnt == 0 {
            self.inner.no_write.notify_all();
        }
        written
    }

    /// Raises the on-disk length to `end` if the file grew, re-checking
    /// under the header sector's exclusive lock so racing growers only
    /// ever move the length forward.
    fn publish_length(&self, end: usize) {
        if end <= self.length() {
            return;
        }
        let mut g = self.fs.cache.lock(self.inner.sector, LockMode::Exclusive);
        let grew = {
            let disk = DiskInode::view_mut(g.inner_mut());
            if end as u32 > disk.length {
                disk.length = end as u32;
                true
            } else {
                false
            }
        };
        if grew {
            g.mark_dirty();
        }
    }

    /// Blocks until no writer is inside [`Inode::write_at`], then denies
    /// further writes. May be called at most once per open handle.
    pub fn deny_write(&self) {
        let mut deny = self.inner.deny.lock().unwrap();
        while deny.write_cnt > 0 {
            deny = self.inner.no_write.wait(deny).unwrap();
        }
        deny.deny_write_cnt += 1;
        assert!(deny.deny_write_cnt <= self.open_cnt());
    }

    /// Re-enables writes. Must be called once per preceding
    /// [`Inode::deny_write`] on this inode, before the handle closes.
    pub fn allow_write(&self) {
        let mut deny = self.inner.deny.lock().unwrap();
        assert!(deny.deny_write_cnt > 0);
        assert!(deny.deny_write_cnt <= self.open_cnt());
        deny.deny_write_cnt -= 1;
    }
}

/// Frees every sector owned by the removed inode at `header`, post-order
/// through the indirect tree, and finally the inode sector itself.
pub(crate) fn erase(fs: &FileSys, header: Sector) {
    log::debug!("inode: erasing {:?}", header);
    let g = fs.cache.lock(header, LockMode::Exclusive);
    let disk = DiskInode::view(g.inner());
    for (slot, &ptr) in disk.sectors.iter().enumerate() {
        if ptr != 0 {
            erase_tree(fs, Sector(ptr), hierarchy(slot));
        }
    }
    drop(g);
    fs.cache.free(header);
    fs.free_map.release(header);
}

fn erase_tree(fs: &FileSys, sector: Sector, depth: usize) {
    if depth > 0 {
        let g = fs.cache.lock(sector, LockMode::Exclusive);
        let ps = ptrs(g.inner());
        for &p in ps.iter() {
            if p != 0 {
                erase_tree(fs, Sector(p), depth - 1);
            }
        }
    }
    fs.cache.free(sector);
    fs.free_map.release(sector);
}
