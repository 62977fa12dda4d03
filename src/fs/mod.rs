//! The filesystem core: device, cache, allocator, and open inodes.
//!
//! Layering, bottom up:
//!
//! ```text
//! ┌───────────────────────────────────────┐
//! │ Inode handles (inode::Inode)          │  read_at / write_at / deny
//! ├───────────────────────────────────────┤
//! │ Block cache (cache::BlockCache)       │  64 buffers, RW locks
//! ├───────────────────────────────────────┤
//! │ Free map (free_map::FreeMap)          │  sector allocation
//! ├───────────────────────────────────────┤
//! │ Block device (crate::dev)             │  512-byte sectors
//! └───────────────────────────────────────┘
//! ```
//!
//! [`FileSys`] ties the pieces together and keeps the open-inode
//! registry: at most one in-memory inode exists per sector, however many
//! handles are open on it. Name resolution, directories, and descriptor
//! tables are outer layers built on these primitives.

pub mod cache;
pub mod free_map;
pub mod inode;

use crate::dev::{BlockDevice, Sector};
use crate::fs::cache::{BlockCache, LockMode};
use crate::fs::free_map::FreeMap;
use crate::fs::inode::{DiskInode, Inode, InodeInner, InodeType, INODE_MAGIC};
use crate::sync::SpinLock;
use crate::KernelError;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// How often the cache's background flusher writes back idle dirty
/// buffers.
const FLUSH_EVERY: Duration = Duration::from_secs(30);

/// A mounted filesystem over one block device.
pub struct FileSys {
    pub(crate) cache: BlockCache,
    pub(crate) free_map: FreeMap,
    pub(crate) inodes: SpinLock<BTreeMap<Sector, Arc<InodeInner>>>,
}

impl FileSys {
    /// Formats `device` and returns the mounted filesystem.
    pub fn format(device: Arc<dyn BlockDevice>) -> Arc<Self> {
        let sectors = device.size();
        log::info!("fs: formatting device with {} sectors", sectors);
        Arc::new(FileSys {
            cache: BlockCache::new(device, FLUSH_EVERY),
            free_map: FreeMap::new(sectors),
            inodes: SpinLock::new(BTreeMap::new()),
        })
    }

    /// Creates a fresh inode of `itype` on a newly allocated sector and
    /// returns an open handle to it.
    pub fn create(self: &Arc<Self>, itype: InodeType) -> Result<Inode, KernelError> {
        let sector = self.free_map.allocate().ok_or(KernelError::NoSpace)?;
        {
            let mut g = self.cache.lock(sector, LockMode::Exclusive);
            g.set_zero();
            let disk = DiskInode::view_mut(g.inner_mut());
            disk.ftype = itype as u32;
            disk.length = 0;
            disk.magic = INODE_MAGIC;
        }
        let inode = self.open(sector);
        if inode.is_err() {
            self.free_map.release(sector);
        }
        inode
    }

    /// Opens the inode at `sector`.
    ///
    /// The registry deduplicates: a sector already open yields another
    /// handle to the same in-memory inode.
    pub fn open(self: &Arc<Self>, sector: Sector) -> Result<Inode, KernelError> {
        if let Some(inner) = self.inodes.lock().get(&sector) {
            inner.open_cnt_ref().fetch_add(1, Ordering::Relaxed);
            return Ok(Inode {
                fs: self.clone(),
                inner: inner.clone(),
            });
        }

        // Validate before registering; the registry lock is a spinlock
        // and must not be held across a cache wait.
        {
            let g = self.cache.lock(sector, LockMode::Shared);
            if DiskInode::view(g.inner()).magic != INODE_MAGIC {
                return Err(KernelError::FilesystemCorrupted("inode magic mismatch"));
            }
        }

        let mut reg = self.inodes.lock();
        if let Some(inner) = reg.get(&sector) {
            inner.open_cnt_ref().fetch_add(1, Ordering::Relaxed);
            return Ok(Inode {
                fs: self.clone(),
                inner: inner.clone(),
            });
        }
        let inner = Arc::new(InodeInner::new(sector));
        reg.insert(sector, inner.clone());
        Ok(Inode {
            fs: self.clone(),
            inner,
        })
    }

    /// Writes every dirty cache buffer back to the device.
    pub fn flush(&self) {
        self.cache.flush();
    }
}
