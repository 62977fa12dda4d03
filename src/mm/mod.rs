//! Virtual memory: demand paging, frame management, and swap.
//!
//! A user page is *resident* or *lazy*. The per-process supplemental
//! page table ([`page`]) remembers, for every lazy page, how to make it
//! resident: read it from a file (executable segments, `mmap` regions),
//! pull it from swap, or hand out fresh zeros (a stack page). The global
//! frame table ([`frame`]) tracks who owns each physical frame and runs
//! second-chance eviction when the pool dries up; evicted pages route to
//! the backing file or to the swap device ([`swap`]) depending on their
//! kind and dirtiness.
//!
//! ```text
//!  user access faults
//!         │
//!         ▼
//!  ┌─────────────────┐  miss, in stack window   ┌───────────────────┐
//!  │ MmStruct::      │─────────────────────────▶│ fresh zeroed page │
//!  │   page_fault    │                          └───────────────────┘
//!  └───────┬─────────┘
//!          │ supplemental entry found
//!          ▼
//!  ┌─────────────────┐   Elf / Mmap   ┌─────────────────────────┐
//!  │ load dispatch   │───────────────▶│ read file through cache │
//!  │                 │   Swap         ├─────────────────────────┤
//!  │                 │───────────────▶│ read 8 sectors of swap  │
//!  └───────┬─────────┘                └─────────────────────────┘
//!          ▼
//!   install PTE, mark present
//! ```
//!
//! Frames for the load come from [`Vm::new`]'s pool; when it is empty,
//! the frame table evicts (see [`frame`]) and the allocation retries.

pub mod frame;
pub mod mm_struct;
pub mod page;
pub mod page_table;
pub mod palloc;
pub mod swap;
pub mod uaccess;

use crate::dev::BlockDevice;
use frame::FrameTable;
use palloc::UserPool;
use std::sync::{Arc, Mutex};
use swap::SwapManager;

/// Size of a page, in bytes.
pub const PAGE_SIZE: usize = 4096;
/// Sectors per page on a block device.
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / crate::dev::SECTOR_SIZE;
/// First address above user space.
pub const PHYS_BASE: usize = 0xC000_0000;
/// Maximum stack size: the stack-growth window is
/// `[PHYS_BASE - STACK_LIMIT, PHYS_BASE)`.
pub const STACK_LIMIT: usize = 8 * 1024 * 1024;
/// How far below the stack pointer a fault still counts as stack growth.
/// x86 `PUSHA` touches 32 bytes below `esp`.
pub(crate) const STACK_SLACK: usize = 32;

const _: () = assert!(PHYS_BASE % PAGE_SIZE == 0);
const _: () = assert!(STACK_LIMIT % PAGE_SIZE == 0);

/// A user virtual address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub struct Va(pub usize);

impl Va {
    /// Rounds down to the containing page boundary.
    #[inline]
    pub fn page_down(self) -> Va {
        Va(self.0 & !(PAGE_SIZE - 1))
    }

    /// Offset within the containing page.
    #[inline]
    pub fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Whether the address lies in user space.
    #[inline]
    pub fn is_user(self) -> bool {
        self.0 < PHYS_BASE
    }
}

impl core::ops::Add<usize> for Va {
    type Output = Va;
    fn add(self, rhs: usize) -> Va {
        Va(self.0 + rhs)
    }
}

/// Machine-wide virtual memory state: the user frame pool, the frame
/// table, and the swap device. Shared by every process.
pub struct Vm {
    /// Physical allocator for user frames.
    pub pool: UserPool,
    /// Owner tracking and eviction.
    pub frames: FrameTable,
    /// Swap slots for evicted anonymous pages.
    pub swap: SwapManager,
    /// Serializes file I/O issued from paging paths (segment loads,
    /// mmap write-back), so eviction and fault-ins do not interleave
    /// their file operations.
    pub(crate) io_lock: Mutex<()>,
}

impl Vm {
    /// Creates the VM state with `user_frames` frames of user memory and
    /// swap over `swap_device`.
    pub fn new(user_frames: usize, swap_device: Arc<dyn BlockDevice>) -> Arc<Vm> {
        Arc::new(Vm {
            pool: UserPool::new(user_frames),
            frames: FrameTable::new(),
            swap: SwapManager::new(swap_device),
            io_lock: Mutex::new(()),
        })
    }
}
