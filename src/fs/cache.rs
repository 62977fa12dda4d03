//! The block cache.
//!
//! A fixed pool of [`CACHE_MAX`] sector-sized buffers sits between the
//! inode layer and the filesystem device. Every sector read or written
//! goes through a buffer; a buffer holds at most one sector at a time,
//! and at most one buffer holds any given sector.
//!
//! ## Locking protocol
//!
//! Each buffer carries reader/writer counts plus waiter counts, guarded
//! by a per-buffer entry lock with two condition variables:
//!
//! - `no_writers` — readers wait here while a writer holds the buffer or
//!   is queued for it; they re-check `write_cnt` after every wakeup.
//! - `no_need` — writers wait here until nobody holds the buffer; they
//!   re-check `read_cnt`/`write_cnt` after every wakeup.
//!
//! New readers defer to queued writers, which keeps writers from
//! starving. A separate data lock serializes the lazy read from disk so
//! that concurrent readers of a cold buffer issue exactly one device
//! read: one populates, the rest find `up_to_date` set.
//!
//! ## Miss handling and eviction
//!
//! On a miss, a free buffer is bound under the global `sync` lock. If no
//! buffer is free, a clock sweep starting from a revolving hand seizes
//! the first buffer with no holders and no waiters, writes it back if
//! dirty, and unbinds it — unless waiters arrived during the write-back,
//! in which case the buffer is handed to them instead and the whole
//! lookup retries. A sweep that completes a revolution without a victim
//! backs off for about a second before retrying.

use crate::dev::{BlockDevice, Sector, SECTOR_SIZE};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Number of buffers in the cache.
pub const CACHE_MAX: usize = 64;

/// How a cache buffer is held.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LockMode {
    /// Shared access: any number of concurrent readers.
    Shared,
    /// Exclusive access: a single writer, no readers.
    Exclusive,
}

/// Sector payload, aligned so typed views of on-disk structures are
/// well-formed.
#[repr(C, align(8))]
struct Block([u8; SECTOR_SIZE]);

#[derive(Default)]
struct EntryState {
    /// Sector bound to this buffer; `None` means the buffer is free.
    sector: Option<Sector>,
    read_cnt: u32,
    write_cnt: u32,
    read_wait_cnt: u32,
    write_wait_cnt: u32,
}

struct Entry {
    state: Mutex<EntryState>,
    /// Readers wait here while a writer holds or is queued.
    no_writers: Condvar,
    /// Writers wait here while anyone holds the buffer.
    no_need: Condvar,
    /// Serializes population from disk.
    io: Mutex<()>,
    up_to_date: AtomicBool,
    dirty: AtomicBool,
    data: UnsafeCell<Block>,
}

// Safety: `data` is only referenced by holders of the buffer, and the
// reader/writer protocol guarantees either many readers or one writer.
unsafe impl Sync for Entry {}

impl Entry {
    fn new() -> Self {
        Entry {
            state: Mutex::new(EntryState::default()),
            no_writers: Condvar::new(),
            no_need: Condvar::new(),
            io: Mutex::new(()),
            up_to_date: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            data: UnsafeCell::new(Block([0; SECTOR_SIZE])),
        }
    }
}

/// Outcome of a single lookup attempt.
///
/// Eviction may run to completion without granting the caller anything:
/// it frees a buffer but must re-enter the lookup from scratch, because
/// the freed buffer may have been handed to waiters. The caller drives a
/// small state machine over these three results.
enum TryLock {
    Acquired(usize),
    /// A buffer was evicted (or handed over); retry immediately.
    Retry,
    /// A full revolution found no victim; back off before retrying.
    NoVictim,
}

struct CacheInner {
    device: Arc<dyn BlockDevice>,
    entries: Vec<Entry>,
    /// Guards binding changes; the value is the clock hand.
    sync: Mutex<usize>,
}

impl CacheInner {
    /// Waits until the buffer at `idx` is held in `mode`, starting from a
    /// held entry lock. The caller must not hold `sync`.
    fn acquire(&self, idx: usize, mode: LockMode, guard: std::sync::MutexGuard<'_, EntryState>) {
        let e = &self.entries[idx];
        let mut s = guard;
        match mode {
            LockMode::Shared => {
                s.read_wait_cnt += 1;
                if s.write_cnt > 0 || s.write_wait_cnt > 0 {
                    loop {
                        s = e.no_writers.wait(s).unwrap();
                        if s.write_cnt == 0 {
                            break;
                        }
                    }
                }
                s.read_cnt += 1;
                s.read_wait_cnt -= 1;
            }
            LockMode::Exclusive => {
                s.write_wait_cnt += 1;
                while s.read_cnt > 0 || s.write_cnt > 0 {
                    s = e.no_need.wait(s).unwrap();
                }
                s.write_cnt = 1;
                s.write_wait_cnt -= 1;
            }
        }
    }

    /// Drops rights held in `mode` on the buffer at `idx` and wakes
    /// waiters. Writers hand the buffer to queued readers as a group, or
    /// to a single queued writer.
    fn release(&self, idx: usize, mode: LockMode) {
        let e = &self.entries[idx];
        let mut s = e.state.lock().unwrap();
        match mode {
            LockMode::Shared => {
                s.read_cnt -= 1;
                if s.read_cnt == 0 {
                    e.no_need.notify_one();
                }
            }
            LockMode::Exclusive => {
                s.write_cnt = 0;
                if s.read_wait_cnt > 0 {
                    e.no_writers.notify_all();
                } else {
                    e.no_need.notify_one();
                }
            }
        }
    }

    /// One lookup attempt: find the sector, or bind a free buffer, or
    /// evict. See [`TryLock`] for the contract.
    fn try_lock(&self, sector: Sector, mode: LockMode) -> TryLock {
        let mut hand = self.sync.lock().unwrap();

        // Already cached? Register as a waiter before releasing `sync` so
        // eviction cannot unbind the buffer underneath us.
        for (i, e) in self.entries.iter().enumerate() {
            let s = e.state.lock().unwrap();
            if s.sector == Some(sector) {
                drop(hand);
                self.acquire(i, mode, s);
                return TryLock::Acquired(i);
            }
        }

        // Not cached: bind a free buffer.
        for (i, e) in self.entries.iter().enumerate() {
            let mut s = e.state.lock().unwrap();
            if s.sector.is_none() {
                debug_assert!(s.read_cnt == 0 && s.write_cnt == 0);
                s.sector = Some(sector);
                match mode {
                    LockMode::Shared => s.read_cnt = 1,
                    LockMode::Exclusive => s.write_cnt = 1,
                }
                e.up_to_date.store(false, Ordering::Release);
                e.dirty.store(false, Ordering::Release);
                return TryLock::Acquired(i);
            }
        }

        // No free buffer: clock sweep for a victim with no holders and no
        // waiters.
        for _ in 0..CACHE_MAX {
            let i = *hand;
            *hand = (*hand + 1) % CACHE_MAX;

            let e = &self.entries[i];
            let mut s = e.state.lock().unwrap();
            if s.read_cnt == 0 && s.write_cnt == 0 && s.read_wait_cnt == 0 && s.write_wait_cnt == 0
            {
                // Seize the buffer exclusively, then write it back with no
                // locks held.
                s.write_cnt = 1;
                let victim = s.sector;
                drop(s);
                drop(hand);

                if e.up_to_date.load(Ordering::Acquire) && e.dirty.load(Ordering::Acquire) {
                    let victim = victim.expect("evicting an unbound buffer");
                    log::debug!("cache: evict {:?} (dirty, writing back)", victim);
                    // Safety: the buffer was seized exclusively above.
                    self.device.write(victim, unsafe { &(*e.data.get()).0 });
                    e.dirty.store(false, Ordering::Release);
                }

                let mut s = e.state.lock().unwrap();
                s.write_cnt = 0;
                if s.read_wait_cnt == 0 && s.write_wait_cnt == 0 {
                    s.sector = None;
                } else if s.read_wait_cnt > 0 {
                    // Waiters arrived during write-back: the buffer is
                    // theirs, not ours.
                    e.no_writers.notify_all();
                } else {
                    e.no_need.notify_one();
                }
                return TryLock::Retry;
            }
        }

        TryLock::NoVictim
    }

    /// Returns the index of a buffer bound to `sector` and held in
    /// `mode`, evicting and backing off as needed.
    fn lock(&self, sector: Sector, mode: LockMode) -> usize {
        loop {
            match self.try_lock(sector, mode) {
                TryLock::Acquired(i) => return i,
                TryLock::Retry => continue,
                TryLock::NoVictim => std::thread::sleep(Duration::from_millis(1000)),
            }
        }
    }

    /// Lazily populates the buffer at `idx` from disk.
    ///
    /// The data lock guarantees a cold buffer is read exactly once even
    /// under concurrent readers.
    fn ensure_up_to_date(&self, idx: usize) {
        let e = &self.entries[idx];
        if e.up_to_date.load(Ordering::Acquire) {
            return;
        }
        let _io = e.io.lock().unwrap();
        if e.up_to_date.load(Ordering::Acquire) {
            return;
        }
        let sector = e
            .state
            .lock()
            .unwrap()
            .sector
            .expect("populating an unbound buffer");
        // Safety: holders that have not observed `up_to_date` are blocked
        // on the data lock or have yet to touch the payload, so the write
        // below is unobserved.
        self.device.read(sector, unsafe { &mut (*e.data.get()).0 });
        e.dirty.store(false, Ordering::Release);
        e.up_to_date.store(true, Ordering::Release);
    }

    /// Writes back every dirty, populated buffer.
    fn flush(&self) {
        for i in 0..CACHE_MAX {
            let e = &self.entries[i];
            let s = e.state.lock().unwrap();
            if s.sector.is_none() {
                continue;
            }
            self.acquire(i, LockMode::Exclusive, s);
            if e.up_to_date.load(Ordering::Acquire) && e.dirty.load(Ordering::Acquire) {
                let sector = e
                    .state
                    .lock()
                    .unwrap()
                    .sector
                    .expect("bound buffer lost its sector while held");
                // Safety: exclusive rights held.
                self.device.write(sector, unsafe { &(*e.data.get()).0 });
                e.dirty.store(false, Ordering::Release);
            }
            self.release(i, LockMode::Exclusive);
        }
    }

    /// Background-flush pass: write back dirty buffers, but only those
    /// that are idle right now. Never blocks behind a holder.
    fn flush_idle(&self) {
        for e in &self.entries {
            let Ok(mut s) = e.state.try_lock() else {
                continue;
            };
            if s.sector.is_none()
                || s.read_cnt > 0
                || s.write_cnt > 0
                || s.read_wait_cnt > 0
                || s.write_wait_cnt > 0
                || !e.dirty.load(Ordering::Acquire)
                || !e.up_to_date.load(Ordering::Acquire)
            {
                continue;
            }
            s.write_cnt = 1;
            let sector = s.sector.expect("bound buffer lost its sector while held");
            drop(s);

            // Safety: seized exclusively above.
            self.device.write(sector, unsafe { &(*e.data.get()).0 });
            e.dirty.store(false, Ordering::Release);

            let mut s = e.state.lock().unwrap();
            s.write_cnt = 0;
            if s.read_wait_cnt > 0 {
                e.no_writers.notify_all();
            } else if s.write_wait_cnt > 0 {
                e.no_need.notify_one();
            }
        }
    }

    /// Releases the binding for `sector` if nobody holds or awaits it.
    fn free(&self, sector: Sector) {
        let _hand = self.sync.lock().unwrap();
        for e in &self.entries {
            let mut s = e.state.lock().unwrap();
            if s.sector == Some(sector) {
                if s.read_cnt == 0
                    && s.write_cnt == 0
                    && s.read_wait_cnt == 0
                    && s.write_wait_cnt == 0
                {
                    s.sector = None;
                    e.dirty.store(false, Ordering::Release);
                }
                return;
            }
        }
    }
}

/// The shared sector cache in front of a block device.
///
/// Owns the buffer pool plus two service threads: a readahead worker fed
/// by a bounded hint queue, and a periodic flusher that writes back idle
/// dirty buffers. Both stop when the cache is dropped; the drop also
/// performs a final flush.
pub struct BlockCache {
    inner: Arc<CacheInner>,
    readahead_tx: Option<SyncSender<Sector>>,
    readahead: Option<JoinHandle<()>>,
    flush_signal: Arc<(Mutex<bool>, Condvar)>,
    flusher: Option<JoinHandle<()>>,
}

impl BlockCache {
    /// Creates a cache over `device`, flushing idle dirty buffers every
    /// `flush_every`.
    pub fn new(device: Arc<dyn BlockDevice>, flush_every: Duration) -> Self {
        let inner = Arc::new(CacheInner {
            device,
            entries: (0..CACHE_MAX).map(|_| Entry::new()).collect(),
            sync: Mutex::new(0),
        });

        let (tx, rx) = sync_channel::<Sector>(CACHE_MAX);
        let worker_inner = inner.clone();
        let readahead = std::thread::spawn(move || {
            while let Ok(sector) = rx.recv() {
                let idx = worker_inner.lock(sector, LockMode::Shared);
                worker_inner.ensure_up_to_date(idx);
                worker_inner.release(idx, LockMode::Shared);
            }
        });

        let flush_signal = Arc::new((Mutex::new(false), Condvar::new()));
        let flusher_signal = flush_signal.clone();
        let flusher_inner = inner.clone();
        let flusher = std::thread::spawn(move || loop {
            let (stop, cvar) = &*flusher_signal;
            let guard = stop.lock().unwrap();
            let (guard, _) = cvar
                .wait_timeout_while(guard, flush_every, |stop| !*stop)
                .unwrap();
            if *guard {
                break;
            }
            drop(guard);
            flusher_inner.flush_idle();
        });

        BlockCache {
            inner,
            readahead_tx: Some(tx),
            readahead: Some(readahead),
            flush_signal,
            flusher: Some(flusher),
        }
    }

    /// Returns a buffer bound to `sector`, held in `mode`. Blocks until
    /// rights of at least the requested strength are granted.
    pub fn lock(&self, sector: Sector, mode: LockMode) -> CacheGuard<'_> {
        let idx = self.inner.lock(sector, mode);
        CacheGuard {
            inner: &*self.inner,
            idx,
            mode,
        }
    }

    /// Queues `sector` for background readahead. The hint is dropped
    /// silently if the queue is full or the sector is out of range.
    pub fn readahead(&self, sector: Sector) {
        if sector.0 >= self.inner.device.size() {
            return;
        }
        if let Some(tx) = &self.readahead_tx {
            let _ = tx.try_send(sector);
        }
    }

    /// Writes every dirty buffer back to the device.
    pub fn flush(&self) {
        self.inner.flush();
    }

    /// Releases the binding for `sector` if the buffer is idle, so the
    /// buffer can be reused without a write-back. Used when the sector is
    /// being deallocated.
    pub fn free(&self, sector: Sector) {
        self.inner.free(sector);
    }

    #[cfg(test)]
    fn is_cached(&self, sector: Sector) -> bool {
        self.inner
            .entries
            .iter()
            .any(|e| e.state.lock().unwrap().sector == Some(sector))
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        let (stop, cvar) = &*self.flush_signal;
        *stop.lock().unwrap() = true;
        cvar.notify_all();
        if let Some(flusher) = self.flusher.take() {
            let _ = flusher.join();
        }

        // Dropping the sender ends the readahead worker's queue.
        self.readahead_tx.take();
        if let Some(readahead) = self.readahead.take() {
            let _ = readahead.join();
        }

        self.inner.flush();
    }
}

/// Rights to one cache buffer, released on drop.
///
/// A guard pins the buffer's binding: a held or awaited buffer is never
/// chosen for eviction.
pub struct CacheGuard<'a> {
    inner: &'a CacheInner,
    idx: usize,
    mode: LockMode,
}

impl CacheGuard<'_> {
    fn entry(&self) -> &Entry {
        &self.inner.entries[self.idx]
    }

    /// The buffer payload, read from disk on first touch.
    pub fn inner(&self) -> &[u8; SECTOR_SIZE] {
        self.inner.ensure_up_to_date(self.idx);
        // Safety: rights held; shared access is allowed in either mode.
        unsafe { &(*self.entry().data.get()).0 }
    }

    /// Mutable access to the payload, read from disk on first touch so a
    /// partial overwrite preserves the rest of the sector.
    ///
    /// Requires exclusive rights; the caller still must call
    /// [`CacheGuard::mark_dirty`] once the payload is modified.
    pub fn inner_mut(&mut self) -> &mut [u8; SECTOR_SIZE] {
        assert_eq!(self.mode, LockMode::Exclusive, "exclusive rights required");
        self.inner.ensure_up_to_date(self.idx);
        // Safety: exclusive rights held.
        unsafe { &mut (*self.entry().data.get()).0 }
    }

    /// Fills the buffer with zeros and marks it up-to-date and dirty.
    /// Used for freshly allocated sectors, which must not be read from
    /// disk first.
    pub fn set_zero(&mut self) {
        assert_eq!(self.mode, LockMode::Exclusive, "exclusive rights required");
        let e = self.entry();
        // Safety: exclusive rights held.
        unsafe {
            (*e.data.get()).0 = [0; SECTOR_SIZE];
        }
        e.up_to_date.store(true, Ordering::Release);
        e.dirty.store(true, Ordering::Release);
    }

    /// Marks the buffer dirty so it is written back before the binding is
    /// recycled.
    pub fn mark_dirty(&self) {
        let e = self.entry();
        debug_assert!(e.up_to_date.load(Ordering::Acquire));
        e.dirty.store(true, Ordering::Release);
    }
}

impl Drop for CacheGuard<'_> {
    fn drop(&mut self) {
        self.inner.release(self.idx, self.mode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dev::MemDisk;
    use std::sync::atomic::AtomicU32;

    fn cache_over(sectors: u32) -> (Arc<MemDisk>, BlockCache) {
        let disk = Arc::new(MemDisk::new(sectors));
        let cache = BlockCache::new(disk.clone(), Duration::from_secs(3600));
        (disk, cache)
    }

    #[test]
    fn miss_populates_from_device() {
        let (disk, cache) = cache_over(8);
        let mut block = [0u8; SECTOR_SIZE];
        block[7] = 0x77;
        disk.write(Sector(2), &block);

        let guard = cache.lock(Sector(2), LockMode::Shared);
        assert_eq!(guard.inner()[7], 0x77);
    }

    #[test]
    fn dirty_buffers_reach_disk_on_flush() {
        let (disk, cache) = cache_over(8);
        {
            let mut guard = cache.lock(Sector(1), LockMode::Exclusive);
            guard.inner_mut()[0] = 0xab;
            guard.mark_dirty();
        }
        cache.flush();

        let mut out = [0u8; SECTOR_SIZE];
        disk.read(Sector(1), &mut out);
        assert_eq!(out[0], 0xab);
    }

    #[test]
    fn set_zero_skips_the_device_read() {
        let (disk, cache) = cache_over(8);
        let mut block = [0xffu8; SECTOR_SIZE];
        disk.write(Sector(3), &block);

        {
            let mut guard = cache.lock(Sector(3), LockMode::Exclusive);
            guard.set_zero();
            assert_eq!(guard.inner(), &[0u8; SECTOR_SIZE]);
        }
        cache.flush();
        disk.read(Sector(3), &mut block);
        assert_eq!(block, [0u8; SECTOR_SIZE]);
    }

    #[test]
    fn eviction_preserves_data_across_the_pool() {
        // Twice the pool size forces every buffer through eviction.
        let total = (2 * CACHE_MAX) as u32;
        let (disk, cache) = cache_over(total);
        for i in 0..total {
            let mut guard = cache.lock(Sector(i), LockMode::Exclusive);
            guard.set_zero();
            guard.inner_mut()[0] = i as u8;
            guard.mark_dirty();
        }
        for i in 0..total {
            let guard = cache.lock(Sector(i), LockMode::Shared);
            assert_eq!(guard.inner()[0], i as u8, "sector {i} lost its data");
        }
        drop(cache);

        let mut out = [0u8; SECTOR_SIZE];
        disk.read(Sector(0), &mut out);
        assert_eq!(out[0], 0);
        disk.read(Sector(total - 1), &mut out);
        assert_eq!(out[0], (total - 1) as u8);
    }

    #[test]
    fn writer_excludes_readers() {
        let (_disk, cache) = cache_over(8);
        let cache = Arc::new(cache);
        let observed = Arc::new(AtomicU32::new(0));

        let mut guard = cache.lock(Sector(0), LockMode::Exclusive);
        guard.inner_mut()[0] = 1;
        guard.mark_dirty();

        let t = {
            let cache = cache.clone();
            let observed = observed.clone();
            std::thread::spawn(move || {
                let guard = cache.lock(Sector(0), LockMode::Shared);
                observed.store(guard.inner()[0] as u32, Ordering::SeqCst);
            })
        };

        // The reader must not get in while we hold exclusive rights.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(observed.load(Ordering::SeqCst), 0);
        guard.inner_mut()[0] = 2;
        drop(guard);

        t.join().unwrap();
        assert_eq!(observed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn concurrent_readers_share_a_buffer() {
        let (disk, cache) = cache_over(8);
        let mut block = [0u8; SECTOR_SIZE];
        block[0] = 9;
        disk.write(Sector(5), &block);

        let cache = Arc::new(cache);
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    let guard = cache.lock(Sector(5), LockMode::Shared);
                    guard.inner()[0]
                })
            })
            .collect();
        for t in threads {
            assert_eq!(t.join().unwrap(), 9);
        }
    }

    #[test]
    fn readahead_pulls_the_sector_in() {
        let (_disk, cache) = cache_over(8);
        cache.readahead(Sector(6));
        for _ in 0..100 {
            if cache.is_cached(Sector(6)) {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("readahead never cached the sector");
    }

    #[test]
    fn out_of_range_readahead_is_dropped() {
        let (_disk, cache) = cache_over(8);
        cache.readahead(Sector(1000));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!cache.is_cached(Sector(1000)));
    }

    #[test]
    fn flush_daemon_writes_back_idle_buffers() {
        let disk = Arc::new(MemDisk::new(8));
        let cache = BlockCache::new(disk.clone(), Duration::from_millis(20));
        {
            let mut guard = cache.lock(Sector(2), LockMode::Exclusive);
            guard.set_zero();
            guard.inner_mut()[1] = 0xcd;
            guard.mark_dirty();
        }
        let mut out = [0u8; SECTOR_SIZE];
        for _ in 0..100 {
            disk.read(Sector(2), &mut out);
            if out[1] == 0xcd {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("flush daemon never wrote the buffer back");
    }

    #[test]
    fn free_releases_an_idle_binding() {
        let (_disk, cache) = cache_over(8);
        {
            let _guard = cache.lock(Sector(4), LockMode::Shared);
        }
        assert!(cache.is_cached(Sector(4)));
        cache.free(Sector(4));
        assert!(!cache.is_cached(Sector(4)));
    }
}
