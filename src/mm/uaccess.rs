//! Kernel access to user buffers: validate, pin, copy, unpin.
//!
//! A syscall that reads or writes a user buffer must keep every touched
//! page resident while the kernel holds a pointer into it — otherwise
//! eviction could pull the page out from under a file read that blocks
//! on the disk. [`MmStruct::pin_buffer`] walks the buffer page by page,
//! faults each page in (growing the stack when the address qualifies),
//! verifies writability for writes, and pins the pages; the returned
//! [`PinnedBuffer`] unpins on drop, at syscall exit.
//!
//! [`MmStruct::copy_in`] and [`MmStruct::copy_out`] are the kernel's
//! user-memory accessors. They translate through the page table the way
//! the MMU would — setting accessed and dirty bits — and retry if a
//! page is evicted between the fault and the copy. An invalid address
//! surfaces as [`KernelError::BadAddress`] and the dispatcher terminates
//! the process.

use crate::mm::mm_struct::MmStruct;
use crate::mm::{Va, PAGE_SIZE};
use crate::KernelError;

/// A user buffer held resident for the duration of a kernel operation.
/// Unpins its pages when dropped.
pub struct PinnedBuffer<'a> {
    mm: &'a MmStruct,
    base: Va,
    /// Bytes covered by pinned pages so far; grows as pinning proceeds
    /// so a failed pin unwinds exactly the prefix it claimed.
    covered: usize,
}

impl MmStruct {
    /// Validates and pins the buffer `[base, base + len)`.
    ///
    /// Each page is faulted in synchronously (or created by stack
    /// growth, judged against `esp`) and then exempted from eviction.
    /// With `write` set, every page must be writable.
    pub fn pin_buffer(
        &self,
        base: Va,
        len: usize,
        esp: Va,
        write: bool,
    ) -> Result<PinnedBuffer<'_>, KernelError> {
        let end = base.0.checked_add(len).ok_or(KernelError::BadAddress)?;
        if len > 0 && !Va(end - 1).is_user() {
            return Err(KernelError::BadAddress);
        }
        let mut pinned = PinnedBuffer {
            mm: self,
            base,
            covered: 0,
        };
        let mut page = base.page_down();
        while page.0 < end {
            self.pin_one(page, esp, write)?;
            pinned.covered = (page.0 + PAGE_SIZE).saturating_sub(base.0).min(len);
            page = page + PAGE_SIZE;
        }
        Ok(pinned)
    }

    fn pin_one(&self, page: Va, esp: Va, write: bool) -> Result<(), KernelError> {
        self.page_fault(page, write, esp)?;
        let mut sp = self.space.0.lock().unwrap();
        let spte = sp.spt.get_mut(page).ok_or(KernelError::BadAddress)?;
        if write && !spte.writable {
            return Err(KernelError::InvalidAccess);
        }
        spte.pinned = true;
        Ok(())
    }

    /// Copies `buf` into user memory at `va`, faulting pages in as
    /// needed. Fails with [`KernelError::InvalidAccess`] on a read-only
    /// page and [`KernelError::BadAddress`] on an unmapped one; plain
    /// accesses never grow the stack.
    pub fn copy_out(&self, va: Va, buf: &[u8]) -> Result<(), KernelError> {
        self.user_access(va, buf.len(), true, |data, page_ofs, buf_ofs, n| {
            data[page_ofs..page_ofs + n].copy_from_slice(&buf[buf_ofs..buf_ofs + n]);
        })
    }

    /// Copies user memory at `va` into `buf`, faulting pages in as
    /// needed.
    pub fn copy_in(&self, va: Va, buf: &mut [u8]) -> Result<(), KernelError> {
        self.user_access(va, buf.len(), false, |data, page_ofs, buf_ofs, n| {
            buf[buf_ofs..buf_ofs + n].copy_from_slice(&data[page_ofs..page_ofs + n]);
        })
    }

    /// Page-chunked user access through the page table, setting
    /// accessed/dirty bits like the MMU. Retries a chunk whose page is
    /// evicted between the fault and the copy.
    fn user_access(
        &self,
        va: Va,
        len: usize,
        write: bool,
        mut op: impl FnMut(&mut [u8; PAGE_SIZE], usize, usize, usize),
    ) -> Result<(), KernelError> {
        let end = va.0.checked_add(len).ok_or(KernelError::BadAddress)?;
        let mut cur = va.0;
        let mut done = 0;
        while cur < end {
            let page = Va(cur).page_down();
            let page_ofs = cur - page.0;
            let n = (PAGE_SIZE - page_ofs).min(end - cur);
            loop {
                // `esp` above user space: a plain access must never
                // trigger stack growth.
                self.page_fault(Va(cur), write, Va(usize::MAX))?;
                let mut sp = self.space.0.lock().unwrap();
                let Some(frame) = sp.pt.lookup(page).map(|pte| pte.frame()) else {
                    // Evicted in the window after the fault; fault again.
                    continue;
                };
                sp.pt.mark_access(page, write);
                // Copy under the space lock so eviction (which try-locks
                // the space) cannot steal the frame mid-copy.
                self.vm()
                    .pool
                    .with_frame(frame, |data| op(data, page_ofs, done, n));
                break;
            }
            cur += n;
            done += n;
        }
        Ok(())
    }
}

impl Drop for PinnedBuffer<'_> {
    fn drop(&mut self) {
        let mut sp = self.mm.space.0.lock().unwrap();
        let end = self.base.0 + self.covered;
        let mut page = self.base.page_down();
        while page.0 < end {
            if let Some(spte) = sp.spt.get_mut(page) {
                spte.pinned = false;
            }
            page = page + PAGE_SIZE;
        }
    }
}
