//! The global frame table and its clock (second-chance) eviction policy.
//!
//! One entry per user-pool frame that currently backs some process's page,
//! indexed by the frame number. The table owns entry lifetime: entries are
//! created on registration and destroyed on eviction or on owning-process
//! exit, and nothing else holds pointers to them.

use crate::mem::frame_pool::FramePool;
use crate::sync::mutex::Mutex;
use crate::threading::process::{Pid, ProcessControlBlock};
use crate::vm::page::PageLocation;
use crate::vm::swap::{SwapSlot, SwapSpace};
use crate::vm::Result;
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::slice;
use log::debug;
use marrowos_shared::mem::{FrameIndex, VirtPage, PAGE_FRAME_SIZE};

struct FrameTableEntry {
    owner: Arc<ProcessControlBlock>,
    /// The user page this frame backs in `owner`'s address space.
    vpage: VirtPage,
    /// A pinned frame is never chosen as an eviction victim. Held only while
    /// the frame's contents are being established.
    pinned: bool,
}

struct FrameTableInner {
    entries: Box<[Option<FrameTableEntry>]>,
    /// The clock hand; only ever advances (modulo table size).
    hand: usize,
    occupied: usize,
}

pub struct FrameTable {
    inner: Mutex<FrameTableInner>,
}

impl FrameTable {
    /// A table with one slot per frame in the user pool.
    pub fn new(capacity: usize) -> FrameTable {
        let mut entries = alloc::vec::Vec::with_capacity(capacity);
        entries.resize_with(capacity, || None);
        FrameTable {
            inner: Mutex::new(FrameTableInner {
                entries: entries.into_boxed_slice(),
                hand: 0,
                occupied: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn occupied(&self) -> usize {
        self.inner.lock().occupied
    }

    /// True if some entry is owned by `pid` (teardown-completeness checks).
    pub fn owns_any(&self, pid: Pid) -> bool {
        self.inner
            .lock()
            .entries
            .iter()
            .flatten()
            .any(|e| e.owner.pid == pid)
    }

    /// Records that `frame` now backs `vpage` for `owner`. The new entry
    /// starts pinned; the caller unpins once the frame's contents are in
    /// place.
    pub fn register(&self, owner: &Arc<ProcessControlBlock>, vpage: VirtPage, frame: FrameIndex) {
        let mut inner = self.inner.lock();
        let slot = &mut inner.entries[frame.index()];
        assert!(
            slot.is_none(),
            "frame {} registered while already tracked",
            frame.index()
        );
        *slot = Some(FrameTableEntry {
            owner: Arc::clone(owner),
            vpage,
            pinned: true,
        });
        inner.occupied += 1;
    }

    pub fn pin(&self, frame: FrameIndex) {
        self.set_pinned(frame, true);
    }

    pub fn unpin(&self, frame: FrameIndex) {
        self.set_pinned(frame, false);
    }

    fn set_pinned(&self, frame: FrameIndex, pinned: bool) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries[frame.index()].as_mut() {
            entry.pinned = pinned;
        }
    }

    /// Removes every entry owned by `pid`, clearing its translations and
    /// returning the frames to the pool. Safe against an in-flight eviction:
    /// the caller holds `pid`'s frame-access lock, so an evictor that
    /// already picked one of these frames has either finished with it or
    /// skipped it.
    pub fn release_all(&self, pid: Pid, pool: &Mutex<FramePool>) {
        let mut inner = self.inner.lock();
        for at in 0..inner.entries.len() {
            let Some(entry) = inner.entries[at].take() else {
                continue;
            };
            if entry.owner.pid != pid {
                inner.entries[at] = Some(entry);
                continue;
            }
            inner.occupied -= 1;

            let frame = FrameIndex::new(at);
            let mut pd = entry.owner.page_manager.lock();
            pd.unmap(entry.vpage);
            pd.unmap(frame.kernel_page());
            drop(pd);
            pool.lock().dealloc(frame);
        }
    }

    /// Runs the clock hand over the table once (two revolutions at most:
    /// one may only clear accessed bits, the next then finds its victim),
    /// evicts the chosen frame, and returns it free of any live mapping.
    ///
    /// Returns `Ok(None)` when no frame could be evicted this pass: every
    /// slot was empty, pinned, freshly accessed, or owned by a process whose
    /// frame-access lock is contended. The caller retries after backing off.
    ///
    /// `current` is the process doing the allocating: its own frame-access
    /// lock is already held by the fault path, so victims it owns are
    /// persisted without re-acquiring it.
    pub fn try_evict(
        &self,
        current: &ProcessControlBlock,
        pool: &Mutex<FramePool>,
        swap: &SwapSpace,
    ) -> Result<Option<FrameIndex>> {
        let mut inner = self.inner.lock();
        if inner.occupied == 0 {
            return Ok(None);
        }
        let len = inner.entries.len();

        for _ in 0..2 * len {
            let at = inner.hand;
            inner.hand = (inner.hand + 1) % len;

            let (owner, vpage) = match &inner.entries[at] {
                Some(entry) if !entry.pinned => (Arc::clone(&entry.owner), entry.vpage),
                _ => continue,
            };

            // Serialize against the owner re-faulting this page. Probing
            // instead of blocking keeps the lock order acyclic: a contended
            // owner is skipped like a pinned frame.
            let _owner_guard = if owner.pid == current.pid {
                None
            } else {
                match owner.frame_access.try_lock() {
                    Some(guard) => Some(guard),
                    None => continue,
                }
            };

            let frame = FrameIndex::new(at);
            let kpage = frame.kernel_page();

            // Second chance: a recently used page is spared once. The bit is
            // cleared on the user page and its kernel alias, so neither
            // mapping can keep resurrecting the other.
            let dirty = {
                let mut pd = owner.page_manager.lock();
                if pd.is_accessed(vpage) || pd.is_accessed(kpage) {
                    pd.set_accessed(vpage, false);
                    pd.set_accessed(kpage, false);
                    continue;
                }
                pd.is_dirty(vpage) || pd.is_dirty(kpage)
            };

            // A clean page is only droppable if its file copy is still
            // faithful; stack pages and swap round-trippers have no file
            // copy and always persist.
            let has_source = {
                let spt = owner.page_table.lock();
                spt.get(vpage).is_some_and(|e| e.source.is_some())
            };

            let page_ptr = pool.lock().frame_ptr(frame);
            // SAFETY: the victim's owner cannot reload or free this frame
            // while we hold the frame table lock and its frame-access lock;
            // the pool keeps the arena alive.
            let page = unsafe { slice::from_raw_parts(page_ptr, PAGE_FRAME_SIZE) };
            let slot = swap.check_and_persist(dirty || !has_source, page)?;

            {
                let mut spt = owner.page_table.lock();
                if let Some(entry) = spt.get_mut(vpage) {
                    entry.location = match slot {
                        Some(slot) => PageLocation::InSwap { slot },
                        None => PageLocation::InFile,
                    };
                }
            }

            {
                let mut pd = owner.page_manager.lock();
                pd.unmap(vpage);
                pd.unmap(kpage);
            }

            inner.entries[at] = None;
            inner.occupied -= 1;
            debug!(
                "evicted frame {} (pid {} page {:#x}, swap slot {:?})",
                at,
                owner.pid,
                vpage.addr(),
                slot.map(SwapSlot::index),
            );
            return Ok(Some(frame));
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::block_core::{Block, BlockDriver, BlockType};
    use crate::drivers::ram_disk::RamDisk;
    use crate::system::SystemState;
    use crate::vm::swap::SECTORS_PER_SLOT;
    use marrowos_shared::mem::OFFSET;

    fn system(frames: usize) -> SystemState {
        let disk = RamDisk::new(frames * SECTORS_PER_SLOT);
        SystemState::new(
            frames,
            Block::new(BlockType::Swap, "swap0", BlockDriver::Ram(disk)),
        )
    }

    fn page(n: usize) -> VirtPage {
        VirtPage::new(0x1000_0000 + n * PAGE_FRAME_SIZE).unwrap()
    }

    #[test]
    fn occupancy_never_exceeds_capacity() {
        let system = system(3);
        let pcb = system.process.create_process(OFFSET);
        assert_eq!(system.frame_table.capacity(), 3);

        for n in 0..3 {
            let frame = system.frame_pool.lock().alloc().unwrap();
            system.frame_table.register(&pcb, page(n), frame);
            system.frame_table.unpin(frame);
        }
        assert_eq!(system.frame_table.occupied(), 3);
        // the pool is the capacity bound: no fourth frame exists to register
        assert!(system.frame_pool.lock().alloc().is_none());
    }

    #[test]
    #[should_panic(expected = "already tracked")]
    fn double_registration_is_an_invariant_violation() {
        let system = system(2);
        let pcb = system.process.create_process(OFFSET);
        let frame = system.frame_pool.lock().alloc().unwrap();
        system.frame_table.register(&pcb, page(0), frame);
        system.frame_table.register(&pcb, page(1), frame);
    }

    #[test]
    fn release_all_removes_only_the_target_process() {
        let system = system(4);
        let p = system.process.create_process(OFFSET);
        let q = system.process.create_process(OFFSET);

        for (owner, n) in [(&p, 0), (&q, 1), (&p, 2)] {
            let frame = system.frame_pool.lock().alloc().unwrap();
            owner.page_manager.lock().map(page(n), frame, true, true);
            system.frame_table.register(owner, page(n), frame);
            system.frame_table.unpin(frame);
        }

        system.frame_table.release_all(p.pid, &system.frame_pool);
        assert!(!system.frame_table.owns_any(p.pid));
        assert!(system.frame_table.owns_any(q.pid));
        assert_eq!(system.frame_table.occupied(), 1);
        assert_eq!(system.frame_pool.lock().frames_allocated(), 1);
        assert!(!p.page_manager.lock().is_mapped(page(0)));

        // releasing an already-released process is a no-op
        system.frame_table.release_all(p.pid, &system.frame_pool);
        assert_eq!(system.frame_table.occupied(), 1);
    }

    #[test]
    fn registered_frames_stay_pinned_until_unpinned() {
        let system = system(1);
        let pcb = system.process.create_process(OFFSET);
        let frame = system.frame_pool.lock().alloc().unwrap();
        pcb.page_manager.lock().map(page(0), frame, true, true);
        system.frame_table.register(&pcb, page(0), frame);

        // still pinned by registration: not a victim
        let _fa = pcb.frame_access.lock();
        assert_eq!(
            system
                .frame_table
                .try_evict(&pcb, &system.frame_pool, &system.swap)
                .unwrap(),
            None
        );

        system.frame_table.unpin(frame);
        assert_eq!(
            system
                .frame_table
                .try_evict(&pcb, &system.frame_pool, &system.swap)
                .unwrap(),
            Some(frame)
        );
        assert_eq!(system.frame_table.occupied(), 0);
    }
}
