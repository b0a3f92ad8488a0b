use alloc::boxed::Box;
use alloc::vec::Vec;
use bitbybit::bitfield;
use core::cell::UnsafeCell;
use marrowos_shared::mem::{FrameIndex, PAGE_FRAME_SIZE};

/// Per-frame bookkeeping byte in the pool's core map.
#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
}

/// The backing memory of the user frame pool.
///
/// Frame contents are read and written through raw pointers while the pool
/// lock is *not* held (filling a freshly allocated frame, persisting an
/// eviction victim). The `UnsafeCell` arena makes that explicit; the frame
/// table's pinning and frame-access locking are what keep two writers off
/// the same frame.
struct FrameArena {
    cells: Box<[UnsafeCell<u8>]>,
}

// SAFETY: concurrent access to a frame's bytes is serialized by the VM
// locking protocol, not by the pool lock.
unsafe impl Sync for FrameArena {}
unsafe impl Send for FrameArena {}

/// A fixed-capacity pool of physical page frames for user pages.
///
/// Frames are identified by index; the index doubles as the position of the
/// frame's entry in the frame table and determines its kernel alias address.
pub struct FramePool {
    arena: FrameArena,
    core_map: Box<[CoreMapEntry]>,
    /// Next-fit cursor: the frame number at which the next scan starts.
    position: usize,
    frames_allocated: usize,
}

impl FramePool {
    pub fn new(frame_count: usize) -> FramePool {
        let cells = (0..frame_count * PAGE_FRAME_SIZE)
            .map(|_| UnsafeCell::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        FramePool {
            arena: FrameArena { cells },
            core_map: alloc::vec![CoreMapEntry::DEFAULT; frame_count].into_boxed_slice(),
            position: 0,
            frames_allocated: 0,
        }
    }

    pub fn frame_count(&self) -> usize {
        self.core_map.len()
    }

    pub fn frames_allocated(&self) -> usize {
        self.frames_allocated
    }

    /// Claims a free frame, scanning next-fit from the cursor, or returns
    /// `None` if every frame is in use (the caller then evicts).
    pub fn alloc(&mut self) -> Option<FrameIndex> {
        let total = self.core_map.len();
        for step in 0..total {
            let at = (self.position + step) % total;
            if !self.core_map[at].allocated() {
                self.core_map[at] = self.core_map[at].with_allocated(true);
                self.position = (at + 1) % total;
                self.frames_allocated += 1;
                return Some(FrameIndex::new(at));
            }
        }
        None
    }

    /// Returns `frame` to the pool.
    pub fn dealloc(&mut self, frame: FrameIndex) {
        let at = frame.index();
        assert!(self.core_map[at].allocated(), "double free of frame {at}");
        self.core_map[at] = self.core_map[at].with_allocated(false);
        self.frames_allocated -= 1;
    }

    /// Raw pointer to the first byte of `frame`'s contents.
    ///
    /// The pointer stays valid for the pool's lifetime; see [`FrameArena`]
    /// for what governs access through it.
    pub fn frame_ptr(&self, frame: FrameIndex) -> *mut u8 {
        self.arena.cells[frame.index() * PAGE_FRAME_SIZE].get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_until_exhausted() {
        let mut pool = FramePool::new(3);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        let c = pool.alloc().unwrap();
        assert_eq!(pool.frames_allocated(), 3);
        assert!(pool.alloc().is_none());

        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
    }

    #[test]
    fn dealloc_makes_frame_reusable() {
        let mut pool = FramePool::new(2);
        let a = pool.alloc().unwrap();
        let _b = pool.alloc().unwrap();
        pool.dealloc(a);
        assert_eq!(pool.alloc(), Some(a));
    }

    #[test]
    fn next_fit_resumes_after_last_allocation() {
        let mut pool = FramePool::new(4);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        pool.dealloc(a);
        // the cursor sits after `b`, so the next allocation does not reuse
        // `a` while untouched frames remain
        let c = pool.alloc().unwrap();
        assert_ne!(c, a);
        assert_ne!(c, b);
    }

    #[test]
    fn frame_contents_are_distinct() {
        let mut pool = FramePool::new(2);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        unsafe {
            core::ptr::write_bytes(pool.frame_ptr(a), 0x11, PAGE_FRAME_SIZE);
            core::ptr::write_bytes(pool.frame_ptr(b), 0x22, PAGE_FRAME_SIZE);
            assert_eq!(*pool.frame_ptr(a), 0x11);
            assert_eq!(*pool.frame_ptr(b), 0x22);
        }
    }
}
