//! Per-process supplemental page table.
//!
//! The hardware page directory only knows about pages that currently have a
//! frame. Everything else a process has mapped lazily lives here: where the
//! page's contents are (a frame, a swap slot, or an unread file range) and
//! how to materialize them on the next fault.

use crate::fs::FileSource;
use crate::vm::swap::{SwapSlot, SwapSpace};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::fmt;
use marrowos_shared::mem::{FrameIndex, VirtPage};

/// Where a lazily loaded page's bytes come from.
#[derive(Clone)]
pub struct FileMapping {
    pub file: Arc<dyn FileSource>,
    pub offset: u64,
    /// Bytes to read from `file`; the rest of the page is zero-filled.
    pub length: usize,
}

impl fmt::Debug for FileMapping {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FileMapping")
            .field("offset", &self.offset)
            .field("length", &self.length)
            .finish()
    }
}

/// Current location of a page's contents. Being an enum, a page is in
/// exactly one of these states at any time.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PageLocation {
    /// Backed by a frame; the index is re-validated through the frame table
    /// on use, since an eviction may have moved the page since.
    Resident { frame: FrameIndex },
    /// Evicted; contents wait in a swap slot.
    InSwap { slot: SwapSlot },
    /// Contents have not been loaded (or were clean when evicted) and come
    /// from the entry's file source.
    InFile,
}

#[derive(Clone, Debug)]
pub struct PageEntry {
    pub location: PageLocation,
    /// Retained while the file copy still matches the page, so a clean
    /// eviction can drop the frame without writing swap. Cleared after a
    /// swap round trip: from then on swap is the only faithful copy.
    pub source: Option<FileMapping>,
    pub writable: bool,
    pub stack: bool,
}

impl PageEntry {
    /// A not-yet-loaded page backed by `length` bytes of `file` at `offset`.
    pub fn file_backed(
        file: Arc<dyn FileSource>,
        offset: u64,
        length: usize,
        writable: bool,
    ) -> PageEntry {
        assert!(length <= marrowos_shared::mem::PAGE_FRAME_SIZE);
        PageEntry {
            location: PageLocation::InFile,
            source: Some(FileMapping {
                file,
                offset,
                length,
            }),
            writable,
            stack: false,
        }
    }

    /// A freshly materialized stack page.
    pub fn stack_resident(frame: FrameIndex) -> PageEntry {
        PageEntry {
            location: PageLocation::Resident { frame },
            source: None,
            writable: true,
            stack: true,
        }
    }
}

#[derive(Default)]
pub struct SupplementalPageTable {
    entries: BTreeMap<VirtPage, PageEntry>,
}

impl SupplementalPageTable {
    pub fn new() -> SupplementalPageTable {
        SupplementalPageTable::default()
    }

    /// Inserts an entry for `page`, last write wins. The previous entry, if
    /// any, is returned; a caller replacing an in-swap entry is responsible
    /// for releasing its slot.
    pub fn insert(&mut self, page: VirtPage, entry: PageEntry) -> Option<PageEntry> {
        self.entries.insert(page, entry)
    }

    /// Exact-address lookup; neighboring pages are unrelated entries.
    pub fn get(&self, page: VirtPage) -> Option<&PageEntry> {
        self.entries.get(&page)
    }

    pub fn get_mut(&mut self, page: VirtPage) -> Option<&mut PageEntry> {
        self.entries.get_mut(&page)
    }

    pub fn remove(&mut self, page: VirtPage) -> Option<PageEntry> {
        self.entries.remove(&page)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every entry, releasing the swap slots of evicted pages. Called
    /// during teardown after the frame table has been swept, so no entry
    /// can still be resident-with-a-live-frame by the time this runs.
    pub fn clear(&mut self, swap: &SwapSpace) {
        for entry in self.entries.values() {
            if let PageLocation::InSwap { slot } = entry.location {
                swap.release_slot(slot);
            }
        }
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::block_core::{Block, BlockDriver, BlockType};
    use crate::drivers::ram_disk::RamDisk;
    use crate::fs::MemFile;
    use crate::vm::swap::SECTORS_PER_SLOT;

    fn file(len: usize) -> Arc<dyn FileSource> {
        Arc::new(MemFile::new(vec![0u8; len]))
    }

    #[test]
    fn insert_is_last_write_wins() {
        let mut spt = SupplementalPageTable::new();
        let page = VirtPage::new(0x8000).unwrap();

        assert!(spt
            .insert(page, PageEntry::file_backed(file(16), 0, 16, false))
            .is_none());
        let old = spt
            .insert(page, PageEntry::stack_resident(FrameIndex::new(1)))
            .unwrap();
        assert_eq!(old.location, PageLocation::InFile);
        assert_eq!(spt.len(), 1);
        assert!(spt.get(page).unwrap().stack);
    }

    #[test]
    fn lookup_is_exact_address() {
        let mut spt = SupplementalPageTable::new();
        let page = VirtPage::new(0x8000).unwrap();
        spt.insert(page, PageEntry::file_backed(file(16), 0, 16, true));

        assert!(spt.get(VirtPage::new(0x7000).unwrap()).is_none());
        assert!(spt.get(VirtPage::new(0x9000).unwrap()).is_none());
        assert!(spt.get(page).is_some());
    }

    #[test]
    fn clear_releases_swap_slots() {
        let swap = SwapSpace::new(Block::new(
            BlockType::Swap,
            "swap0",
            BlockDriver::Ram(RamDisk::new(4 * SECTORS_PER_SLOT)),
        ));
        let slot = swap.allocate_slot().unwrap();
        assert_eq!(swap.free_slots(), 3);

        let mut spt = SupplementalPageTable::new();
        let mut entry = PageEntry::stack_resident(FrameIndex::new(0));
        entry.location = PageLocation::InSwap { slot };
        spt.insert(VirtPage::new(0x8000).unwrap(), entry);

        spt.clear(&swap);
        assert!(spt.is_empty());
        assert_eq!(swap.free_slots(), 4);

        // clearing an already-empty table is a no-op
        spt.clear(&swap);
        assert_eq!(swap.free_slots(), 4);
    }
}
