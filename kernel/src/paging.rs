//! Per-process page directory, modeled in software.
//!
//! The structure mirrors x86 two-level paging: a directory of 1024 entries,
//! each covering one 1024-entry page table. Translations map a [`VirtPage`]
//! to a [`FrameIndex`] in the user pool. The accessed and dirty bits live in
//! the page-table entries exactly where the MMU would maintain them; the
//! helpers that move data through a mapping set them the way hardware would.

use alloc::{boxed::Box, collections::BTreeMap};
use marrowos_shared::mem::{FrameIndex, VirtPage};
use marrowos_shared::paging::{PageDirectory, PageTable, PageTableEntry, VirtualAddress};

pub struct PageManager {
    directory: Box<PageDirectory>,
    tables: BTreeMap<usize, Box<PageTable>>,
}

impl Default for PageManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PageManager {
    pub fn new() -> PageManager {
        PageManager {
            directory: Box::default(),
            tables: BTreeMap::new(),
        }
    }

    fn indices(page: VirtPage) -> (usize, usize) {
        let va = VirtualAddress::of(page);
        (
            va.page_directory_index().value() as usize,
            va.page_table_index().value() as usize,
        )
    }

    fn entry(&self, page: VirtPage) -> Option<PageTableEntry> {
        let (dir, at) = Self::indices(page);
        let table = self.tables.get(&dir)?;
        let entry = table.0[at];
        entry.present().then_some(entry)
    }

    fn update_entry(&mut self, page: VirtPage, f: impl FnOnce(PageTableEntry) -> PageTableEntry) {
        let (dir, at) = Self::indices(page);
        if let Some(table) = self.tables.get_mut(&dir) {
            if table.0[at].present() {
                table.0[at] = f(table.0[at]);
            }
        }
    }

    /// Installs a translation from `page` to `frame`, creating the covering
    /// page table on demand. The new entry starts with accessed and dirty
    /// clear. Replaces any previous translation for `page`.
    pub fn map(&mut self, page: VirtPage, frame: FrameIndex, writable: bool, user: bool) {
        let (dir, at) = Self::indices(page);
        if !self.tables.contains_key(&dir) {
            // Directory entries are permissive; per-page protection lives in
            // the page-table entries.
            self.directory.0[dir] = self.directory.0[dir]
                .with_present(true)
                .with_read_write(true)
                .with_user_supervisor(true);
            self.tables.insert(dir, Box::default());
        }
        if let Some(table) = self.tables.get_mut(&dir) {
            table.0[at] = PageTableEntry::mapping(frame, writable, user);
        }
    }

    /// Removes the translation for `page`, if any.
    pub fn unmap(&mut self, page: VirtPage) {
        let (dir, at) = Self::indices(page);
        if let Some(table) = self.tables.get_mut(&dir) {
            table.0[at] = PageTableEntry::DEFAULT;
        }
    }

    pub fn is_mapped(&self, page: VirtPage) -> bool {
        self.entry(page).is_some()
    }

    /// The frame currently backing `page`, if a translation is installed.
    pub fn mapped_frame(&self, page: VirtPage) -> Option<FrameIndex> {
        self.entry(page).map(PageTableEntry::frame)
    }

    pub fn is_writable(&self, page: VirtPage) -> bool {
        self.entry(page).is_some_and(|e| e.read_write())
    }

    pub fn is_accessed(&self, page: VirtPage) -> bool {
        self.entry(page).is_some_and(|e| e.accessed())
    }

    /// Sets or clears the accessed bit; a no-op for unmapped pages.
    pub fn set_accessed(&mut self, page: VirtPage, accessed: bool) {
        self.update_entry(page, |e| e.with_accessed(accessed));
    }

    pub fn is_dirty(&self, page: VirtPage) -> bool {
        self.entry(page).is_some_and(|e| e.dirty())
    }

    /// Sets or clears the dirty bit; a no-op for unmapped pages.
    pub fn set_dirty(&mut self, page: VirtPage, dirty: bool) {
        self.update_entry(page, |e| e.with_dirty(dirty));
    }
}
