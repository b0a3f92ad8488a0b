// https://wiki.osdev.org/Paging

// Casting usize to u32 cannot truncate for the 32-bit address space this
// models, but clippy has no way to know that.
#![allow(clippy::cast_possible_truncation)]

use crate::mem::{FrameIndex, VirtPage, PAGE_FRAME_SIZE};
use arbitrary_int::{u10, u12, u20};
use bitbybit::bitfield;
use core::mem::size_of;

const PAGE_DIRECTORY_LEN: usize = PAGE_FRAME_SIZE / size_of::<PageDirectoryEntry>();

/// The top-level x86 paging structure: 1024 entries, each covering 4MB of
/// virtual address space through one page table.
#[repr(align(4096))]
pub struct PageDirectory(pub [PageDirectoryEntry; PAGE_DIRECTORY_LEN]);

impl Default for PageDirectory {
    fn default() -> Self {
        Self([PageDirectoryEntry::DEFAULT; PAGE_DIRECTORY_LEN])
    }
}

/// One page-directory entry. Flag bits we never set (write-through, cache
/// disable, PAT, global) are left at their reserved default of zero.
#[bitfield(u32, default = 0)]
pub struct PageDirectoryEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(7, rw)]
    page_size: bool,
    #[bits(12..=31, rw)]
    page_table_address: u20,
}

const PAGE_TABLE_LEN: usize = PAGE_FRAME_SIZE / size_of::<PageTableEntry>();

#[repr(align(4096))]
pub struct PageTable(pub [PageTableEntry; PAGE_TABLE_LEN]);

impl Default for PageTable {
    fn default() -> Self {
        Self([PageTableEntry::DEFAULT; PAGE_TABLE_LEN])
    }
}

/// One page-table entry. The accessed and dirty bits are the ones the
/// second-chance eviction scan inspects and clears.
#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(6, rw)]
    dirty: bool,
    #[bits(12..=31, rw)]
    page_frame_address: u20,
}

impl PageTableEntry {
    /// A present entry for `frame`, accessed and dirty cleared.
    pub fn mapping(frame: FrameIndex, writable: bool, user: bool) -> PageTableEntry {
        PageTableEntry::DEFAULT
            .with_present(true)
            .with_read_write(writable)
            .with_user_supervisor(user)
            .with_page_frame_address(u20::new(frame.index() as u32))
    }

    pub fn frame(self) -> FrameIndex {
        FrameIndex::new(self.page_frame_address().value() as usize)
    }
}

#[bitfield(u32)]
pub struct VirtualAddress {
    #[bits(22..=31, r)]
    page_directory_index: u10,
    #[bits(12..=21, r)]
    page_table_index: u10,
    #[bits(0..=11, r)]
    offset: u12,
}

impl VirtualAddress {
    pub fn of(page: VirtPage) -> VirtualAddress {
        VirtualAddress::new_with_raw_value(page.addr() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_round_trip() {
        let pte = PageTableEntry::mapping(FrameIndex::new(42), true, true);
        assert!(pte.present());
        assert!(pte.read_write());
        assert!(pte.user_supervisor());
        assert!(!pte.accessed());
        assert!(!pte.dirty());
        assert_eq!(pte.frame(), FrameIndex::new(42));
    }

    #[test]
    fn virtual_address_split() {
        let page = VirtPage::new(0x0840_3000).unwrap();
        let va = VirtualAddress::of(page);
        assert_eq!(u32::from(va.page_directory_index().value()), 0x0840_3000u32 >> 22);
        assert_eq!(u32::from(va.page_table_index().value()), (0x0840_3000u32 >> 12) & 0x3ff);
        assert_eq!(va.offset().value(), 0);
    }
}
