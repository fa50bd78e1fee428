// https://wiki.osdev.org/Paging

// Avoids lots of warnings about casting usize to u32 which cannot result in
// truncation on a 32-bit platform, which is all we support.
#![allow(clippy::cast_possible_truncation)]

use crate::mem::{OFFSET, PAGE_FRAME_SIZE};
use arbitrary_int::{u10, u12, u20};
use bitbybit::bitfield;

#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(3, rw)]
    write_through: bool,
    #[bit(4, rw)]
    cache_disable: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(6, rw)]
    dirty: bool,
    #[bit(7, rw)]
    page_attribute_table: bool,
    #[bit(8, rw)]
    global: bool,
    #[bits(12..=31, rw)]
    page_frame_address: u20,
}

impl PageTableEntry {
    /// A present user entry pointing at the frame whose kernel virtual address
    /// is `kpage`.
    pub fn user(kpage: usize, writable: bool) -> Self {
        debug_assert!(kpage >= OFFSET, "{kpage:#x} is not a kernel address");
        Self::DEFAULT
            .with_present(true)
            .with_read_write(writable)
            .with_user_supervisor(true)
            .with_page_frame_address(u20::new(((kpage - OFFSET) / PAGE_FRAME_SIZE) as u32))
    }

    /// Kernel virtual address of the frame this entry points at.
    pub fn kpage(&self) -> usize {
        OFFSET + self.page_frame_address().value() as usize * PAGE_FRAME_SIZE
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
    pub fn new(addr: usize) -> Self {
        Self::new_with_raw_value(addr as u32)
    }

    /// Virtual page number, i.e. both table indices together.
    pub fn page_number(&self) -> usize {
        ((self.page_directory_index().value() as usize) << 10)
            | self.page_table_index().value() as usize
    }
}
