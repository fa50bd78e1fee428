use crate::sizes::{KB, MB};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

// Any virtual address at or above OFFSET is a kernel address. User stacks
// grow down from here.
pub const OFFSET: usize = 0x80000000;

// "Upper memory" starts at 1MB; the user frame pool is carved out of it.
pub const UPPER_MEMORY_START: usize = MB + OFFSET;

/// How far below `OFFSET` a user stack may grow.
pub const USER_STACK_LIMIT: usize = 8 * MB;

/// How far below the stack pointer an access may land and still count as a
/// stack access (`pusha` writes 32 bytes below `esp` before moving it).
pub const STACK_SLACK: usize = 32;

#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn page_offset(addr: usize) -> usize {
    addr & (PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn is_page_aligned(addr: usize) -> bool {
    page_offset(addr) == 0
}

/// Number of pages needed to hold `len` bytes.
#[inline]
pub const fn pages_for(len: usize) -> usize {
    len.div_ceil(PAGE_FRAME_SIZE)
}

#[inline]
pub const fn is_user_vaddr(addr: usize) -> bool {
    addr < OFFSET
}
