//! User memory: physical frames, the supplemental page table, memory-mapped
//! files and the boundary that pins user pages for kernel access.

pub mod frame_allocator;
pub mod frame_table;
pub mod mmap;
pub mod spt;
pub mod user;

use crate::fs::FsError;
use kidneyos_shared::mem::PAGE_FRAME_SIZE;
use thiserror::Error;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Contents of one physical frame.
#[derive(FromZeroes, FromBytes, AsBytes)]
#[repr(transparent)]
pub struct Page(pub [u8; PAGE_FRAME_SIZE]);

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    #[error("page {0:#x} is already described")]
    AlreadyRegistered(usize),
    #[error("no page is described at {0:#x}")]
    NotMapped(usize),
    #[error("page {0:#x} is already resident")]
    AlreadyLoaded(usize),
    #[error("bad user address {0:#x}")]
    BadAddress(usize),
    #[error("mapping would overlap page {0:#x}")]
    Overlap(usize),
    #[error("file offset {0:#x} is not page aligned")]
    UnalignedOffset(u64),
    #[error("cannot map an empty file")]
    EmptyMapping,
    #[error("mapping of {length} bytes at file offset {offset:#x} runs past the end of the file")]
    BadRange { offset: u64, length: usize },
    #[error("write to read-only page {0:#x}")]
    ReadOnly(usize),
    #[error("a page cannot hold {read_bytes} file bytes")]
    BadSpan { read_bytes: usize },
    #[error("failed to install page {0:#x}")]
    InstallFailed(usize),
    #[error(transparent)]
    File(#[from] FsError),
}

pub type Result<T> = core::result::Result<T, VmError>;
