use crate::config::VmConfig;
use crate::fs::FileRef;
use crate::mem::frame_table::FrameTable;
use crate::mem::mmap::MmapTable;
use crate::mem::spt::SupplementalPageTable;
use crate::mem::{Result, VmError};
use crate::paging::PageDirectory;
use crate::swapping::SwapTable;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use kidneyos_shared::mem::{is_page_aligned, OFFSET, PAGE_FRAME_SIZE};
use log::debug;

pub type Pid = u16;
pub type AtomicPid = AtomicU16;

/// The virtual memory of one user process.
pub struct ProcessVm {
    pid: Pid,
    page_dir: Arc<dyn PageDirectory>,
    spt: Arc<SupplementalPageTable>,
    mmaps: MmapTable,
    frames: Arc<FrameTable>,
    /// User stack pointer at the last entry into the kernel.
    esp: AtomicUsize,
    stack_limit: usize,
    stack_slack: usize,
    exited: AtomicBool,
}

impl ProcessVm {
    pub fn new(
        pid: Pid,
        page_dir: Arc<dyn PageDirectory>,
        frames: Arc<FrameTable>,
        swap: Arc<SwapTable>,
        config: &VmConfig,
    ) -> Self {
        let spt = Arc::new(SupplementalPageTable::new(
            pid,
            page_dir.clone(),
            frames.clone(),
            swap,
        ));
        ProcessVm {
            pid,
            mmaps: MmapTable::new(spt.clone(), page_dir.clone()),
            page_dir,
            spt,
            frames,
            esp: AtomicUsize::new(OFFSET),
            stack_limit: config.stack_limit,
            stack_slack: config.stack_slack,
            exited: AtomicBool::new(false),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn page_dir(&self) -> &Arc<dyn PageDirectory> {
        &self.page_dir
    }

    pub fn spt(&self) -> &Arc<SupplementalPageTable> {
        &self.spt
    }

    pub fn mmaps(&self) -> &MmapTable {
        &self.mmaps
    }

    pub fn frames(&self) -> &Arc<FrameTable> {
        &self.frames
    }

    pub fn esp(&self) -> usize {
        self.esp.load(Ordering::Relaxed)
    }

    /// Records the user stack pointer, e.g. on system call entry.
    pub fn set_esp(&self, esp: usize) {
        self.esp.store(esp, Ordering::Relaxed);
    }

    pub fn stack_limit(&self) -> usize {
        self.stack_limit
    }

    pub fn stack_slack(&self) -> usize {
        self.stack_slack
    }

    /// Describes an executable segment: `read_bytes` bytes of `file` from
    /// `offset` followed by `zero_bytes` zeroes, mapped at `upage`. Pages are
    /// read in on first access.
    pub fn load_segment(
        &self,
        file: &FileRef,
        offset: u64,
        upage: usize,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<()> {
        if !is_page_aligned(upage) {
            return Err(VmError::BadAddress(upage));
        }
        if offset % PAGE_FRAME_SIZE as u64 != 0 {
            return Err(VmError::UnalignedOffset(offset));
        }
        let pages = match read_bytes.checked_add(zero_bytes) {
            Some(total) if total % PAGE_FRAME_SIZE == 0 => total / PAGE_FRAME_SIZE,
            _ => return Err(VmError::BadSpan { read_bytes }),
        };
        let mut remaining = read_bytes;
        for i in 0..pages {
            let page_read = remaining.min(PAGE_FRAME_SIZE);
            let registered = self.spt.register_file(
                upage + i * PAGE_FRAME_SIZE,
                file.clone(),
                offset + (i * PAGE_FRAME_SIZE) as u64,
                page_read,
                writable,
            );
            if let Err(err) = registered {
                for j in 0..i {
                    self.spt.remove(upage + j * PAGE_FRAME_SIZE);
                }
                return Err(err);
            }
            remaining -= page_read;
        }
        Ok(())
    }

    /// Maps a zeroed page at the top of user memory and returns the initial
    /// stack pointer.
    pub fn setup_stack(&self) -> Result<usize> {
        let upage = OFFSET - PAGE_FRAME_SIZE;
        self.spt.register_zero(upage, true)?;
        self.spt.load(upage)?;
        self.set_esp(OFFSET);
        Ok(OFFSET)
    }

    /// Releases all of the process's memory. Mappings are written back before
    /// the remaining pages are discarded. Only the first call has an effect.
    pub fn exit(&self) {
        if self.exited.swap(true, Ordering::SeqCst) {
            return;
        }
        self.mmaps.unmap_all();
        self.spt.destroy_all();
        debug!("process {}: address space torn down", self.pid);
    }
}

impl Drop for ProcessVm {
    fn drop(&mut self) {
        self.exit();
    }
}
