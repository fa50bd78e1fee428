use crate::block::block_core::{BlockManager, BlockType};
use crate::config::VmConfig;
use crate::mem::frame_allocator::UserPool;
use crate::mem::frame_table::FrameTable;
use crate::paging::{PageDirectory, SoftPageDirectory};
use crate::swapping::SwapTable;
use crate::user_program::process::{AtomicPid, Pid, ProcessVm};
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;
use log::info;

/// State shared by every process: the user frame pool and the swap store.
pub struct VmSystem {
    config: VmConfig,
    frames: Arc<FrameTable>,
    swap: Arc<SwapTable>,
    next_pid: AtomicPid,
}

impl VmSystem {
    /// Brings up the subsystem, using the block device registered for the
    /// swap role, if any.
    pub fn new(config: VmConfig, blocks: &BlockManager) -> Self {
        info!(
            "vm: {} user frames, {:?} placement",
            config.user_frames, config.placement
        );
        let pool = UserPool::new(config.user_frames, config.placement);
        VmSystem {
            config,
            frames: Arc::new(FrameTable::new(Box::new(pool))),
            swap: Arc::new(SwapTable::new(blocks.by_role(BlockType::Swap))),
            next_pid: AtomicPid::new(1),
        }
    }

    fn allocate_pid(&self) -> Pid {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        if pid == 0 {
            panic!("PID overflow");
        }
        pid
    }

    /// A new process with a software page directory.
    pub fn create_process(&self) -> ProcessVm {
        self.create_process_with(Arc::new(SoftPageDirectory::new()))
    }

    pub fn create_process_with(&self, page_dir: Arc<dyn PageDirectory>) -> ProcessVm {
        ProcessVm::new(
            self.allocate_pid(),
            page_dir,
            self.frames.clone(),
            self.swap.clone(),
            &self.config,
        )
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn frames(&self) -> &Arc<FrameTable> {
        &self.frames
    }

    pub fn swap(&self) -> &Arc<SwapTable> {
        &self.swap
    }
}
