//! Tunables for bringing up the VM subsystem.

use kidneyos_shared::mem::{STACK_SLACK, USER_STACK_LIMIT};

/// Policy used to pick a free physical frame from the core map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placement {
    #[default]
    NextFit,
    FirstFit,
    BestFit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Number of physical frames in the user pool.
    pub user_frames: usize,
    pub placement: Placement,
    /// Largest size the user stack may grow to, in bytes.
    pub stack_limit: usize,
    /// How far below the stack pointer a fault still counts as stack growth.
    /// Covers `pusha`, which touches 32 bytes below `esp` before moving it.
    pub stack_slack: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            user_frames: 256,
            placement: Placement::default(),
            stack_limit: USER_STACK_LIMIT,
            stack_slack: STACK_SLACK,
        }
    }
}

impl VmConfig {
    pub fn with_user_frames(mut self, user_frames: usize) -> Self {
        self.user_frames = user_frames;
        self
    }

    pub fn with_placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }

    pub fn with_stack_limit(mut self, stack_limit: usize) -> Self {
        self.stack_limit = stack_limit;
        self
    }

    pub fn with_stack_slack(mut self, stack_slack: usize) -> Self {
        self.stack_slack = stack_slack;
        self
    }
}
