//! Demand-paged virtual memory for KidneyOS user processes.
//!
//! A single [`system::VmSystem`] owns the global frame table and swap store;
//! each process gets a [`user_program::process::ProcessVm`] holding its page
//! directory, supplemental page table and memory mappings.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod block;
pub mod config;
pub mod drivers;
pub mod fs;
pub mod mem;
pub mod paging;
pub mod swapping;
pub mod sync;
pub mod system;
pub mod user_program;

pub use config::VmConfig;
pub use mem::VmError;
pub use system::VmSystem;
