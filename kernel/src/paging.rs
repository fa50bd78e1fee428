//! Per-process user page tables.
//!
//! The VM core only ever talks to a page directory through [`PageDirectory`],
//! so it can run against the hardware tables or, as here, against
//! [`SoftPageDirectory`], which keeps the same x86 entries in a map and lets
//! callers simulate the accessed and dirty bits the MMU would set.

use crate::sync::mutex::Mutex;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use kidneyos_shared::mem::{is_page_aligned, is_user_vaddr};
use kidneyos_shared::paging::{PageTableEntry, VirtualAddress};

pub trait PageDirectory: Send + Sync {
    /// Maps `upage` to the frame at `kpage`. Fails if `upage` is not a
    /// page-aligned user address or is already mapped.
    fn install(&self, upage: usize, kpage: usize, writable: bool) -> bool;

    /// Kernel address of the frame `upage` is mapped to, if any.
    fn query(&self, upage: usize) -> Option<usize>;

    /// Removes the mapping for `upage`. Does nothing if it is not mapped.
    fn clear(&self, upage: usize);

    fn is_accessed(&self, upage: usize) -> bool;
    fn set_accessed(&self, upage: usize, accessed: bool);
    fn is_dirty(&self, upage: usize) -> bool;
    fn set_dirty(&self, upage: usize, dirty: bool);

    /// Simulates a user access through the page table: on success marks the
    /// page accessed (and dirty for writes) and returns its frame. Returns
    /// [`None`] where the CPU would fault.
    fn access(&self, upage: usize, write: bool) -> Option<usize>;
}

#[derive(Default)]
pub struct SoftPageDirectory {
    entries: Mutex<BTreeMap<usize, PageTableEntry>>,
}

impl SoftPageDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// User pages currently mapped, in ascending order.
    pub fn mapped_pages(&self) -> Vec<usize> {
        self.entries
            .lock()
            .keys()
            .map(|vpn| vpn << 12)
            .collect()
    }

    fn update(&self, upage: usize, f: impl FnOnce(PageTableEntry) -> PageTableEntry) {
        let Some(vpn) = vpn(upage) else { return };
        if let Some(pte) = self.entries.lock().get_mut(&vpn) {
            *pte = f(*pte);
        }
    }

    fn get(&self, upage: usize) -> Option<PageTableEntry> {
        self.entries.lock().get(&vpn(upage)?).copied()
    }
}

/// Virtual page number of a user address. Kernel addresses have no entries
/// here.
fn vpn(upage: usize) -> Option<usize> {
    is_user_vaddr(upage).then(|| VirtualAddress::new(upage).page_number())
}

impl PageDirectory for SoftPageDirectory {
    fn install(&self, upage: usize, kpage: usize, writable: bool) -> bool {
        let Some(vpn) = vpn(upage).filter(|_| is_page_aligned(upage)) else {
            return false;
        };
        let mut entries = self.entries.lock();
        if entries.contains_key(&vpn) {
            return false;
        }
        entries.insert(vpn, PageTableEntry::user(kpage, writable));
        true
    }

    fn query(&self, upage: usize) -> Option<usize> {
        self.get(upage).map(|pte| pte.kpage())
    }

    fn clear(&self, upage: usize) {
        if let Some(vpn) = vpn(upage) {
            self.entries.lock().remove(&vpn);
        }
    }

    fn is_accessed(&self, upage: usize) -> bool {
        self.get(upage).is_some_and(|pte| pte.accessed())
    }

    fn set_accessed(&self, upage: usize, accessed: bool) {
        self.update(upage, |pte| pte.with_accessed(accessed));
    }

    fn is_dirty(&self, upage: usize) -> bool {
        self.get(upage).is_some_and(|pte| pte.dirty())
    }

    fn set_dirty(&self, upage: usize, dirty: bool) {
        self.update(upage, |pte| pte.with_dirty(dirty));
    }

    fn access(&self, upage: usize, write: bool) -> Option<usize> {
        let mut entries = self.entries.lock();
        let pte = entries.get_mut(&vpn(upage)?)?;
        if write && !pte.read_write() {
            return None;
        }
        *pte = pte.with_accessed(true).with_dirty(pte.dirty() || write);
        Some(pte.kpage())
    }
}
