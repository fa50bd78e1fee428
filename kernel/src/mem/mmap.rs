//! Memory-mapped files. Each mapping is a run of pages backed by its own
//! handle to the file; dirty pages are written back when the mapping goes
//! away or the page is evicted.

use crate::fs::FileRef;
use crate::mem::spt::SupplementalPageTable;
use crate::mem::{Result, VmError};
use crate::paging::PageDirectory;
use crate::sync::mutex::Mutex;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, Ordering};
use kidneyos_shared::mem::{is_page_aligned, pages_for, OFFSET, PAGE_FRAME_SIZE};
use log::debug;

/// Identifies a mapping within one process. Valid ids are positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MapId(pub i32);

struct Mapping {
    /// Keeps the file open for as long as the mapping exists.
    _file: FileRef,
    start: usize,
    page_count: usize,
}

pub struct MmapTable {
    spt: Arc<SupplementalPageTable>,
    page_dir: Arc<dyn PageDirectory>,
    next_id: AtomicI32,
    mappings: Mutex<BTreeMap<MapId, Mapping>>,
}

impl MmapTable {
    pub fn new(spt: Arc<SupplementalPageTable>, page_dir: Arc<dyn PageDirectory>) -> Self {
        MmapTable {
            spt,
            page_dir,
            next_id: AtomicI32::new(1),
            mappings: Mutex::new(BTreeMap::new()),
        }
    }

    /// Maps `length` bytes of `file`, starting at `offset`, at `addr`. The
    /// range must lie within the file. Nothing is read until the pages are
    /// touched.
    pub fn map(&self, addr: usize, file: &FileRef, offset: u64, length: usize) -> Result<MapId> {
        if addr == 0 || !is_page_aligned(addr) {
            return Err(VmError::BadAddress(addr));
        }
        if offset % PAGE_FRAME_SIZE as u64 != 0 {
            return Err(VmError::UnalignedOffset(offset));
        }
        if length == 0 || file.length() == 0 {
            return Err(VmError::EmptyMapping);
        }
        match offset.checked_add(length as u64) {
            Some(end) if end <= file.length() => {}
            _ => return Err(VmError::BadRange { offset, length }),
        }
        let page_count = pages_for(length);
        match addr.checked_add(page_count * PAGE_FRAME_SIZE) {
            Some(end) if end <= OFFSET => {}
            _ => return Err(VmError::BadAddress(addr)),
        }

        let upages = (0..page_count).map(|i| addr + i * PAGE_FRAME_SIZE);
        if let Some(upage) = upages
            .clone()
            .find(|&upage| self.page_dir.query(upage).is_some() || self.spt.contains(upage))
        {
            return Err(VmError::Overlap(upage));
        }

        let file = file.reopen()?;
        let id = MapId(self.next_id.fetch_add(1, Ordering::Relaxed));
        for (i, upage) in upages.clone().enumerate() {
            let read_bytes = (length - i * PAGE_FRAME_SIZE).min(PAGE_FRAME_SIZE);
            let registered = self.spt.register_mapped(
                upage,
                file.clone(),
                offset + (i * PAGE_FRAME_SIZE) as u64,
                read_bytes,
                id,
            );
            if let Err(err) = registered {
                for upage in upages.take(i) {
                    self.spt.remove(upage);
                }
                return Err(err);
            }
        }

        debug!(
            "process {}: mapping {} at {addr:#x}, {page_count} pages",
            self.spt.pid(),
            id.0
        );
        self.mappings.lock().insert(
            id,
            Mapping {
                _file: file,
                start: addr,
                page_count,
            },
        );
        Ok(id)
    }

    /// Removes a mapping, writing dirty pages back to the file. Unknown ids
    /// are ignored.
    pub fn unmap(&self, id: MapId) {
        let Some(mapping) = self.mappings.lock().remove(&id) else {
            return;
        };
        for i in 0..mapping.page_count {
            self.spt.remove(mapping.start + i * PAGE_FRAME_SIZE);
        }
        debug!("process {}: unmapped {}", self.spt.pid(), id.0);
    }

    pub fn unmap_all(&self) {
        let ids: Vec<MapId> = self.mappings.lock().keys().copied().collect();
        for id in ids {
            self.unmap(id);
        }
    }

    /// Start address and page count of a live mapping.
    pub fn mapping(&self, id: MapId) -> Option<(usize, usize)> {
        self.mappings
            .lock()
            .get(&id)
            .map(|mapping| (mapping.start, mapping.page_count))
    }

    pub fn len(&self) -> usize {
        self.mappings.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.lock().is_empty()
    }
}
