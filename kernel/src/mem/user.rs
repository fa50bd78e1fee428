//! The boundary between user memory and the kernel: page faults, and the
//! pinning that keeps user buffers resident while the kernel copies them.

use crate::mem::{Result, VmError};
use crate::user_program::process::ProcessVm;
use alloc::vec::Vec;
use core::hint::spin_loop;
use kidneyos_shared::mem::{is_user_vaddr, page_offset, page_round_down, OFFSET, PAGE_FRAME_SIZE};

/// Resolves a fault at `addr` taken with stack pointer `esp`.
///
/// Described pages are loaded. An undescribed page is treated as stack growth
/// if it lies within the stack limit and not too far below `esp`, and gets a
/// fresh zero page. Any error means the faulting process has to be killed.
pub fn handle_page_fault(vm: &ProcessVm, addr: usize, esp: usize, write: bool) -> Result<()> {
    if addr == 0 || !is_user_vaddr(addr) {
        return Err(VmError::BadAddress(addr));
    }
    let upage = page_round_down(addr);

    match vm.spt().lookup(upage) {
        Some(info) if write && !info.writable => return Err(VmError::ReadOnly(upage)),
        Some(_) => {}
        None if is_stack_access(vm, addr, esp) => match vm.spt().register_zero(upage, true) {
            // Another thread grew the stack first.
            Ok(()) | Err(VmError::AlreadyRegistered(_)) => {}
            Err(err) => return Err(err),
        },
        None => return Err(VmError::NotMapped(upage)),
    }

    match vm.spt().load(upage) {
        Ok(()) | Err(VmError::AlreadyLoaded(_)) => Ok(()),
        Err(err) => Err(err),
    }
}

fn is_stack_access(vm: &ProcessVm, addr: usize, esp: usize) -> bool {
    addr >= OFFSET - vm.stack_limit() && addr.saturating_add(vm.stack_slack()) >= esp
}

/// A user buffer whose pages are resident and pinned. Dropping it unpins
/// them.
pub struct PinnedBuffer<'a> {
    vm: &'a ProcessVm,
    addr: usize,
    len: usize,
    /// `(upage, kpage)` for every page the buffer spans.
    pages: Vec<(usize, usize)>,
}

/// Faults in and pins every page of `[addr, addr + len)`. Pages are grown on
/// the stack the way a fault at the process's current `esp` would.
pub fn pin_buffer(vm: &ProcessVm, addr: usize, len: usize, write: bool) -> Result<PinnedBuffer<'_>> {
    let mut pinned = PinnedBuffer {
        vm,
        addr,
        len,
        pages: Vec::new(),
    };
    if len == 0 {
        return Ok(pinned);
    }
    match addr.checked_add(len) {
        Some(end) if addr != 0 && end <= OFFSET => {}
        _ => return Err(VmError::BadAddress(addr)),
    }

    let first = page_round_down(addr);
    let last = page_round_down(addr + len - 1);
    for upage in (first..=last).step_by(PAGE_FRAME_SIZE) {
        loop {
            match vm.page_dir().query(upage) {
                Some(kpage) => {
                    if write && vm.spt().lookup(upage).is_some_and(|info| !info.writable) {
                        return Err(VmError::ReadOnly(upage));
                    }
                    if vm.frames().pin_owned(kpage, vm.pid(), upage) {
                        pinned.pages.push((upage, kpage));
                        break;
                    }
                    // Evicted between the lookup and the pin.
                    spin_loop();
                }
                None => handle_page_fault(vm, upage.max(addr), vm.esp(), write)?,
            }
        }
    }
    Ok(pinned)
}

impl PinnedBuffer<'_> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Splits the buffer into per-frame pieces: `(upage, kpage, offset in
    /// page, offset in buffer, length)`.
    fn chunks(&self) -> impl Iterator<Item = (usize, usize, usize, usize, usize)> + '_ {
        let end = self.addr + self.len;
        self.pages.iter().map(move |&(upage, kpage)| {
            let from = upage.max(self.addr);
            let to = (upage + PAGE_FRAME_SIZE).min(end);
            (upage, kpage, page_offset(from), from - self.addr, to - from)
        })
    }

    /// Copies the whole buffer out of user memory.
    pub fn read(&self, buf: &mut [u8]) {
        assert_eq!(buf.len(), self.len, "buffer size mismatch");
        for (upage, kpage, in_page, in_buf, n) in self.chunks() {
            self.vm.page_dir().access(upage, false);
            let page = self.vm.frames().page(kpage);
            buf[in_buf..in_buf + n].copy_from_slice(&page.0[in_page..in_page + n]);
        }
    }

    /// Copies `data` over the whole buffer. The buffer must have been pinned
    /// for writing.
    pub fn write(&self, data: &[u8]) {
        assert_eq!(data.len(), self.len, "buffer size mismatch");
        for (upage, kpage, in_page, in_buf, n) in self.chunks() {
            self.vm.page_dir().access(upage, true);
            let mut page = self.vm.frames().page(kpage);
            page.0[in_page..in_page + n].copy_from_slice(&data[in_buf..in_buf + n]);
        }
    }
}

impl Drop for PinnedBuffer<'_> {
    fn drop(&mut self) {
        for &(_, kpage) in &self.pages {
            self.vm.frames().unpin(kpage);
        }
    }
}

/// Copies `buf.len()` bytes of user memory at `addr` into `buf`.
pub fn copy_from_user(vm: &ProcessVm, addr: usize, buf: &mut [u8]) -> Result<()> {
    pin_buffer(vm, addr, buf.len(), false)?.read(buf);
    Ok(())
}

/// Copies `data` into user memory at `addr`.
pub fn copy_to_user(vm: &ProcessVm, addr: usize, data: &[u8]) -> Result<()> {
    pin_buffer(vm, addr, data.len(), true)?.write(data);
    Ok(())
}

/// Performs a one-byte user access the way the CPU would: walk the page
/// table and, on a miss, take a page fault and retry.
fn access_byte<T>(
    vm: &ProcessVm,
    addr: usize,
    write: bool,
    mut f: impl FnMut(&mut u8) -> T,
) -> Result<T> {
    let upage = page_round_down(addr);
    loop {
        if let Some(kpage) = vm.page_dir().query(upage) {
            if vm.frames().pin_owned(kpage, vm.pid(), upage) {
                let value = (vm.page_dir().access(upage, write) == Some(kpage))
                    .then(|| f(&mut vm.frames().page(kpage).0[page_offset(addr)]));
                vm.frames().unpin(kpage);
                if let Some(value) = value {
                    return Ok(value);
                }
            } else {
                spin_loop();
                continue;
            }
        }
        handle_page_fault(vm, addr, vm.esp(), write)?;
    }
}

/// Loads the byte at `addr` as the process would.
pub fn user_read(vm: &ProcessVm, addr: usize) -> Result<u8> {
    access_byte(vm, addr, false, |byte| *byte)
}

/// Stores `value` at `addr` as the process would.
pub fn user_write(vm: &ProcessVm, addr: usize, value: u8) -> Result<()> {
    access_byte(vm, addr, true, |byte| *byte = value)
}
