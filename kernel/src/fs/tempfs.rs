use super::{File, FileRef, Result};
use crate::sync::mutex::Mutex;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

struct Inode {
    data: Mutex<Vec<u8>>,
    open_handles: AtomicUsize,
    writes: AtomicUsize,
}

/// An open handle to a fixed-size file held entirely in memory.
///
/// Every handle, including the ones produced by [`File::reopen`], shares the
/// same inode.
pub struct TempFile {
    inode: Arc<Inode>,
}

impl TempFile {
    pub fn create(contents: &[u8]) -> Arc<TempFile> {
        Arc::new(TempFile {
            inode: Arc::new(Inode {
                data: Mutex::new(contents.to_vec()),
                open_handles: AtomicUsize::new(1),
                writes: AtomicUsize::new(0),
            }),
        })
    }

    pub fn contents(&self) -> Vec<u8> {
        self.inode.data.lock().clone()
    }

    /// Number of handles to this inode that are still open.
    pub fn open_handles(&self) -> usize {
        self.inode.open_handles.load(Ordering::SeqCst)
    }

    /// Number of `write_at` calls made through any handle.
    pub fn write_count(&self) -> usize {
        self.inode.writes.load(Ordering::SeqCst)
    }
}

impl File for TempFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let data = self.inode.data.lock();
        let start = (offset as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        self.inode.writes.fetch_add(1, Ordering::SeqCst);
        let mut data = self.inode.data.lock();
        let start = (offset as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        data[start..start + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    fn length(&self) -> u64 {
        self.inode.data.lock().len() as u64
    }

    fn reopen(&self) -> Result<FileRef> {
        self.inode.open_handles.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(TempFile {
            inode: self.inode.clone(),
        }))
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        self.inode.open_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FsError;

    #[test]
    fn exact_reads_and_writes() {
        let file = TempFile::create(b"hello, world");
        let mut buf = [0u8; 5];
        file.read_exact_at(&mut buf, 7).unwrap();
        assert_eq!(&buf, b"world");

        assert_eq!(
            file.read_exact_at(&mut buf, 10),
            Err(FsError::ShortRead { wanted: 5, got: 2 })
        );

        file.write_all_at(b"HELLO", 0).unwrap();
        assert_eq!(file.contents(), b"HELLO, world");
        assert_eq!(
            file.write_all_at(b"!!!", 11),
            Err(FsError::ShortWrite { wanted: 3, wrote: 1 })
        );
        assert_eq!(file.length(), 12);
        assert_eq!(file.write_count(), 2);
    }

    #[test]
    fn reopen_shares_inode() {
        let file = TempFile::create(b"abc");
        let other = file.reopen().unwrap();
        assert_eq!(file.open_handles(), 2);

        other.write_all_at(b"x", 1).unwrap();
        assert_eq!(file.contents(), b"axc");

        drop(other);
        assert_eq!(file.open_handles(), 1);
    }
}
