//! The file service the VM subsystem reads executables and mapped files
//! through. The file system proper lives outside this crate.

pub mod tempfs;

use alloc::sync::Arc;
use thiserror::Error;

/// An open file. Dropping the last reference closes it.
pub type FileRef = Arc<dyn File>;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// fewer bytes were available than requested
    #[error("short read: wanted {wanted} bytes, got {got}")]
    ShortRead { wanted: usize, got: usize },
    /// fewer bytes were written than requested
    #[error("short write: wanted {wanted} bytes, wrote {wrote}")]
    ShortWrite { wanted: usize, wrote: usize },
    /// the file could not be opened again
    #[error("cannot reopen file")]
    ReopenFailed,
}

pub type Result<T> = core::result::Result<T, FsError>;

pub trait File: Send + Sync {
    /// Reads up to `buf.len()` bytes starting at `offset`, returning how many
    /// were read. Reading at or past the end returns 0.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Writes up to `buf.len()` bytes starting at `offset`, returning how many
    /// were written. Files do not grow.
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize>;

    /// Length of the file in bytes.
    fn length(&self) -> u64;

    /// Opens a new, independent handle to the same file.
    fn reopen(&self) -> Result<FileRef>;

    /// Reads exactly `buf.len()` bytes; a short read is an error.
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let got = self.read_at(buf, offset)?;
        if got != buf.len() {
            return Err(FsError::ShortRead {
                wanted: buf.len(),
                got,
            });
        }
        Ok(())
    }

    /// Writes all of `buf`; a short write is an error.
    fn write_all_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        let wrote = self.write_at(buf, offset)?;
        if wrote != buf.len() {
            return Err(FsError::ShortWrite {
                wanted: buf.len(),
                wrote,
            });
        }
        Ok(())
    }
}
