//! The open-file seam the memory-mapping layer sits on.
//!
//! The real file system lives elsewhere in the kernel; the VM core only
//! needs positioned reads and writes plus the ability to reopen a file as
//! an independent private handle, so that is all this trait asks for.

pub mod mem_file;

pub use mem_file::MemFile;

use alloc::boxed::Box;
use core::error::Error;
use core::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// Underlying device or filesystem failure
    Io,
    /// Offset past the end of the file for an operation that cannot extend it
    OutOfRange,
}

impl Display for FsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            FsError::Io => write!(f, "I/O error"),
            FsError::OutOfRange => write!(f, "offset out of range"),
        }
    }
}

impl Error for FsError {}

pub type Result<T> = core::result::Result<T, FsError>;

/// An open file, as seen by the memory-mapping layer.
pub trait FileOps: Send {
    /// Current size of the file in bytes.
    fn size(&self) -> usize;

    /// Read up to `buf.len()` bytes at `offset` into `buf`.
    ///
    /// Reads past the end of the file return fewer bytes than requested
    /// (possibly zero); they are not an error.
    fn read_at(&mut self, offset: usize, buf: &mut [u8]) -> Result<usize>;

    /// Write `buf` at `offset`, extending the file if necessary.
    fn write_at(&mut self, offset: usize, buf: &[u8]) -> Result<usize>;

    /// Open an independent handle to the same underlying file.
    ///
    /// The clone shares content with `self` but no position state, so a
    /// mapping can outlive the handle it was created from.
    fn reopen(&self) -> Box<dyn FileOps>;
}
