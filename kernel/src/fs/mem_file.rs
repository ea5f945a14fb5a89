use super::{FileOps, Result};
use crate::sync::Mutex;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// A file held entirely in kernel memory.
///
/// The in-tree stand-in for a real on-disk file: every handle produced by
/// [`FileOps::reopen`] shares the same contents, the way reopened handles
/// to one inode do.
#[derive(Clone, Default)]
pub struct MemFile {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contents(contents: &[u8]) -> Self {
        Self {
            data: Arc::new(Mutex::new(contents.to_vec())),
        }
    }

    /// Snapshot of the current contents.
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl FileOps for MemFile {
    fn size(&self) -> usize {
        self.data.lock().len()
    }

    fn read_at(&mut self, offset: usize, buf: &mut [u8]) -> Result<usize> {
        let data = self.data.lock();
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write_at(&mut self, offset: usize, buf: &[u8]) -> Result<usize> {
        let mut data = self.data.lock();
        let end = offset + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn reopen(&self) -> Box<dyn FileOps> {
        Box::new(self.clone())
    }
}
