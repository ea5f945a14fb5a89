//! File-backed (mmap) pages.
//!
//! A mapping owns one private handle to the underlying file, shared by
//! every page of the mapping. Each page records the segment of the file
//! it shadows; bytes past the recorded length are zero-filled on load
//! and never written back. The final page of a mapping carries a tail
//! marker so unmapping knows where to stop without a length table.

use super::page::Page;
use super::{SpaceId, VmError, VmState};
use crate::fs::FileOps;
use crate::sync::Mutex;
use alloc::boxed::Box;
use alloc::sync::Arc;
use tadpole_shared::mem::{is_page_aligned, PAGE_FRAME_SIZE};

/// The mapping's private file handle, shared by all of its pages.
pub type SharedFile = Arc<Mutex<Box<dyn FileOps>>>;

/// The slice of the file one page shadows.
#[derive(Clone)]
pub struct FileSegment {
    pub(crate) file: SharedFile,
    /// Byte offset of this page's first byte within the file.
    pub(crate) offset: usize,
    /// How many bytes come from the file; the rest of the page is zero.
    pub(crate) read_len: usize,
    pub(crate) writable: bool,
}

/// Backing state for one file-backed page.
#[derive(Clone)]
pub struct FilePage {
    pub(crate) segment: FileSegment,
    /// Set on the last page of the mapping.
    pub(crate) segment_tail: bool,
}

impl FilePage {
    pub fn segment_offset(&self) -> usize {
        self.segment.offset
    }

    pub fn read_len(&self) -> usize {
        self.segment.read_len
    }
}

/// Fill `frame` from the page's file segment, zeroing the remainder.
pub(crate) fn swap_in(fp: &FilePage, frame: &mut [u8]) -> Result<(), VmError> {
    let seg = &fp.segment;
    let mut file = seg.file.lock();
    let n = file.read_at(seg.offset, &mut frame[..seg.read_len])?;
    frame[n..].fill(0);
    Ok(())
}

/// Flush the file-covered bytes of `frame` back to the segment.
///
/// Callers only invoke this for dirty writable pages; the zero padding
/// past `read_len` is never written out.
pub(crate) fn write_back(fp: &FilePage, frame: &[u8]) -> Result<(), VmError> {
    let seg = &fp.segment;
    debug_assert!(seg.writable);
    let mut file = seg.file.lock();
    file.write_at(seg.offset, &frame[..seg.read_len])?;
    Ok(())
}

impl VmState {
    /// Map `length` bytes of `file` starting at `offset` into the space at
    /// `addr`. Descriptors are created lazily; no frame is touched until
    /// the first fault. On any collision the whole mapping is undone.
    pub(crate) fn do_mmap(
        &mut self,
        space: SpaceId,
        addr: usize,
        length: usize,
        writable: bool,
        file: &dyn FileOps,
        offset: usize,
    ) -> Result<usize, VmError> {
        if addr == 0 || !is_page_aligned(addr) || !is_page_aligned(offset) || length == 0 {
            return Err(VmError::BadAddress);
        }
        let file_size = file.size();
        if file_size == 0 {
            return Err(VmError::BadAddress);
        }
        // The mapping keeps its own handle so a later close of the
        // caller's descriptor cannot invalidate the pages.
        let shared: SharedFile = Arc::new(Mutex::new(file.reopen()));

        let page_count = length.div_ceil(PAGE_FRAME_SIZE);
        let table = self.spaces.get_mut(&space).ok_or(VmError::NoSuchSpace)?;
        for i in 0..page_count {
            let va = addr + i * PAGE_FRAME_SIZE;
            let page_offset = offset + i * PAGE_FRAME_SIZE;
            let in_mapping = (length - i * PAGE_FRAME_SIZE).min(PAGE_FRAME_SIZE);
            let in_file = file_size.saturating_sub(page_offset);
            let fp = FilePage {
                segment: FileSegment {
                    file: Arc::clone(&shared),
                    offset: page_offset,
                    read_len: in_mapping.min(in_file),
                    writable,
                },
                segment_tail: i == page_count - 1,
            };
            if table.insert(Page::new_file(va, writable, fp)).is_err() {
                // Undo the part of the mapping already inserted. None of
                // these pages can be resident yet.
                for j in 0..i {
                    table.pages.remove(&(addr + j * PAGE_FRAME_SIZE));
                }
                return Err(VmError::MmapOverlap);
            }
        }
        Ok(addr)
    }

    /// Unmap the file mapping that starts at `addr`, flushing dirty pages
    /// back to the file.
    pub(crate) fn do_munmap(&mut self, space: SpaceId, addr: usize) -> Result<(), VmError> {
        {
            let table = self.spaces.get(&space).ok_or(VmError::NoSuchSpace)?;
            match table.find(addr) {
                Some(page) if page.va() == addr && page.is_file_mapping() => {}
                _ => return Err(VmError::BadAddress),
            }
        }
        let mut va = addr;
        loop {
            let is_tail = {
                let table = self.spaces.get(&space).ok_or(VmError::NoSuchSpace)?;
                match table.find(va) {
                    Some(page) if page.is_file_mapping() => page.is_segment_tail(),
                    // A mapping always ends in a tail page; running off the
                    // end means the walk started past one mapping into
                    // unrelated territory, which the base check rules out.
                    _ => return Err(VmError::BadAddress),
                }
            };
            self.destroy_page(space, va)?;
            if is_tail {
                return Ok(());
            }
            va += PAGE_FRAME_SIZE;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mem_file::MemFile;
    use crate::fs::FileOps;

    fn file_page(file: &MemFile, offset: usize, read_len: usize, tail: bool) -> FilePage {
        FilePage {
            segment: FileSegment {
                file: Arc::new(Mutex::new(file.reopen())),
                offset,
                read_len,
                writable: true,
            },
            segment_tail: tail,
        }
    }

    #[test]
    fn load_zero_fills_past_read_len() {
        let file = MemFile::with_contents(&[0xab; 100]);
        let fp = file_page(&file, 0, 100, true);
        let mut frame = [0xff_u8; PAGE_FRAME_SIZE];
        swap_in(&fp, &mut frame).unwrap();
        assert!(frame[..100].iter().all(|&b| b == 0xab));
        assert!(frame[100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn write_back_stops_at_read_len() {
        let file = MemFile::with_contents(&[0u8; 100]);
        let fp = FilePage {
            segment: FileSegment {
                file: Arc::new(Mutex::new(Box::new(file.clone()) as Box<dyn FileOps>)),
                offset: 0,
                read_len: 100,
                writable: true,
            },
            segment_tail: true,
        };
        let frame = [0x5c_u8; PAGE_FRAME_SIZE];
        write_back(&fp, &frame).unwrap();
        let contents = file.contents();
        assert_eq!(contents.len(), 100);
        assert!(contents.iter().all(|&b| b == 0x5c));
    }

    #[test]
    fn load_at_offset_reads_the_right_slice() {
        let mut bytes = alloc::vec![0u8; 2 * PAGE_FRAME_SIZE];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = (i / PAGE_FRAME_SIZE) as u8 + 1;
        }
        let file = MemFile::with_contents(&bytes);
        let fp = file_page(&file, PAGE_FRAME_SIZE, PAGE_FRAME_SIZE, true);
        let mut frame = [0u8; PAGE_FRAME_SIZE];
        swap_in(&fp, &mut frame).unwrap();
        assert!(frame.iter().all(|&b| b == 2));
    }
}
