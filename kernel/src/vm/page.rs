//! Page descriptors and the per-process address space table.
//!
//! Every mapped virtual page is described by exactly one [`Page`] owned
//! by its process's [`AddressSpace`]. The backing variant records where
//! the contents live when the page is not resident; it is decided lazily,
//! on first fault, and never changes afterwards.

use super::anon::AnonPage;
use super::file::FilePage;
use super::frame::FrameId;
use super::mmu::Mmu;
use super::VmError;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use tadpole_shared::mem::{is_page_aligned, page_round_down, PAGE_FRAME_SIZE};

/// What will back an uninitialized page once it is first touched.
pub enum UninitTarget {
    Anon,
    File(FilePage),
}

/// A page that has been promised but never touched.
pub struct UninitPage {
    pub(crate) target: UninitTarget,
}

/// Where a page's contents live while it is not resident.
pub enum PageBacking {
    Uninit(UninitPage),
    Anon(AnonPage),
    File(FilePage),
}

/// Descriptor for one mapped virtual page.
pub struct Page {
    va: usize,
    writable: bool,
    pub(crate) backing: PageBacking,
    /// Back-reference to the frame holding the contents; `None` iff the
    /// page is not resident. Mirrors the frame's `PageRef` and is always
    /// updated together with it.
    pub(crate) frame: Option<FrameId>,
}

impl Page {
    /// A deferred anonymous page (stack growth, heap, fork copies).
    pub fn new_anon(va: usize, writable: bool) -> Self {
        debug_assert!(is_page_aligned(va));
        Self {
            va,
            writable,
            backing: PageBacking::Uninit(UninitPage {
                target: UninitTarget::Anon,
            }),
            frame: None,
        }
    }

    /// A deferred file-backed page; `file_page` carries the segment to
    /// load from on first touch.
    pub fn new_file(va: usize, writable: bool, file_page: FilePage) -> Self {
        debug_assert!(is_page_aligned(va));
        Self {
            va,
            writable,
            backing: PageBacking::Uninit(UninitPage {
                target: UninitTarget::File(file_page),
            }),
            frame: None,
        }
    }

    pub fn va(&self) -> usize {
        self.va
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    /// Whether this page belongs to a file mapping (loaded or not).
    pub fn is_file_mapping(&self) -> bool {
        matches!(
            self.backing,
            PageBacking::File(_)
                | PageBacking::Uninit(UninitPage {
                    target: UninitTarget::File(_),
                })
        )
    }

    /// Whether this page is the final page of its file mapping.
    pub fn is_segment_tail(&self) -> bool {
        match &self.backing {
            PageBacking::File(fp) => fp.segment_tail,
            PageBacking::Uninit(UninitPage {
                target: UninitTarget::File(fp),
            }) => fp.segment_tail,
            _ => false,
        }
    }

    /// One-shot transition from `Uninit` to the concrete backing. Calling
    /// this on an already initialized page is a no-op.
    pub(crate) fn initialize(&mut self) {
        if let PageBacking::Uninit(_) = self.backing {
            let previous = core::mem::replace(
                &mut self.backing,
                PageBacking::Anon(AnonPage::new()),
            );
            let PageBacking::Uninit(uninit) = previous else {
                unreachable!();
            };
            self.backing = match uninit.target {
                UninitTarget::Anon => PageBacking::Anon(AnonPage::new()),
                UninitTarget::File(fp) => PageBacking::File(fp),
            };
        }
    }

    /// A descriptor for the same address in a forked address space.
    ///
    /// Returns the new page and whether the caller must claim it and copy
    /// the parent's frame bytes over it (true for everything that has been
    /// initialized; untouched pages keep their deferred initializer).
    pub(crate) fn clone_for_copy(&self) -> (Page, bool) {
        match &self.backing {
            PageBacking::Uninit(uninit) => {
                let target = match &uninit.target {
                    UninitTarget::Anon => UninitTarget::Anon,
                    UninitTarget::File(fp) => UninitTarget::File(fp.clone()),
                };
                (
                    Page {
                        va: self.va,
                        writable: self.writable,
                        backing: PageBacking::Uninit(UninitPage { target }),
                        frame: None,
                    },
                    false,
                )
            }
            PageBacking::Anon(_) => (
                Page {
                    va: self.va,
                    writable: self.writable,
                    backing: PageBacking::Anon(AnonPage::new()),
                    frame: None,
                },
                true,
            ),
            PageBacking::File(fp) => (
                Page {
                    va: self.va,
                    writable: self.writable,
                    backing: PageBacking::File(fp.clone()),
                    frame: None,
                },
                true,
            ),
        }
    }
}

/// Per-process table of page descriptors, plus the process's translation
/// context and stack geometry.
pub struct AddressSpace {
    pub(crate) pages: BTreeMap<usize, Page>,
    pub(crate) mmu: Box<dyn Mmu>,
    stack_top: usize,
    max_stack_pages: usize,
}

impl AddressSpace {
    pub fn new(mmu: Box<dyn Mmu>, stack_top: usize, max_stack_pages: usize) -> Self {
        debug_assert!(is_page_aligned(stack_top));
        Self {
            pages: BTreeMap::new(),
            mmu,
            stack_top,
            max_stack_pages,
        }
    }

    pub fn stack_top(&self) -> usize {
        self.stack_top
    }

    /// Lowest address the stack may ever grow down to.
    pub fn stack_floor(&self) -> usize {
        self.stack_top - self.max_stack_pages * PAGE_FRAME_SIZE
    }

    pub fn max_stack_pages(&self) -> usize {
        self.max_stack_pages
    }

    /// Find the descriptor covering `addr` (rounded down to its page).
    pub fn find(&self, addr: usize) -> Option<&Page> {
        self.pages.get(&page_round_down(addr))
    }

    /// Insert a descriptor, failing without side effects if its address
    /// is already occupied.
    pub fn insert(&mut self, page: Page) -> Result<(), VmError> {
        let va = page.va();
        if self.pages.contains_key(&va) {
            return Err(VmError::DuplicateMapping);
        }
        self.pages.insert(va, page);
        Ok(())
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::mmu::SoftMmu;

    fn space() -> AddressSpace {
        AddressSpace::new(Box::new(SoftMmu::new()), 0x8000_0000, 16)
    }

    #[test]
    fn insert_then_find() {
        let mut space = space();
        space.insert(Page::new_anon(0x1000, true)).unwrap();
        let found = space.find(0x1000).unwrap();
        assert_eq!(found.va(), 0x1000);
        assert!(found.writable());
        // Unaligned addresses are rounded down before lookup.
        assert!(space.find(0x1fff).is_some());
        assert!(space.find(0x2000).is_none());
    }

    #[test]
    fn duplicate_insert_leaves_original() {
        let mut space = space();
        space.insert(Page::new_anon(0x1000, true)).unwrap();
        let err = space.insert(Page::new_anon(0x1000, false));
        assert_eq!(err.unwrap_err(), VmError::DuplicateMapping);
        assert!(space.find(0x1000).unwrap().writable());
    }

    #[test]
    fn initialize_is_one_shot() {
        let mut page = Page::new_anon(0x1000, true);
        assert!(matches!(page.backing, PageBacking::Uninit(_)));
        page.initialize();
        assert!(matches!(page.backing, PageBacking::Anon(_)));
        // A second call must not reset the backing.
        page.initialize();
        assert!(matches!(page.backing, PageBacking::Anon(_)));
    }

    #[test]
    fn stack_geometry() {
        let space = space();
        assert_eq!(space.stack_floor(), 0x8000_0000 - 16 * PAGE_FRAME_SIZE);
    }
}
