//! Seam between the VM core and the hardware address-translation tables.
//!
//! The paging structures themselves (and the instructions that load them)
//! live in the arch layer; the VM core only installs, clears, and queries
//! translations through this trait. [`SoftMmu`] is a software rendition
//! used on the host and wherever a process has no live hardware context.

use alloc::collections::BTreeMap;
use bitbybit::bitfield;
use tadpole_shared::mem::is_page_aligned;

/// Per-process translation control, one implementor per address space.
pub trait Mmu: Send {
    /// Map `va` to the physical page at `phys_base`, replacing any previous
    /// mapping. Returns `false` if the translation structures could not be
    /// grown to hold the entry.
    fn install(&mut self, va: usize, phys_base: usize, writable: bool) -> bool;

    /// Remove the mapping for `va`, if any. Later accesses will fault.
    fn clear(&mut self, va: usize);

    /// Whether the page at `va` has been written through this mapping.
    fn is_dirty(&self, va: usize) -> bool;

    /// Set or reset the dirty bit for `va`. Resetting is used after a
    /// write-back so the page is not flushed twice.
    fn set_dirty(&mut self, va: usize, dirty: bool);
}

#[bitfield(u8, default = 0)]
struct PteFlags {
    #[bit(0, rw)]
    writable: bool,
    #[bit(1, rw)]
    dirty: bool,
}

struct SoftPte {
    phys_base: usize,
    flags: PteFlags,
}

/// A software page table: a map from page-aligned virtual address to
/// physical base plus the writable/dirty bits a real table would keep.
#[derive(Default)]
pub struct SoftMmu {
    entries: BTreeMap<usize, SoftPte>,
}

impl SoftMmu {
    pub fn new() -> Self {
        Self::default()
    }

    /// The physical base currently mapped at `va`, if any.
    pub fn phys_of(&self, va: usize) -> Option<usize> {
        self.entries.get(&va).map(|pte| pte.phys_base)
    }

    pub fn is_mapped(&self, va: usize) -> bool {
        self.entries.contains_key(&va)
    }
}

impl Mmu for SoftMmu {
    fn install(&mut self, va: usize, phys_base: usize, writable: bool) -> bool {
        debug_assert!(is_page_aligned(va));
        self.entries.insert(
            va,
            SoftPte {
                phys_base,
                flags: PteFlags::default().with_writable(writable),
            },
        );
        true
    }

    fn clear(&mut self, va: usize) {
        self.entries.remove(&va);
    }

    fn is_dirty(&self, va: usize) -> bool {
        self.entries.get(&va).is_some_and(|pte| pte.flags.dirty())
    }

    fn set_dirty(&mut self, va: usize, dirty: bool) {
        if let Some(pte) = self.entries.get_mut(&va) {
            pte.flags = pte.flags.with_dirty(dirty);
        }
    }
}
