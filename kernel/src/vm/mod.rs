//! Demand-paged virtual memory.
//!
//! Pages are described lazily and materialized on first fault. The core
//! owns the frame pool, the swap store, and every process's address
//! space behind one lock, so eviction can reach across processes without
//! lock ordering concerns. Frames and page descriptors reference each
//! other by id and are relinked together inside the critical section.

pub mod anon;
pub mod file;
pub mod frame;
pub mod mmu;
pub mod page;
pub mod swap;

use crate::block::block_core::Block;
use crate::block::block_error::BlockError;
use crate::fs::{FileOps, FsError};
use crate::sync::Mutex;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::error::Error;
use core::fmt::{Display, Formatter};
use once_cell::race::OnceBox;
use self::frame::{FrameId, FramePool, PageRef};
use self::mmu::Mmu;
use self::page::{AddressSpace, Page, PageBacking};
use self::swap::SwapStore;
use tadpole_shared::mem::{is_page_aligned, page_round_down, PAGE_FRAME_SIZE};

/// Identifies one process's address space within the VM core.
pub type SpaceId = u16;

/// How far below the stack pointer a fault may land and still count as
/// stack growth. Covers a push executed before the pointer moves.
pub const STACK_SLACK: usize = core::mem::size_of::<usize>();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// A descriptor already covers the target virtual page
    DuplicateMapping,
    /// An mmap region collides with an existing mapping
    MmapOverlap,
    /// The swap area has no free slot
    OutOfSwap,
    /// No frame is free and none could be reclaimed
    OutOfFrames,
    /// The fault cannot be satisfied (unmapped address, protection
    /// violation, or a fault on an already resident page)
    InvalidFault,
    NoSuchSpace,
    /// Malformed user address or length
    BadAddress,
    Device(BlockError),
    File(FsError),
}

impl Display for VmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            VmError::DuplicateMapping => write!(f, "page is already mapped"),
            VmError::MmapOverlap => write!(f, "mapping overlaps an existing one"),
            VmError::OutOfSwap => write!(f, "swap area is full"),
            VmError::OutOfFrames => write!(f, "no frame available"),
            VmError::InvalidFault => write!(f, "fault cannot be satisfied"),
            VmError::NoSuchSpace => write!(f, "no such address space"),
            VmError::BadAddress => write!(f, "bad user address"),
            VmError::Device(err) => write!(f, "swap device error: {err}"),
            VmError::File(err) => write!(f, "file error: {err}"),
        }
    }
}

impl Error for VmError {}

impl From<BlockError> for VmError {
    fn from(err: BlockError) -> Self {
        VmError::Device(err)
    }
}

impl From<FsError> for VmError {
    fn from(err: FsError) -> Self {
        VmError::File(err)
    }
}

/// A page fault as reported by the arch trap handler.
#[derive(Debug, Clone, Copy)]
pub struct PageFault {
    /// The faulting virtual address (not page aligned).
    pub addr: usize,
    /// User stack pointer at the time of the fault. For a fault taken in
    /// kernel context this is the stack pointer saved on entry from user
    /// mode.
    pub sp: usize,
    /// Whether the access came from user mode.
    pub user: bool,
    /// Whether the access was a write.
    pub write: bool,
    /// Whether a translation was present (a protection violation) rather
    /// than missing.
    pub present: bool,
}

/// Everything the VM core owns, guarded by the one VM lock.
pub struct VmState {
    pub(crate) frames: FramePool,
    pub(crate) swap: SwapStore,
    pub(crate) spaces: BTreeMap<SpaceId, AddressSpace>,
    next_space: SpaceId,
}

impl VmState {
    fn new(config: VmConfig) -> Self {
        Self {
            frames: FramePool::new(config.frame_count),
            swap: SwapStore::new(config.swap_device),
            spaces: BTreeMap::new(),
            next_space: 0,
        }
    }

    pub(crate) fn create_space(
        &mut self,
        mmu: Box<dyn Mmu>,
        stack_top: usize,
        max_stack_pages: usize,
    ) -> SpaceId {
        let id = self.next_space;
        self.next_space += 1;
        self.spaces
            .insert(id, AddressSpace::new(mmu, stack_top, max_stack_pages));
        id
    }

    /// Describe a not-yet-touched anonymous page at `addr`.
    pub(crate) fn map_anon(
        &mut self,
        space: SpaceId,
        addr: usize,
        writable: bool,
    ) -> Result<(), VmError> {
        if !is_page_aligned(addr) {
            return Err(VmError::BadAddress);
        }
        let table = self.spaces.get_mut(&space).ok_or(VmError::NoSuchSpace)?;
        table.insert(Page::new_anon(addr, writable))
    }

    /// Get a usable frame, reclaiming one if the pool is empty.
    fn acquire_frame(&mut self) -> Result<FrameId, VmError> {
        if let Some(id) = self.frames.try_alloc() {
            return Ok(id);
        }
        let victim = self.frames.pick_victim().ok_or(VmError::OutOfFrames)?;
        if let Err(err) = self.evict(victim) {
            log::warn!("eviction of frame {victim} failed: {err}");
            return Err(VmError::OutOfFrames);
        }
        self.frames.zero(victim);
        Ok(victim)
    }

    /// Push the page held by `id` out to its backing store and sever the
    /// frame/descriptor link. The frame stays allocated for reuse.
    fn evict(&mut self, id: FrameId) -> Result<(), VmError> {
        let Some(page_ref) = self.frames.resident_of(id) else {
            log::error!("frame {id} picked for eviction holds no page");
            return Err(VmError::OutOfFrames);
        };
        let frames = &mut self.frames;
        let swap = &mut self.swap;
        let table = self
            .spaces
            .get_mut(&page_ref.space)
            .ok_or(VmError::NoSuchSpace)?;
        let pages = &mut table.pages;
        let mmu = &mut table.mmu;
        let Some(victim) = pages.get_mut(&page_ref.va) else {
            log::error!("frame {id} names an unmapped page {:#x}", page_ref.va);
            return Err(VmError::OutOfFrames);
        };
        match &mut victim.backing {
            // Anonymous contents only exist in memory, so they always go
            // to swap regardless of the dirty bit.
            PageBacking::Anon(anon) => anon::swap_out(anon, swap, frames.frame(id))?,
            PageBacking::File(fp) => {
                if fp.segment.writable && mmu.is_dirty(page_ref.va) {
                    file::write_back(fp, frames.frame(id))?;
                    mmu.set_dirty(page_ref.va, false);
                }
            }
            PageBacking::Uninit(_) => {
                debug_assert!(false, "resident page was never initialized");
            }
        }
        mmu.clear(page_ref.va);
        victim.frame = None;
        frames.unlink(id);
        Ok(())
    }

    /// Make the page covering `addr` resident. A no-op if it already is.
    pub(crate) fn claim_page(&mut self, space: SpaceId, addr: usize) -> Result<(), VmError> {
        let va = page_round_down(addr);
        {
            let table = self.spaces.get(&space).ok_or(VmError::NoSuchSpace)?;
            let page = table.find(va).ok_or(VmError::InvalidFault)?;
            if page.is_resident() {
                return Ok(());
            }
        }
        let frame_id = self.acquire_frame()?;
        let frames = &mut self.frames;
        let swap = &mut self.swap;
        let Some(table) = self.spaces.get_mut(&space) else {
            frames.release(frame_id);
            return Err(VmError::NoSuchSpace);
        };
        let pages = &mut table.pages;
        let mmu = &mut table.mmu;
        let Some(page) = pages.get_mut(&va) else {
            frames.release(frame_id);
            return Err(VmError::InvalidFault);
        };
        page.initialize();
        let filled = match &mut page.backing {
            PageBacking::Anon(anon) => anon::swap_in(anon, swap, frames.frame_mut(frame_id)),
            PageBacking::File(fp) => file::swap_in(fp, frames.frame_mut(frame_id)),
            PageBacking::Uninit(_) => Ok(()),
        };
        if let Err(err) = filled {
            frames.release(frame_id);
            return Err(err);
        }
        frames.link(frame_id, PageRef { space, va });
        page.frame = Some(frame_id);
        if !mmu.install(va, frames.base(frame_id), page.writable()) {
            page.frame = None;
            frames.release(frame_id);
            return Err(VmError::OutOfFrames);
        }
        Ok(())
    }

    /// Remove the page covering `addr`, releasing whatever it holds in
    /// the frame pool, the swap area, and the translation tables. Dirty
    /// file pages are flushed first.
    pub(crate) fn destroy_page(&mut self, space: SpaceId, addr: usize) -> Result<(), VmError> {
        let va = page_round_down(addr);
        let frames = &mut self.frames;
        let swap = &mut self.swap;
        let table = self.spaces.get_mut(&space).ok_or(VmError::NoSuchSpace)?;
        let pages = &mut table.pages;
        let mmu = &mut table.mmu;
        let Some(page) = pages.get_mut(&va) else {
            return Err(VmError::BadAddress);
        };
        if let Some(frame_id) = page.frame.take() {
            if let PageBacking::File(fp) = &page.backing {
                if fp.segment.writable && mmu.is_dirty(va) {
                    // The address is going away either way; losing the
                    // flush is not worth failing the unmap over.
                    if let Err(err) = file::write_back(fp, frames.frame(frame_id)) {
                        log::warn!("write-back of {va:#x} during unmap failed: {err}");
                    }
                }
            }
            mmu.clear(va);
            frames.release(frame_id);
        } else if let PageBacking::Anon(anon) = &mut page.backing {
            anon::destroy(anon, swap);
        }
        pages.remove(&va);
        Ok(())
    }

    /// Resolve a page fault: materialize the descriptor's page, or grow
    /// the stack first when the fault looks like a push below the mapped
    /// region.
    pub(crate) fn handle_fault(&mut self, space: SpaceId, fault: PageFault) -> Result<(), VmError> {
        if fault.present {
            return Err(VmError::InvalidFault);
        }
        let va = page_round_down(fault.addr);
        let grow = {
            let table = self.spaces.get(&space).ok_or(VmError::NoSuchSpace)?;
            match table.find(va) {
                Some(page) => {
                    if page.is_resident() {
                        return Err(VmError::InvalidFault);
                    }
                    if fault.write && !page.writable() {
                        return Err(VmError::InvalidFault);
                    }
                    false
                }
                None => {
                    let in_stack = va >= table.stack_floor() && fault.addr < table.stack_top();
                    let near_sp = fault.addr >= fault.sp.saturating_sub(STACK_SLACK);
                    if !(in_stack && near_sp) {
                        return Err(VmError::InvalidFault);
                    }
                    true
                }
            }
        };
        if grow {
            self.grow_stack(space, va)?;
        }
        self.claim_page(space, va)
    }

    /// Map and immediately claim anonymous stack pages from `low` up to
    /// the first existing mapping (or the top of the stack). All or
    /// nothing: a failure part-way undoes every page this call created.
    fn grow_stack(&mut self, space: SpaceId, low: usize) -> Result<(), VmError> {
        let mut created = Vec::new();
        {
            let table = self.spaces.get_mut(&space).ok_or(VmError::NoSuchSpace)?;
            debug_assert!(low >= table.stack_floor() && low < table.stack_top());
            let mut va = low;
            while va < table.stack_top() && table.find(va).is_none() {
                if let Err(err) = table.insert(Page::new_anon(va, true)) {
                    for undo in created {
                        table.pages.remove(&undo);
                    }
                    return Err(err);
                }
                created.push(va);
                va += PAGE_FRAME_SIZE;
            }
        }
        for (i, &va) in created.iter().enumerate() {
            if let Err(err) = self.claim_page(space, va) {
                for &undo in &created[..=i] {
                    if self.destroy_page(space, undo).is_err() {
                        log::error!("unwind of stack page {undo:#x} failed");
                    }
                }
                for &undo in &created[i + 1..] {
                    let Some(table) = self.spaces.get_mut(&space) else {
                        break;
                    };
                    table.pages.remove(&undo);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Duplicate `src` into a fresh address space with `mmu`, eagerly
    /// copying the contents of every touched page. On failure the partial
    /// duplicate is torn down and `src` is left intact.
    pub(crate) fn copy_space(
        &mut self,
        src: SpaceId,
        mmu: Box<dyn Mmu>,
    ) -> Result<SpaceId, VmError> {
        let (stack_top, max_stack_pages, clones) = {
            let table = self.spaces.get(&src).ok_or(VmError::NoSuchSpace)?;
            let clones: Vec<(usize, Page, bool)> = table
                .pages
                .values()
                .map(|p| {
                    let (clone, needs_copy) = p.clone_for_copy();
                    (p.va(), clone, needs_copy)
                })
                .collect();
            (table.stack_top(), table.max_stack_pages(), clones)
        };
        let dst = self.create_space(mmu, stack_top, max_stack_pages);
        if let Err(err) = self.populate_copy(src, dst, clones) {
            if self.teardown_space(dst).is_err() {
                log::error!("teardown of partially copied space {dst} failed");
            }
            return Err(err);
        }
        Ok(dst)
    }

    fn populate_copy(
        &mut self,
        src: SpaceId,
        dst: SpaceId,
        clones: Vec<(usize, Page, bool)>,
    ) -> Result<(), VmError> {
        for (va, clone, needs_copy) in clones {
            {
                let table = self.spaces.get_mut(&dst).ok_or(VmError::NoSuchSpace)?;
                table.insert(clone)?;
            }
            if !needs_copy {
                continue;
            }
            // Buffer the source bytes before claiming the destination:
            // that claim may evict the very frame just brought in.
            self.claim_page(src, va)?;
            let (buf, src_dirty) = {
                let table = self.spaces.get(&src).ok_or(VmError::NoSuchSpace)?;
                let page = table.find(va).ok_or(VmError::InvalidFault)?;
                let id = page.frame.ok_or(VmError::InvalidFault)?;
                let mut buf = alloc::vec![0u8; PAGE_FRAME_SIZE];
                buf.copy_from_slice(self.frames.frame(id));
                (buf, table.mmu.is_dirty(va))
            };
            self.claim_page(dst, va)?;
            let frames = &mut self.frames;
            let table = self.spaces.get_mut(&dst).ok_or(VmError::NoSuchSpace)?;
            let page = table.pages.get(&va).ok_or(VmError::InvalidFault)?;
            let id = page.frame.ok_or(VmError::InvalidFault)?;
            frames.frame_mut(id).copy_from_slice(&buf);
            if src_dirty {
                table.mmu.set_dirty(va, true);
            }
        }
        Ok(())
    }

    /// Destroy every page of `space` and forget the space itself. Dirty
    /// file pages are flushed on the way out.
    pub(crate) fn teardown_space(&mut self, space: SpaceId) -> Result<(), VmError> {
        let vas: Vec<usize> = {
            let table = self.spaces.get(&space).ok_or(VmError::NoSuchSpace)?;
            table.pages.keys().copied().collect()
        };
        for va in vas {
            if let Err(err) = self.destroy_page(space, va) {
                log::warn!("destroying page {va:#x} of space {space} failed: {err}");
            }
        }
        self.spaces.remove(&space);
        Ok(())
    }

    /// Copy kernel bytes into `space` at `addr`, faulting pages in as
    /// needed. Fails on unmapped or read-only destinations.
    pub(crate) fn copy_to_user(
        &mut self,
        space: SpaceId,
        addr: usize,
        bytes: &[u8],
    ) -> Result<(), VmError> {
        let mut copied = 0;
        while copied < bytes.len() {
            let cur = addr + copied;
            let va = page_round_down(cur);
            let offset = cur - va;
            let chunk = (PAGE_FRAME_SIZE - offset).min(bytes.len() - copied);
            {
                let table = self.spaces.get(&space).ok_or(VmError::NoSuchSpace)?;
                let page = table.find(va).ok_or(VmError::BadAddress)?;
                if !page.writable() {
                    return Err(VmError::BadAddress);
                }
            }
            self.claim_page(space, va)?;
            let frames = &mut self.frames;
            let table = self.spaces.get_mut(&space).ok_or(VmError::NoSuchSpace)?;
            let page = table.pages.get(&va).ok_or(VmError::BadAddress)?;
            let id = page.frame.ok_or(VmError::InvalidFault)?;
            frames.frame_mut(id)[offset..offset + chunk]
                .copy_from_slice(&bytes[copied..copied + chunk]);
            table.mmu.set_dirty(va, true);
            copied += chunk;
        }
        Ok(())
    }

    /// Copy bytes out of `space` at `addr` into `buf`, faulting pages in
    /// as needed.
    pub(crate) fn copy_from_user(
        &mut self,
        space: SpaceId,
        addr: usize,
        buf: &mut [u8],
    ) -> Result<(), VmError> {
        let mut copied = 0;
        while copied < buf.len() {
            let cur = addr + copied;
            let va = page_round_down(cur);
            let offset = cur - va;
            let chunk = (PAGE_FRAME_SIZE - offset).min(buf.len() - copied);
            self.claim_page(space, va)?;
            let frames = &self.frames;
            let table = self.spaces.get(&space).ok_or(VmError::NoSuchSpace)?;
            let page = table.find(va).ok_or(VmError::BadAddress)?;
            let id = page.frame.ok_or(VmError::InvalidFault)?;
            buf[copied..copied + chunk].copy_from_slice(&frames.frame(id)[offset..offset + chunk]);
            copied += chunk;
        }
        Ok(())
    }
}

pub struct VmConfig {
    /// Number of physical frames available for user pages.
    pub frame_count: usize,
    /// Device backing the swap area.
    pub swap_device: Block,
}

/// The VM subsystem's public face. All operations lock the one VM state.
pub struct Vm {
    pub(crate) state: Mutex<VmState>,
}

impl Vm {
    pub fn new(config: VmConfig) -> Self {
        log::info!("vm: {} user frames", config.frame_count);
        Self {
            state: Mutex::new(VmState::new(config)),
        }
    }

    pub fn create_space(
        &self,
        mmu: Box<dyn Mmu>,
        stack_top: usize,
        max_stack_pages: usize,
    ) -> SpaceId {
        self.state.lock().create_space(mmu, stack_top, max_stack_pages)
    }

    pub fn map_anon(&self, space: SpaceId, addr: usize, writable: bool) -> Result<(), VmError> {
        self.state.lock().map_anon(space, addr, writable)
    }

    pub fn mmap(
        &self,
        space: SpaceId,
        addr: usize,
        length: usize,
        writable: bool,
        file: &dyn FileOps,
        offset: usize,
    ) -> Result<usize, VmError> {
        self.state
            .lock()
            .do_mmap(space, addr, length, writable, file, offset)
    }

    pub fn munmap(&self, space: SpaceId, addr: usize) -> Result<(), VmError> {
        self.state.lock().do_munmap(space, addr)
    }

    /// Entry point for the trap handler. Returns whether the fault was
    /// resolved; an unresolved fault kills the offending process.
    pub fn page_fault(&self, space: SpaceId, fault: PageFault) -> bool {
        match self.state.lock().handle_fault(space, fault) {
            Ok(()) => true,
            Err(err) => {
                log::warn!(
                    "unresolved {} page fault at {:#x} in space {space}: {err}",
                    if fault.user { "user" } else { "kernel" },
                    fault.addr
                );
                false
            }
        }
    }

    pub fn copy_space(&self, src: SpaceId, mmu: Box<dyn Mmu>) -> Result<SpaceId, VmError> {
        self.state.lock().copy_space(src, mmu)
    }

    pub fn teardown_space(&self, space: SpaceId) -> Result<(), VmError> {
        self.state.lock().teardown_space(space)
    }

    pub fn copy_to_user(&self, space: SpaceId, addr: usize, bytes: &[u8]) -> Result<(), VmError> {
        self.state.lock().copy_to_user(space, addr, bytes)
    }

    pub fn copy_from_user(
        &self,
        space: SpaceId,
        addr: usize,
        buf: &mut [u8],
    ) -> Result<(), VmError> {
        self.state.lock().copy_from_user(space, addr, buf)
    }
}

static VM: OnceBox<Vm> = OnceBox::new();

/// Bring up the VM subsystem. Later calls are ignored.
pub fn vm_init(config: VmConfig) {
    if VM.set(Box::new(Vm::new(config))).is_err() {
        log::warn!("vm subsystem initialized twice");
    }
}

/// The global VM instance. Panics before [`vm_init`].
pub fn vm() -> &'static Vm {
    VM.get().expect("vm subsystem is not initialized")
}
