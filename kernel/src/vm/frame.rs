//! The pool of physical frames available for user pages.
//!
//! Frames live in an arena indexed by stable [`FrameId`]s. A frame and
//! the page descriptor it holds point at each other by id, never by
//! reference, and both sides are relinked together under the VM lock.
//! Resident frames sit in a FIFO queue that the (replaceable) victim
//! selector consults when the pool runs dry.

use super::SpaceId;
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use bitbybit::bitfield;
use tadpole_shared::mem::PAGE_FRAME_SIZE;

pub type FrameId = u32;

/// Identifies the page descriptor currently held by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRef {
    pub space: SpaceId,
    pub va: usize,
}

#[bitfield(u8, default = 0)]
struct FrameFlags {
    /// The frame is handed out (it may or may not hold a page yet).
    #[bit(0, rw)]
    allocated: bool,
    /// The frame is in the resident FIFO queue.
    #[bit(1, rw)]
    queued: bool,
}

/// Picks the eviction victim out of the resident queue.
///
/// The queue is ordered oldest-first, so FIFO is simply the front. The
/// selector must name exactly one frame; it never scans open-endedly.
pub type VictimSelector = fn(&VecDeque<FrameId>) -> Option<FrameId>;

/// Least-recently-acquired frame first.
pub fn fifo_victim(queue: &VecDeque<FrameId>) -> Option<FrameId> {
    queue.front().copied()
}

pub struct FramePool {
    data: Box<[u8]>,
    core_map: Box<[FrameFlags]>,
    resident: Box<[Option<PageRef>]>,
    queue: VecDeque<FrameId>,
    victim_selector: VictimSelector,
}

impl FramePool {
    pub fn new(frame_count: usize) -> Self {
        Self {
            data: alloc::vec![0u8; frame_count * PAGE_FRAME_SIZE].into_boxed_slice(),
            core_map: alloc::vec![FrameFlags::default(); frame_count].into_boxed_slice(),
            resident: alloc::vec![None; frame_count].into_boxed_slice(),
            queue: VecDeque::with_capacity(frame_count),
            victim_selector: fifo_victim,
        }
    }

    pub fn frame_count(&self) -> usize {
        self.core_map.len()
    }

    pub fn set_victim_selector(&mut self, selector: VictimSelector) {
        self.victim_selector = selector;
    }

    /// Hand out a free frame, if one exists. The frame is zeroed so stale
    /// contents never leak between processes.
    pub fn try_alloc(&mut self) -> Option<FrameId> {
        let index = self.core_map.iter().position(|flags| !flags.allocated())?;
        self.core_map[index] = self.core_map[index].with_allocated(true);
        let id = index as FrameId;
        self.zero(id);
        Some(id)
    }

    /// Return a frame to the free pool, unlinking it first if needed.
    pub fn release(&mut self, id: FrameId) {
        if self.core_map[id as usize].queued() {
            self.unlink(id);
        }
        debug_assert!(self.core_map[id as usize].allocated());
        self.core_map[id as usize] = self.core_map[id as usize].with_allocated(false);
    }

    /// The frame the eviction policy wants to reclaim next.
    pub fn pick_victim(&self) -> Option<FrameId> {
        (self.victim_selector)(&self.queue)
    }

    /// Record that `id` now holds `page` and enqueue it for eviction
    /// tracking. The descriptor's side of the link is the caller's to set
    /// in the same critical section.
    pub fn link(&mut self, id: FrameId, page: PageRef) {
        let flags = self.core_map[id as usize];
        debug_assert!(flags.allocated() && !flags.queued());
        self.core_map[id as usize] = flags.with_queued(true);
        self.resident[id as usize] = Some(page);
        self.queue.push_back(id);
    }

    /// Detach `id` from its page and drop it from the resident queue. The
    /// frame stays allocated; eviction reuses it immediately.
    pub fn unlink(&mut self, id: FrameId) {
        debug_assert!(self.core_map[id as usize].queued());
        self.core_map[id as usize] = self.core_map[id as usize].with_queued(false);
        self.resident[id as usize] = None;
        if let Some(position) = self.queue.iter().position(|&frame| frame == id) {
            self.queue.remove(position);
        }
    }

    pub fn resident_of(&self, id: FrameId) -> Option<PageRef> {
        self.resident[id as usize]
    }

    /// Physical base address of the frame, stable for its lifetime.
    pub fn base(&self, id: FrameId) -> usize {
        id as usize * PAGE_FRAME_SIZE
    }

    pub fn frame(&self, id: FrameId) -> &[u8] {
        let start = id as usize * PAGE_FRAME_SIZE;
        &self.data[start..start + PAGE_FRAME_SIZE]
    }

    pub fn frame_mut(&mut self, id: FrameId) -> &mut [u8] {
        let start = id as usize * PAGE_FRAME_SIZE;
        &mut self.data[start..start + PAGE_FRAME_SIZE]
    }

    pub fn zero(&mut self, id: FrameId) {
        self.frame_mut(id).fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_ref(va: usize) -> PageRef {
        PageRef { space: 1, va }
    }

    #[test]
    fn alloc_until_exhausted() {
        let mut pool = FramePool::new(2);
        let a = pool.try_alloc().unwrap();
        let b = pool.try_alloc().unwrap();
        assert_ne!(a, b);
        assert!(pool.try_alloc().is_none());
        pool.release(a);
        assert_eq!(pool.try_alloc(), Some(a));
    }

    #[test]
    fn fifo_selects_oldest_link() {
        let mut pool = FramePool::new(3);
        let a = pool.try_alloc().unwrap();
        let b = pool.try_alloc().unwrap();
        pool.link(a, page_ref(0x1000));
        pool.link(b, page_ref(0x2000));
        assert_eq!(pool.pick_victim(), Some(a));

        // Unlinking and relinking moves the frame to the back of the queue.
        pool.unlink(a);
        pool.link(a, page_ref(0x1000));
        assert_eq!(pool.pick_victim(), Some(b));
    }

    #[test]
    fn link_tracks_resident_page() {
        let mut pool = FramePool::new(1);
        let id = pool.try_alloc().unwrap();
        assert_eq!(pool.resident_of(id), None);
        pool.link(id, page_ref(0x3000));
        assert_eq!(pool.resident_of(id), Some(page_ref(0x3000)));
        pool.unlink(id);
        assert_eq!(pool.resident_of(id), None);
        assert_eq!(pool.pick_victim(), None);
    }

    #[test]
    fn fresh_frames_are_zeroed() {
        let mut pool = FramePool::new(1);
        let id = pool.try_alloc().unwrap();
        pool.frame_mut(id).fill(0xaa);
        pool.release(id);
        let id = pool.try_alloc().unwrap();
        assert!(pool.frame(id).iter().all(|&b| b == 0));
    }

    fn newest_victim(queue: &VecDeque<FrameId>) -> Option<FrameId> {
        queue.back().copied()
    }

    #[test]
    fn victim_selector_is_replaceable() {
        let mut pool = FramePool::new(3);
        let a = pool.try_alloc().unwrap();
        let b = pool.try_alloc().unwrap();
        pool.link(a, page_ref(0x1000));
        pool.link(b, page_ref(0x2000));
        assert_eq!(pool.pick_victim(), Some(a));
        pool.set_victim_selector(newest_victim);
        assert_eq!(pool.pick_victim(), Some(b));
    }
}
