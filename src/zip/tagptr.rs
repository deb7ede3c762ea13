//! Atomic tagged words shared between readers, the submitter and reclaim.
//!
//! - [`ChainPtr`]: a workgroup's `next` link.  One of `Nil` (unclaimed),
//!   `Tail` (end of an open chain), `TailClosed` (end of a chain being
//!   submitted) or `Linked(handle)`.  Encoded in a `u64` so every transition
//!   is a single compare-and-exchange.
//! - [`CompressedSlot`]: one compressed-page slot of a workgroup.  Holds
//!   nothing, a strong page reference tagged with a "just found" bit, or the
//!   `LOCKED` sentinel used while the submitter acquires backing storage.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::page::{Page, PageFrame};
use crate::zip::registry::WorkgroupHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainLink {
    Nil,
    Tail,
    TailClosed,
    Linked(WorkgroupHandle),
}

impl ChainLink {
    const NIL: u64 = 0;
    const TAIL: u64 = 1;
    const TAIL_CLOSED: u64 = 2;

    fn encode(self) -> u64 {
        match self {
            ChainLink::Nil => Self::NIL,
            ChainLink::Tail => Self::TAIL,
            ChainLink::TailClosed => Self::TAIL_CLOSED,
            ChainLink::Linked(h) => h.to_raw(),
        }
    }

    fn decode(raw: u64) -> Self {
        match raw {
            Self::NIL => ChainLink::Nil,
            Self::TAIL => ChainLink::Tail,
            Self::TAIL_CLOSED => ChainLink::TailClosed,
            raw => ChainLink::Linked(WorkgroupHandle::from_raw(raw)),
        }
    }

    pub fn handle(self) -> Option<WorkgroupHandle> {
        match self {
            ChainLink::Linked(h) => Some(h),
            _ => None,
        }
    }
}

pub struct ChainPtr(AtomicU64);

impl ChainPtr {
    pub fn new(link: ChainLink) -> Self {
        ChainPtr(AtomicU64::new(link.encode()))
    }

    pub fn load(&self) -> ChainLink {
        ChainLink::decode(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, link: ChainLink) {
        self.0.store(link.encode(), Ordering::Release);
    }

    /// Returns the previous link; the swap happened iff it equals `current`.
    pub fn compare_exchange(&self, current: ChainLink, new: ChainLink) -> ChainLink {
        match self
            .0
            .compare_exchange(current.encode(), new.encode(), Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(prev) | Err(prev) => ChainLink::decode(prev),
        }
    }
}

impl std::fmt::Debug for ChainPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChainPtr({:?})", self.load())
    }
}

const SLOT_EMPTY: usize = 0;
const SLOT_LOCKED: usize = 2;
const SLOT_JUSTFOUND: usize = 1;

/// Contents of a [`CompressedSlot`] moved out or cloned out of it.
#[derive(Debug)]
pub enum SlotState {
    Empty,
    Locked,
    Page { page: Page, justfound: bool },
}

/// A compressed-page slot.
///
/// The slot owns one strong count of the page it holds.  `PageFrame` is at
/// least 8-byte aligned, so bit 0 is free for the tag and `2` is never a
/// valid pointer.
pub struct CompressedSlot(AtomicUsize);

impl CompressedSlot {
    pub fn new() -> Self {
        CompressedSlot(AtomicUsize::new(SLOT_EMPTY))
    }

    fn fold(page: Page, justfound: bool) -> usize {
        Arc::into_raw(page) as usize | usize::from(justfound)
    }

    /// # Safety
    ///
    /// `raw` must come from `fold` and its strong count must not have been
    /// reclaimed yet.
    unsafe fn unfold(raw: usize) -> SlotState {
        match raw {
            SLOT_EMPTY => SlotState::Empty,
            SLOT_LOCKED => SlotState::Locked,
            raw => SlotState::Page {
                page: Arc::from_raw((raw & !SLOT_JUSTFOUND) as *const PageFrame),
                justfound: raw & SLOT_JUSTFOUND != 0,
            },
        }
    }

    fn addr(page: &Page) -> usize {
        Arc::as_ptr(page) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0.load(Ordering::Acquire) == SLOT_EMPTY
    }

    pub fn is_locked(&self) -> bool {
        self.0.load(Ordering::Acquire) == SLOT_LOCKED
    }

    /// Whether the slot currently holds `page` (either tag).
    pub fn holds(&self, page: &Page) -> bool {
        self.0.load(Ordering::Acquire) & !SLOT_JUSTFOUND == Self::addr(page)
    }

    /// Install `page` into an empty slot.  Gives the page back if the slot
    /// was occupied.
    pub fn try_install(&self, page: Page, justfound: bool) -> std::result::Result<(), Page> {
        let raw = Self::fold(page, justfound);
        match self.0.compare_exchange(SLOT_EMPTY, raw, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => Ok(()),
            // SAFETY: `raw` was produced by `fold` above and never published.
            Err(_) => match unsafe { Self::unfold(raw) } {
                SlotState::Page { page, .. } => Err(page),
                _ => unreachable!("folded page decoded as a sentinel"),
            },
        }
    }

    /// Swap in the `LOCKED` sentinel and move out whatever was there.
    pub fn xchg_locked(&self) -> SlotState {
        let prev = self.0.swap(SLOT_LOCKED, Ordering::AcqRel);
        // SAFETY: the swap transferred the slot's strong count to us.
        unsafe { Self::unfold(prev) }
    }

    /// Store `page` unconditionally, releasing any previous page.
    pub fn store(&self, page: Page, justfound: bool) {
        let prev = self.0.swap(Self::fold(page, justfound), Ordering::AcqRel);
        // SAFETY: the swap transferred the old strong count to us.
        drop(unsafe { Self::unfold(prev) });
    }

    /// Replace the `LOCKED` sentinel with `page`.  Gives the page back if
    /// someone else filled the slot first.
    pub fn cmpxchg_locked(&self, page: Page) -> std::result::Result<(), Page> {
        let raw = Self::fold(page, false);
        match self.0.compare_exchange(SLOT_LOCKED, raw, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => Ok(()),
            // SAFETY: `raw` was produced by `fold` above and never published.
            Err(_) => match unsafe { Self::unfold(raw) } {
                SlotState::Page { page, .. } => Err(page),
                _ => unreachable!("folded page decoded as a sentinel"),
            },
        }
    }

    /// Empty the slot and return its page, if any.  A `LOCKED` slot is
    /// emptied too.
    pub fn take(&self) -> Option<Page> {
        let prev = self.0.swap(SLOT_EMPTY, Ordering::AcqRel);
        // SAFETY: the swap transferred the slot's strong count to us.
        match unsafe { Self::unfold(prev) } {
            SlotState::Page { page, .. } => Some(page),
            _ => None,
        }
    }

    /// Empty the slot iff it holds `page` (either tag).
    pub fn take_if(&self, page: &Page) -> bool {
        let addr = Self::addr(page);
        for raw in [addr, addr | SLOT_JUSTFOUND] {
            if self
                .0
                .compare_exchange(raw, SLOT_EMPTY, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // SAFETY: the exchange transferred the slot's strong count.
                drop(unsafe { Self::unfold(raw) });
                return true;
            }
        }
        false
    }

    /// Swap `old` (either tag) for `new`.  Gives `new` back on mismatch and
    /// reports whether the slot was `LOCKED` at that moment.
    pub fn replace_if(&self, old: &Page, new: Page) -> std::result::Result<(), (Page, bool)> {
        let addr = Self::addr(old);
        let raw_new = Self::fold(new, false);
        let mut locked = false;
        for raw_old in [addr, addr | SLOT_JUSTFOUND] {
            match self
                .0
                .compare_exchange(raw_old, raw_new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    // SAFETY: the exchange transferred the old strong count.
                    drop(unsafe { Self::unfold(raw_old) });
                    return Ok(());
                }
                Err(cur) => locked |= cur == SLOT_LOCKED,
            }
        }
        // SAFETY: `raw_new` was produced by `fold` above and never published.
        match unsafe { Self::unfold(raw_new) } {
            SlotState::Page { page, .. } => Err((page, locked)),
            _ => unreachable!("folded page decoded as a sentinel"),
        }
    }
}

impl Default for CompressedSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CompressedSlot {
    fn drop(&mut self) {
        drop(self.take());
    }
}

impl std::fmt::Debug for CompressedSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.load(Ordering::Acquire) {
            SLOT_EMPTY => f.write_str("Empty"),
            SLOT_LOCKED => f.write_str("Locked"),
            raw => write!(f, "Page({:#x}, justfound={})", raw & !SLOT_JUSTFOUND, raw & SLOT_JUSTFOUND),
        }
    }
}
