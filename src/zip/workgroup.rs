//! Workgroups and their works.
//!
//! A [`Workgroup`] is the in-memory state of one physical cluster: its
//! compressed-page slots, chain link and reference count.  Its [`Work`]
//! (exactly one per workgroup) collects the file pages requested against the
//! cluster and is guarded by a mutex that every pagevec mutation, claim
//! decision and decompression pass holds.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::zip::inplace::InplaceStrategy;
use crate::zip::pagevec::Pagevec;
use crate::zip::registry::WorkgroupHandle;
use crate::zip::tagptr::{ChainLink, ChainPtr, CompressedSlot};

/// Refcount value of a workgroup held exclusively by a reclaim or migration
/// actor.
pub const WG_FROZEN: i32 = i32::MIN | 0x0F51_0CC0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Stored uncompressed; decompression is a byte copy.
    Plain,
    Lz4,
}

/// Mutable state of a work, guarded by the work lock.
#[derive(Debug, Default)]
pub struct WorkState {
    /// Offset of the extent start within its first page.
    pub pageofs: u32,
    /// The extent runs to the end of the file, so the rest of its last
    /// page is zero-filled.
    pub at_eof: bool,
    /// One past the highest logical page index attached.
    pub nr_pages: usize,
    pub pagevec: Pagevec,
}

pub type Work = Arc<Mutex<WorkState>>;

pub struct Workgroup {
    /// Physical block address of the cluster; the registry key.
    pub index: u64,
    handle: OnceLock<WorkgroupHandle>,
    refcount: AtomicI32,
    pub next: ChainPtr,
    llen: AtomicU64,
    pub format: Format,
    pub inplace: InplaceStrategy,
    pub compressed_pages: Box<[CompressedSlot]>,
    pub work: Work,
}

impl Workgroup {
    /// A fresh workgroup with one reference (its creator's), linked to
    /// `next` and with its work's `pageofs` set.
    pub fn new(
        index: u64,
        format: Format,
        llen: u64,
        clusterpages: usize,
        pageofs: u32,
        inplace: InplaceStrategy,
        next: ChainLink,
    ) -> Self {
        Workgroup {
            index,
            handle: OnceLock::new(),
            refcount: AtomicI32::new(1),
            next: ChainPtr::new(next),
            llen: AtomicU64::new(llen),
            format,
            inplace,
            compressed_pages: (0..clusterpages).map(|_| CompressedSlot::new()).collect(),
            work: Arc::new(Mutex::new(WorkState { pageofs, ..WorkState::default() })),
        }
    }

    /// Handle assigned at registration.
    pub fn handle(&self) -> Option<WorkgroupHandle> {
        self.handle.get().copied()
    }

    pub(crate) fn set_handle(&self, handle: WorkgroupHandle) {
        let _ = self.handle.set(handle);
    }

    pub fn clusterpages(&self) -> usize {
        self.compressed_pages.len()
    }

    pub fn llen(&self) -> u64 {
        self.llen.load(Ordering::Acquire)
    }

    /// Raise the logical length to at least `llen`.
    pub fn extend_llen(&self, llen: u64) {
        let mut orig = self.llen.load(Ordering::Acquire);
        while orig < llen {
            match self
                .llen
                .compare_exchange_weak(orig, llen, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(cur) => {
                    orig = cur;
                    std::hint::spin_loop();
                }
            }
        }
    }

    // ── reference counting ──────────────────────────────────────────────────

    pub fn refcount(&self) -> i32 {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn is_frozen(&self) -> bool {
        self.refcount() == WG_FROZEN
    }

    /// Take a reference.  Spins while the workgroup is frozen; fails once the
    /// count has dropped to zero (the workgroup is being retired).
    pub fn try_get(&self) -> bool {
        let mut v = self.refcount.load(Ordering::Acquire);
        loop {
            if v == WG_FROZEN {
                std::thread::yield_now();
                v = self.refcount.load(Ordering::Acquire);
                continue;
            }
            if v <= 0 {
                return false;
            }
            match self
                .refcount
                .compare_exchange_weak(v, v + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(cur) => v = cur,
            }
        }
    }

    /// Add a reference the caller already knows to be safe to add.
    pub(crate) fn get_locked(&self) -> i32 {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop a reference, returning the new count.
    pub(crate) fn put_ref(&self) -> i32 {
        let v = self.refcount.fetch_sub(1, Ordering::AcqRel) - 1;
        debug_assert!(v >= 0, "workgroup {} refcount underflow", self.index);
        v
    }

    /// Atomically replace the refcount with the frozen sentinel iff it
    /// currently equals `expected`.
    pub fn try_freeze(&self, expected: i32) -> bool {
        self.refcount
            .compare_exchange(expected, WG_FROZEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Leave the frozen state with refcount `v`.
    pub fn unfreeze(&self, v: i32) {
        debug_assert!(self.is_frozen());
        self.refcount.store(v, Ordering::Release);
    }
}

impl std::fmt::Debug for Workgroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workgroup")
            .field("index", &self.index)
            .field("handle", &self.handle())
            .field("refcount", &self.refcount())
            .field("next", &self.next.load())
            .field("llen", &self.llen())
            .field("format", &self.format)
            .finish()
    }
}
