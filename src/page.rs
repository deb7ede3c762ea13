//! In-memory page frames.
//!
//! A [`Page`] is a reference-counted, fixed-size frame with the handful of
//! page-cache properties the decompression pipeline relies on:
//!
//! - a lock bit with blocking waiters (`lock`, `unlock`, `wait_unlocked`);
//! - `UPTODATE` / `ERROR` completion flags;
//! - a [`Mapping`] naming the page's owner (a file, the managed cache, or a
//!   per-request staging role);
//! - a private word, used either for "online page" split accounting on file
//!   pages or to point a managed page back at its workgroup.
//!
//! # Online pages
//!
//! A file page may straddle two logical extents and therefore be filled by two
//! workgroups.  Its private word packs a logical index (upper bits) and a
//! pending-part counter (low [`ONLINEPAGE_COUNT_BITS`] bits).  The frontend
//! holds one part while it attaches the page; every attached workgroup holds
//! another.  The last `online_endio` publishes the final state and unlocks.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::PAGE_SIZE;
use crate::error::{Result, ZipError};

pub type Page = Arc<PageFrame>;

pub const PG_LOCKED: u32 = 1 << 0;
pub const PG_UPTODATE: u32 = 1 << 1;
pub const PG_ERROR: u32 = 1 << 2;
pub const PG_PRIVATE: u32 = 1 << 3;
pub const PG_READAHEAD: u32 = 1 << 4;

pub const ONLINEPAGE_COUNT_BITS: u32 = 2;
pub const ONLINEPAGE_COUNT_MASK: usize = (1 << ONLINEPAGE_COUNT_BITS) - 1;
pub const ONLINEPAGE_INDEX_SHIFT: u32 = ONLINEPAGE_COUNT_BITS;

/// Owner of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mapping {
    /// Detached, e.g. truncated out of the managed cache.
    None,
    /// Page-cache page of the file with this nid.
    File(u64),
    /// Page of the managed compressed-data cache.
    Managed,
    /// Short-lived page owned by one request; recycled into a page pool.
    Staging,
    /// Reserved for the managed cache but not inserted yet.
    Preallocated,
}

impl Mapping {
    const NONE: u64 = 0;
    const MANAGED: u64 = 1;
    const STAGING: u64 = 2;
    const PREALLOCATED: u64 = 3;
    const FILE: u64 = 4;
    const KIND_BITS: u32 = 3;

    fn encode(self) -> u64 {
        match self {
            Mapping::None => Self::NONE,
            Mapping::Managed => Self::MANAGED,
            Mapping::Staging => Self::STAGING,
            Mapping::Preallocated => Self::PREALLOCATED,
            Mapping::File(nid) => (nid << Self::KIND_BITS) | Self::FILE,
        }
    }

    fn decode(raw: u64) -> Self {
        match raw & ((1 << Self::KIND_BITS) - 1) {
            Self::MANAGED => Mapping::Managed,
            Self::STAGING => Mapping::Staging,
            Self::PREALLOCATED => Mapping::Preallocated,
            Self::FILE => Mapping::File(raw >> Self::KIND_BITS),
            _ => Mapping::None,
        }
    }
}

pub struct PageFrame {
    data: RwLock<Box<[u8]>>,
    index: AtomicU64,
    mapping: AtomicU64,
    flags: AtomicU32,
    private: AtomicUsize,
    waitq: Mutex<()>,
    wakeup: Condvar,
}

impl std::fmt::Debug for PageFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageFrame")
            .field("index", &self.index())
            .field("mapping", &self.mapping())
            .field("flags", &format_args!("{:#x}", self.flags()))
            .field("private", &format_args!("{:#x}", self.private()))
            .finish()
    }
}

impl PageFrame {
    /// Allocate a zeroed, unowned page.  Fails instead of aborting when the
    /// allocator cannot satisfy the request.
    pub fn alloc() -> Result<Page> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(PAGE_SIZE)
            .map_err(|_| ZipError::ResourceExhausted("page"))?;
        buf.resize(PAGE_SIZE, 0);
        Ok(Arc::new(PageFrame {
            data: RwLock::new(buf.into_boxed_slice()),
            index: AtomicU64::new(0),
            mapping: AtomicU64::new(Mapping::None.encode()),
            flags: AtomicU32::new(0),
            private: AtomicUsize::new(0),
            waitq: Mutex::new(()),
            wakeup: Condvar::new(),
        }))
    }

    /// A locked page of file `nid` at page `index`, as handed to the read
    /// entry points.
    pub fn new_file_page(nid: u64, index: u64) -> Result<Page> {
        let page = Self::alloc()?;
        page.set_mapping(Mapping::File(nid));
        page.set_index(index);
        page.flags.fetch_or(PG_LOCKED, Ordering::AcqRel);
        Ok(page)
    }

    // ── identity ─────────────────────────────────────────────────────────────

    pub fn index(&self) -> u64 {
        self.index.load(Ordering::Acquire)
    }

    pub fn set_index(&self, index: u64) {
        self.index.store(index, Ordering::Release);
    }

    pub fn mapping(&self) -> Mapping {
        Mapping::decode(self.mapping.load(Ordering::Acquire))
    }

    pub fn set_mapping(&self, mapping: Mapping) {
        self.mapping.store(mapping.encode(), Ordering::Release);
    }

    pub fn is_staging(&self) -> bool {
        self.mapping() == Mapping::Staging
    }

    pub fn is_managed(&self) -> bool {
        self.mapping() == Mapping::Managed
    }

    /// Forget every per-use attribute before the frame is handed out again.
    pub fn reinit(&self) {
        self.flags.store(0, Ordering::Release);
        self.private.store(0, Ordering::Release);
        self.index.store(0, Ordering::Release);
        self.set_mapping(Mapping::None);
    }

    // ── flags ────────────────────────────────────────────────────────────────

    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    fn test_flag(&self, flag: u32) -> bool {
        self.flags() & flag != 0
    }

    pub fn is_uptodate(&self) -> bool {
        self.test_flag(PG_UPTODATE)
    }

    pub fn set_uptodate(&self) {
        self.flags.fetch_or(PG_UPTODATE, Ordering::AcqRel);
    }

    pub fn has_error(&self) -> bool {
        self.test_flag(PG_ERROR)
    }

    pub fn set_error(&self) {
        self.flags.fetch_or(PG_ERROR, Ordering::AcqRel);
    }

    pub fn clear_error(&self) {
        self.flags.fetch_and(!PG_ERROR, Ordering::AcqRel);
    }

    pub fn is_readahead(&self) -> bool {
        self.test_flag(PG_READAHEAD)
    }

    pub fn set_readahead(&self) {
        self.flags.fetch_or(PG_READAHEAD, Ordering::AcqRel);
    }

    pub fn has_private(&self) -> bool {
        self.test_flag(PG_PRIVATE)
    }

    // ── private word ─────────────────────────────────────────────────────────

    pub fn private(&self) -> usize {
        self.private.load(Ordering::Acquire)
    }

    pub fn set_private(&self, value: usize) {
        self.private.store(value, Ordering::Release);
        self.flags.fetch_or(PG_PRIVATE, Ordering::AcqRel);
    }

    pub fn clear_private(&self) {
        self.flags.fetch_and(!PG_PRIVATE, Ordering::AcqRel);
        self.private.store(0, Ordering::Release);
    }

    // ── lock ─────────────────────────────────────────────────────────────────

    pub fn is_locked(&self) -> bool {
        self.test_flag(PG_LOCKED)
    }

    pub fn try_lock(&self) -> bool {
        self.flags.fetch_or(PG_LOCKED, Ordering::AcqRel) & PG_LOCKED == 0
    }

    pub fn lock(&self) {
        while !self.try_lock() {
            let mut guard = self.waitq.lock();
            while self.is_locked() {
                self.wakeup.wait(&mut guard);
            }
        }
    }

    pub fn unlock(&self) {
        debug_assert!(self.is_locked(), "unlocking an unlocked page");
        self.flags.fetch_and(!PG_LOCKED, Ordering::AcqRel);
        let _guard = self.waitq.lock();
        self.wakeup.notify_all();
    }

    /// Block until the page is unlocked.
    pub fn wait_unlocked(&self) {
        let mut guard = self.waitq.lock();
        while self.is_locked() {
            self.wakeup.wait(&mut guard);
        }
    }

    /// Like [`wait_unlocked`](Self::wait_unlocked) with a deadline.  Returns
    /// `false` if the page was still locked when `timeout` elapsed.
    pub fn wait_unlocked_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.waitq.lock();
        while self.is_locked() {
            if self.wakeup.wait_until(&mut guard, deadline).timed_out() {
                return !self.is_locked();
            }
        }
        true
    }

    // ── online page accounting ──────────────────────────────────────────────

    /// Register a locked file page as online with one pending part, owned by
    /// the frontend that is attaching it.
    pub fn online_init(&self) {
        self.set_private(1);
    }

    /// Record the page's logical `index` within a work (only the first
    /// non-zero index sticks) and, if `down`, add one pending part.
    pub fn online_fixup(&self, index: usize, down: bool) {
        let mut old = self.private.load(Ordering::Acquire);
        loop {
            let id = old >> ONLINEPAGE_INDEX_SHIFT;
            let index = if id != 0 && index == 0 { id } else { index };
            debug_assert!(id == 0 || id == index, "online page re-indexed");
            let new = (index << ONLINEPAGE_INDEX_SHIFT)
                | ((old & ONLINEPAGE_COUNT_MASK) + usize::from(down));
            match self
                .private
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(cur) => old = cur,
            }
        }
    }

    pub fn online_index(&self) -> usize {
        self.private() >> ONLINEPAGE_INDEX_SHIFT
    }

    pub fn online_pending(&self) -> usize {
        self.private() & ONLINEPAGE_COUNT_MASK
    }

    /// Drop one pending part.  The last part marks the page uptodate (unless
    /// an error was flagged) and unlocks it.
    pub fn online_endio(&self) {
        let prev = self.private.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev & ONLINEPAGE_COUNT_MASK != 0, "online page over-ended");
        if (prev - 1) & ONLINEPAGE_COUNT_MASK == 0 {
            self.flags.fetch_and(!PG_PRIVATE, Ordering::AcqRel);
            if !self.has_error() {
                self.set_uptodate();
            }
            self.unlock();
        }
    }

    // ── data ─────────────────────────────────────────────────────────────────

    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.data.write()
    }

    /// Copy `src` into the page starting at byte `offset`.
    pub fn copy_in(&self, offset: usize, src: &[u8]) {
        let mut data = self.data.write();
        data[offset..offset + src.len()].copy_from_slice(src);
    }

    /// Zero bytes `[from, to)`.
    pub fn zero_range(&self, from: usize, to: usize) {
        if from < to {
            self.data.write()[from..to].fill(0);
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data.read().to_vec()
    }
}
