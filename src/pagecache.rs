//! Keyed page store shared between requests.
//!
//! The pipeline consumes a page cache through the [`PageCache`] trait only:
//! `lookup`, `insert`, `replace` and `evict` keyed by `(owner, index)`.  The managed
//! cache of compressed pages is one such store, keyed by
//! `(Mapping::Managed, block address)`.  [`MemPageCache`] is the in-memory
//! implementation used by the engine and the tests.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::page::{Mapping, Page};

pub trait PageCache: Send + Sync {
    /// Look up the page cached for `(owner, index)`.
    fn lookup(&self, owner: Mapping, index: u64) -> Option<Page>;

    /// Insert `page` under `(owner, index)`.  On success the page is locked,
    /// owned by `owner` and indexed at `index`; returns `false` without
    /// touching the page if the key is occupied.
    fn insert(&self, page: &Page, owner: Mapping, index: u64) -> bool;

    /// Swap `new` in for `old` under `(owner, index)` in one step, so the
    /// key is never vacant.  On success `new` is locked, owned by `owner`
    /// and indexed at `index`, and `old` is detached.  Returns `false`
    /// without touching either page if `old` is not the cached page or `new`
    /// cannot be locked.
    fn replace(&self, old: &Page, new: &Page, owner: Mapping, index: u64) -> bool;

    /// Remove the page cached for `(owner, index)` and detach it.
    fn evict(&self, owner: Mapping, index: u64) -> Option<Page>;

    /// Number of cached pages of `owner`.
    fn count(&self, owner: Mapping) -> usize;
}

#[derive(Default)]
pub struct MemPageCache {
    pages: Mutex<HashMap<(Mapping, u64), Page>>,
}

impl MemPageCache {
    pub fn new() -> Self {
        MemPageCache { pages: Mutex::new(HashMap::new()) }
    }

    /// Snapshot of the pages cached for `owner`, in index order.
    pub fn pages_of(&self, owner: Mapping) -> Vec<Page> {
        let mut found: Vec<Page> = self
            .pages
            .lock()
            .iter()
            .filter(|((o, _), _)| *o == owner)
            .map(|(_, p)| Arc::clone(p))
            .collect();
        found.sort_by_key(|p| p.index());
        found
    }
}

impl PageCache for MemPageCache {
    fn lookup(&self, owner: Mapping, index: u64) -> Option<Page> {
        self.pages.lock().get(&(owner, index)).cloned()
    }

    fn insert(&self, page: &Page, owner: Mapping, index: u64) -> bool {
        let mut pages = self.pages.lock();
        if pages.contains_key(&(owner, index)) {
            return false;
        }
        if !page.try_lock() {
            return false;
        }
        page.set_mapping(owner);
        page.set_index(index);
        pages.insert((owner, index), Arc::clone(page));
        true
    }

    fn replace(&self, old: &Page, new: &Page, owner: Mapping, index: u64) -> bool {
        let mut pages = self.pages.lock();
        let Some(cur) = pages.get_mut(&(owner, index)) else {
            return false;
        };
        if !Arc::ptr_eq(cur, old) || !new.try_lock() {
            return false;
        }
        new.set_mapping(owner);
        new.set_index(index);
        *cur = Arc::clone(new);
        old.set_mapping(Mapping::None);
        true
    }

    fn evict(&self, owner: Mapping, index: u64) -> Option<Page> {
        let page = self.pages.lock().remove(&(owner, index))?;
        page.set_mapping(Mapping::None);
        Some(page)
    }

    fn count(&self, owner: Mapping) -> usize {
        self.pages.lock().keys().filter(|(o, _)| *o == owner).count()
    }
}
