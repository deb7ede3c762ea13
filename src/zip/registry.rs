//! Workgroup Registry.
//!
//! Workgroups live in a generation-checked slab and are found through a
//! keyed index on the physical block address.  A [`WorkgroupHandle`] names a
//! slab slot plus the generation it was issued for; once the workgroup is
//! retired the slot's generation moves on and the handle resolves to
//! [`ZipError::StaleHandle`].  Readers that already hold an
//! `Arc<Workgroup>` keep its memory alive past retirement, which is all the
//! grace period the pipeline needs.
//!
//! The registry itself holds one reference on every registered workgroup.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::error::{Result, ZipError};
use crate::stats::Stats;
use crate::zip::workgroup::Workgroup;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkgroupHandle {
    pub index: u32,
    pub generation: u32,
}

impl WorkgroupHandle {
    /// Never 0, 1 or 2, so it can share a word with chain sentinels.
    pub fn to_raw(self) -> u64 {
        ((self.index as u64 + 1) << 32) | self.generation as u64
    }

    pub fn from_raw(raw: u64) -> Self {
        WorkgroupHandle { index: ((raw >> 32) as u32).wrapping_sub(1), generation: raw as u32 }
    }
}

#[derive(Default)]
struct Slot {
    generation: u32,
    grp: Option<Arc<Workgroup>>,
}

#[derive(Default)]
struct Slab {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

pub struct Registry {
    index: Mutex<HashMap<u64, WorkgroupHandle>>,
    slab: RwLock<Slab>,
    stats: Arc<Stats>,
}

impl Registry {
    pub fn new(stats: Arc<Stats>) -> Self {
        Registry { index: Mutex::new(HashMap::new()), slab: RwLock::new(Slab::default()), stats }
    }

    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.lock().is_empty()
    }

    /// Resolve a handle.  Does not take a reference.
    pub fn get(&self, handle: WorkgroupHandle) -> Result<Arc<Workgroup>> {
        let slab = self.slab.read();
        match slab.slots.get(handle.index as usize) {
            Some(Slot { generation, grp: Some(grp) }) if *generation == handle.generation => Ok(Arc::clone(grp)),
            _ => Err(ZipError::StaleHandle),
        }
    }

    fn lookup(&self, key: u64) -> Option<Arc<Workgroup>> {
        let handle = *self.index.lock().get(&key)?;
        self.get(handle).ok()
    }

    /// Find the workgroup registered for `key` and take a reference on it.
    pub fn find(&self, key: u64) -> Option<Arc<Workgroup>> {
        loop {
            let grp = self.lookup(key)?;
            // Spinning on a frozen group happens outside the index lock, so
            // the freezer can still retire it.
            if grp.try_get() {
                // A reclaimer may have unpublished it while we waited.
                if self.is_published(&grp) {
                    trace!(key, refcount = grp.refcount(), "found workgroup");
                    return Some(grp);
                }
                self.put(&grp);
            }
            std::thread::yield_now();
        }
    }

    /// Publish a freshly created workgroup (refcount 1, held by the caller)
    /// under its key.  On success the registry adds its own reference.  If
    /// another workgroup already owns the key the new one is handed back and
    /// the caller should retry as a lookup.
    pub fn register(&self, grp: Arc<Workgroup>) -> std::result::Result<Arc<Workgroup>, Arc<Workgroup>> {
        debug_assert_eq!(grp.refcount(), 1);
        let mut index = self.index.lock();
        if index.contains_key(&grp.index) {
            return Err(grp);
        }
        let handle = {
            let mut slab = self.slab.write();
            let slot = match slab.free.pop() {
                Some(i) => i,
                None => {
                    slab.slots.push(Slot::default());
                    (slab.slots.len() - 1) as u32
                }
            };
            let entry = &mut slab.slots[slot as usize];
            entry.grp = Some(Arc::clone(&grp));
            WorkgroupHandle { index: slot, generation: entry.generation }
        };
        grp.set_handle(handle);
        grp.get_locked();
        index.insert(grp.index, handle);
        Stats::bump(&self.stats.workgroups_created);
        trace!(key = grp.index, ?handle, "registered workgroup");
        Ok(grp)
    }

    /// Drop a reference.  The last one retires the workgroup.
    pub fn put(&self, grp: &Arc<Workgroup>) {
        if grp.put_ref() == 0 {
            self.retire(grp);
        }
    }

    /// Remove `grp` from the index and free its slot.  Its handle turns
    /// stale.
    pub(crate) fn retire(&self, grp: &Workgroup) {
        let Some(handle) = grp.handle() else { return };
        let mut index = self.index.lock();
        if index.get(&grp.index) == Some(&handle) {
            index.remove(&grp.index);
        }
        drop(index);

        let mut slab = self.slab.write();
        if let Some(slot) = slab.slots.get_mut(handle.index as usize) {
            if slot.generation == handle.generation && slot.grp.is_some() {
                slot.grp = None;
                slot.generation = slot.generation.wrapping_add(1);
                slab.free.push(handle.index);
                Stats::bump(&self.stats.workgroups_freed);
                trace!(key = grp.index, ?handle, "retired workgroup");
            }
        }
    }

    /// Remove `grp` from the index only, so new lookups miss it while its
    /// slot stays resolvable.
    pub(crate) fn unpublish(&self, grp: &Workgroup) -> bool {
        let Some(handle) = grp.handle() else { return false };
        let mut index = self.index.lock();
        if index.get(&grp.index) == Some(&handle) {
            index.remove(&grp.index);
            return true;
        }
        false
    }

    fn is_published(&self, grp: &Workgroup) -> bool {
        match grp.handle() {
            Some(handle) => self.index.lock().get(&grp.index) == Some(&handle),
            None => false,
        }
    }

    /// Every registered workgroup, without taking references.
    pub fn snapshot(&self) -> Vec<Arc<Workgroup>> {
        let handles: Vec<WorkgroupHandle> = self.index.lock().values().copied().collect();
        handles.into_iter().filter_map(|h| self.get(h).ok()).collect()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("workgroups", &self.len()).finish()
    }
}
