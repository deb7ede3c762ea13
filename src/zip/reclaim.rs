//! Reclaim and migration of idle workgroups and managed pages.
//!
//! Every actor here first freezes the workgroup it touches: the freeze only
//! succeeds while the registry's reference is the only one, so no request
//! can be reading or filling the compressed slots at the same time.  Readers
//! that race with a freeze wait in `Registry::find` until it is lifted.

use tracing::{debug, trace};

use crate::error::{Result, ZipError};
use crate::page::{Mapping, Page};
use crate::sb::Superblock;
use crate::zip::registry::WorkgroupHandle;
use crate::zip::workgroup::Workgroup;

/// Detach every managed page from `grp` and drop it from the managed cache.
/// The caller holds `grp` frozen.  Fails with `Busy` if a page is locked.
pub fn try_to_free_all_cached_pages(sb: &Superblock, grp: &Workgroup) -> Result<()> {
    debug_assert!(grp.is_frozen());
    for slot in grp.compressed_pages.iter() {
        let Some(page) = slot.take() else { continue };
        if !page.is_managed() {
            slot.store(page, false);
            continue;
        }
        if !page.try_lock() {
            slot.store(page, false);
            return Err(ZipError::Busy);
        }
        sb.managed.evict(Mapping::Managed, page.index());
        page.clear_private();
        page.unlock();
    }
    Ok(())
}

/// Retire up to `nr_shrink` idle workgroups, or every idle one with
/// `cleanup`.  Returns how many were retired.
pub fn shrink_workstation(sb: &Superblock, nr_shrink: usize, cleanup: bool) -> usize {
    let mut freed = 0;
    for grp in sb.registry.snapshot() {
        if !cleanup && freed >= nr_shrink {
            break;
        }
        if !grp.try_freeze(1) {
            continue;
        }
        if try_to_free_all_cached_pages(sb, &grp).is_err() {
            grp.unfreeze(1);
            continue;
        }
        sb.registry.unpublish(&grp);
        grp.unfreeze(1);
        // A reader that found it before the unpublish may still hold it; it
        // retires the workgroup with its own put.
        sb.registry.put(&grp);
        freed += 1;
        trace!(key = grp.index, "workgroup shrunk");
    }
    if freed > 0 {
        debug!(freed, remaining = sb.registry.len(), "workstation shrunk");
    }
    freed
}

/// Detach the locked-out managed `page` from the workgroup that uses it so
/// it can be released.  Returns `false` if the page is busy or the
/// workgroup is in use.
pub fn try_to_free_cached_page(sb: &Superblock, page: &Page) -> bool {
    if !page.is_managed() || !page.has_private() {
        return false;
    }
    if !page.try_lock() {
        return false;
    }
    let handle = WorkgroupHandle::from_raw(page.private() as u64);
    let mut freed = false;
    if let Ok(grp) = sb.registry.get(handle) {
        if grp.try_freeze(1) {
            freed = grp.compressed_pages.iter().any(|slot| slot.take_if(page));
            grp.unfreeze(1);
        }
    }
    if freed {
        sb.managed.evict(Mapping::Managed, page.index());
        page.clear_private();
    }
    page.unlock();
    freed
}

/// Move the managed `old` page's contents and cache entry to `new` and point
/// the owning workgroup's slot at it.  `new` must be unlocked and detached.
/// Fails with `Busy` while the workgroup is in use or `old` is locked.
pub fn migrate_cached_page(sb: &Superblock, old: &Page, new: &Page) -> Result<()> {
    if !old.is_managed() || new.is_locked() {
        return Err(ZipError::Busy);
    }
    if !old.try_lock() {
        return Err(ZipError::Busy);
    }
    let res = migrate_locked(sb, old, new);
    old.unlock();
    res
}

fn migrate_locked(sb: &Superblock, old: &Page, new: &Page) -> Result<()> {
    let index = old.index();
    let grp = if old.has_private() {
        let grp = sb.registry.get(WorkgroupHandle::from_raw(old.private() as u64))?;
        if !grp.try_freeze(1) {
            return Err(ZipError::Busy);
        }
        Some(grp)
    } else {
        None
    };

    let res = move_cached_page(sb, grp.as_deref(), old, new, index);
    if let Some(grp) = &grp {
        grp.unfreeze(1);
    }
    res
}

fn move_cached_page(sb: &Superblock, grp: Option<&Workgroup>, old: &Page, new: &Page, index: u64) -> Result<()> {
    new.write().copy_from_slice(&old.read());
    if !sb.managed.replace(old, new, Mapping::Managed, index) {
        return Err(ZipError::Busy);
    }
    if old.is_uptodate() {
        new.set_uptodate();
    }

    if let Some(grp) = grp {
        let moved = grp
            .compressed_pages
            .iter()
            .any(|slot| slot.replace_if(old, Page::clone(new)).is_ok());
        if moved {
            if let Some(handle) = grp.handle() {
                new.set_private(handle.to_raw() as usize);
            }
        }
    }

    old.clear_private();
    new.unlock();
    trace!(index, "managed page migrated");
    Ok(())
}
