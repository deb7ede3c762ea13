// Reclaim and migration of idle workgroups.
//
// Coverage:
//   - shrinking retires idle workgroups and drops their managed pages
//   - a workgroup someone still references survives a shrink
//   - a locked managed page makes the bulk release report Busy
//   - releasing one managed page forces the next read back to I/O
//   - migrated pages keep serving reads without I/O
//   - migration swaps cache entries in one step and only its own

use zvle::blockdev::Completion;
use zvle::zip::{migrate_cached_page, shrink_workstation, try_to_free_all_cached_pages, try_to_free_cached_page};
use zvle::{Mapping, PageFrame, ZipError};

use crate::support::{self, assert_page, build, text, Image, Mounted};

fn image() -> Image {
    build(&text(4 * 4096, 9), &support::uniform(4, 4096), 12)
}

/// Mount and read every page once, on the caller's thread.
fn warmed(image: &Image) -> Mounted {
    let m = support::mount(image, support::config(), Completion::Inline);
    for index in 0..image.nr_pages() {
        let (page, res) = m.read_one(index);
        res.unwrap();
        assert_page(image, &page);
    }
    m
}

fn key(image: &Image, k: usize) -> u64 {
    image.extents[k].pblk
}

#[test]
fn shrink_retires_idle_groups() {
    let image = image();
    let m = warmed(&image);
    assert_eq!(m.sb.registry.len(), 4);
    assert_eq!(m.sb.managed.count(Mapping::Managed), 4);

    assert_eq!(shrink_workstation(&m.sb, 2, false), 2);
    assert_eq!(m.sb.registry.len(), 2);
    assert_eq!(shrink_workstation(&m.sb, 0, true), 2);
    assert!(m.sb.registry.is_empty());
    assert_eq!(m.sb.managed.count(Mapping::Managed), 0);
    assert_eq!(m.sb.stats.snapshot().workgroups_freed, 4);

    // Everything reads back from the device.
    let bios = m.sb.stats.snapshot().bios_submitted;
    m.read_all_checked(&image, 1);
    assert_eq!(m.sb.stats.snapshot().bios_submitted, bios + 4);
}

#[test]
fn referenced_group_survives_shrink() {
    let image = image();
    let m = warmed(&image);
    let held = m.sb.registry.find(key(&image, 1)).unwrap();

    assert_eq!(shrink_workstation(&m.sb, 0, true), 3);
    assert_eq!(m.sb.registry.len(), 1);

    m.sb.registry.put(&held);
    assert_eq!(shrink_workstation(&m.sb, 0, true), 1);
    assert!(m.sb.registry.is_empty());
}

#[test]
fn locked_managed_page_blocks_release() {
    let image = image();
    let m = warmed(&image);
    let k = key(&image, 0);
    let grp = m.sb.registry.find(k).unwrap();
    m.sb.registry.put(&grp);
    let cached = m.sb.managed.lookup(Mapping::Managed, k).unwrap();

    assert!(grp.try_freeze(1));
    assert!(cached.try_lock());
    assert!(matches!(try_to_free_all_cached_pages(&m.sb, &grp), Err(ZipError::Busy)));
    assert!(grp.compressed_pages[0].holds(&cached));

    cached.unlock();
    try_to_free_all_cached_pages(&m.sb, &grp).unwrap();
    grp.unfreeze(1);
    assert!(grp.compressed_pages[0].is_empty());
    assert!(m.sb.managed.lookup(Mapping::Managed, k).is_none());
    assert!(!cached.has_private());
}

#[test]
fn released_page_is_read_again() {
    let image = image();
    let m = warmed(&image);
    let k = key(&image, 2);
    let cached = m.sb.managed.lookup(Mapping::Managed, k).unwrap();

    assert!(try_to_free_cached_page(&m.sb, &cached));
    assert!(m.sb.managed.lookup(Mapping::Managed, k).is_none());
    // Already detached.
    assert!(!try_to_free_cached_page(&m.sb, &cached));

    let bios = m.sb.stats.snapshot().bios_submitted;
    let (page, res) = m.read_one(2);
    res.unwrap();
    assert_page(&image, &page);
    assert_eq!(m.sb.stats.snapshot().bios_submitted, bios + 1);
}

#[test]
fn busy_group_keeps_its_page() {
    let image = image();
    let m = warmed(&image);
    let k = key(&image, 3);
    let held = m.sb.registry.find(k).unwrap();
    let cached = m.sb.managed.lookup(Mapping::Managed, k).unwrap();

    assert!(!try_to_free_cached_page(&m.sb, &cached));
    assert!(held.compressed_pages[0].holds(&cached));
    assert!(!cached.is_locked());
    m.sb.registry.put(&held);
}

#[test]
fn migrated_page_serves_reads() {
    let image = image();
    let m = warmed(&image);
    let k = key(&image, 1);
    let old = m.sb.managed.lookup(Mapping::Managed, k).unwrap();
    let new = PageFrame::alloc().unwrap();

    migrate_cached_page(&m.sb, &old, &new).unwrap();
    let now = m.sb.managed.lookup(Mapping::Managed, k).unwrap();
    assert!(std::sync::Arc::ptr_eq(&now, &new));
    assert!(new.is_uptodate());
    assert!(!new.is_locked());
    assert_eq!(new.index(), k);
    assert_eq!(new.to_vec(), old.to_vec());
    assert!(!old.has_private());

    let grp = m.sb.registry.find(k).unwrap();
    assert!(grp.compressed_pages[0].holds(&new));
    m.sb.registry.put(&grp);

    let bios = m.sb.stats.snapshot().bios_submitted;
    let (page, res) = m.read_one(1);
    res.unwrap();
    assert_page(&image, &page);
    assert_eq!(m.sb.stats.snapshot().bios_submitted, bios);
}

#[test]
fn migration_leaves_foreign_cache_entry_alone() {
    let image = image();
    let m = warmed(&image);
    let k = key(&image, 1);
    let cached = m.sb.managed.lookup(Mapping::Managed, k).unwrap();

    // Claims the key without being the page cached there.
    let stale = PageFrame::alloc().unwrap();
    stale.set_mapping(Mapping::Managed);
    stale.set_index(k);
    let new = PageFrame::alloc().unwrap();

    assert!(matches!(migrate_cached_page(&m.sb, &stale, &new), Err(ZipError::Busy)));
    let now = m.sb.managed.lookup(Mapping::Managed, k).unwrap();
    assert!(std::sync::Arc::ptr_eq(&now, &cached));
    assert!(cached.is_managed());
    assert!(!new.is_locked());
    assert_eq!(new.mapping(), Mapping::None);

    let bios = m.sb.stats.snapshot().bios_submitted;
    let (page, res) = m.read_one(1);
    res.unwrap();
    assert_page(&image, &page);
    assert_eq!(m.sb.stats.snapshot().bios_submitted, bios);
}

#[test]
fn migration_refuses_frozen_group() {
    let image = image();
    let m = warmed(&image);
    let k = key(&image, 0);
    let grp = m.sb.registry.find(k).unwrap();
    m.sb.registry.put(&grp);
    let old = m.sb.managed.lookup(Mapping::Managed, k).unwrap();

    assert!(grp.try_freeze(1));
    let new = PageFrame::alloc().unwrap();
    assert!(matches!(migrate_cached_page(&m.sb, &old, &new), Err(ZipError::Busy)));
    grp.unfreeze(1);
    assert!(!old.is_locked());
    assert!(m.sb.managed.lookup(Mapping::Managed, k).is_some());
}
