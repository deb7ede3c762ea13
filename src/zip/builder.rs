//! Work Builder.
//!
//! A [`WorkBuilder`] is the per-request cursor that attaches file pages to
//! the workgroup of the extent currently being read.  Beginning a work finds
//! or creates the workgroup, locks its work and settles this request's
//! [`Role`] through the ownership claim; the role then decides whether the
//! request may fill compressed slots from the managed cache and whether its
//! exclusive pages may double as compressed storage.

use std::sync::Arc;

use lock_api::ArcMutexGuard;
use parking_lot::RawMutex;
use tracing::trace;

use crate::config::{BLOCK_SIZE, PAGE_SIZE};
use crate::error::{Result, ZipError};
use crate::page::{Mapping, Page};
use crate::pagepool::PagePool;
use crate::sb::Superblock;
use crate::vle::MapBlocks;
use crate::zip::pagevec::PageType;
use crate::zip::registry::WorkgroupHandle;
use crate::zip::tagptr::ChainLink;
use crate::zip::workgroup::{Format, WorkState, Workgroup};

/// Relationship between a request and the workgroup it is attaching to.
/// Ordered by the strength of the claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    /// Attached to a workgroup someone else schedules and may be running.
    Secondary,
    /// The workgroup already sits in a chain; this request piggybacks.
    Primary,
    /// Claimed the tail of an open chain; not followed by this request's
    /// own chain.
    PrimaryTerminal,
    /// Owns the workgroup: it heads or was linked into this request's chain.
    PrimaryFollowed,
}

/// Claim `grp` for the request whose chain currently starts at `owned_head`.
///
/// A workgroup whose link is `Nil` is idle: it becomes the new head of the
/// request's chain and the request hosts it.  A `Tail` link means the
/// workgroup ends a chain another request has not submitted yet; linking our
/// chain behind it lets that request submit both.  `own_tail` is the
/// workgroup ending this request's own chain, which must never be linked to
/// its own head.
fn try_to_claim(
    grp: &Workgroup,
    owned_head: &mut ChainLink,
    own_tail: &mut Option<WorkgroupHandle>,
    hosted: &mut bool,
) -> Role {
    let Some(handle) = grp.handle() else {
        return Role::Primary;
    };
    loop {
        match grp.next.load() {
            ChainLink::Nil => {
                if grp.next.compare_exchange(ChainLink::Nil, *owned_head) != ChainLink::Nil {
                    continue;
                }
                if *owned_head == ChainLink::Tail {
                    *own_tail = Some(handle);
                }
                *owned_head = ChainLink::Linked(handle);
                *hosted = true;
                return Role::PrimaryFollowed;
            }
            ChainLink::Tail if *own_tail != Some(handle) => {
                if grp.next.compare_exchange(ChainLink::Tail, *owned_head) != ChainLink::Tail {
                    continue;
                }
                *owned_head = ChainLink::Tail;
                *own_tail = None;
                return Role::PrimaryTerminal;
            }
            _ => return Role::Primary,
        }
    }
}

pub struct WorkBuilder {
    role: Role,
    hosted: bool,
    grp: Option<Arc<Workgroup>>,
    work: Option<ArcMutexGuard<RawMutex, WorkState>>,
    /// Workgroup at the far end of the request's own chain.
    own_tail: Option<WorkgroupHandle>,
    /// First compressed slot still worth trying for in-place reuse.
    cursor: usize,
}

impl Default for WorkBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkBuilder {
    pub fn new() -> Self {
        WorkBuilder { role: Role::PrimaryFollowed, hosted: false, grp: None, work: None, own_tail: None, cursor: 0 }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_hosted(&self) -> bool {
        self.hosted
    }

    pub fn has_work(&self) -> bool {
        self.work.is_some()
    }

    pub fn workgroup(&self) -> Option<&Arc<Workgroup>> {
        self.grp.as_ref()
    }

    pub fn work_mut(&mut self) -> Option<&mut WorkState> {
        self.work.as_deref_mut()
    }

    /// Nothing queued behind this request can start decompressing before
    /// the request itself submits.
    pub fn is_weak_followed(&self) -> bool {
        self.role >= Role::PrimaryTerminal
    }

    pub fn is_followed(&self) -> bool {
        self.role >= Role::PrimaryFollowed
    }

    /// Find or create the workgroup of `map`'s physical cluster, lock its
    /// work and claim it.
    pub fn begin(&mut self, sb: &Superblock, map: &MapBlocks, owned_head: &mut ChainLink) -> Result<()> {
        debug_assert!(self.work.is_none(), "work builder begun twice");
        let key = map.m_pa / BLOCK_SIZE as u64;
        let pageofs = (map.m_la & (PAGE_SIZE as u64 - 1)) as u32;

        loop {
            if let Some(grp) = sb.registry.find(key) {
                let work = grp.work.lock_arc();
                if work.pageofs != pageofs {
                    drop(work);
                    sb.registry.put(&grp);
                    let lcn = map.m_la >> sb.geometry.cluster_bits;
                    return Err(ZipError::corrupt(0, lcn, "extents share a workgroup at different page offsets"));
                }
                let mut hosted = false;
                let role = try_to_claim(&grp, owned_head, &mut self.own_tail, &mut hosted);
                grp.extend_llen(map.m_llen);
                self.install(grp, work, role, hosted);
                break;
            }

            let format = if map.is_zipped() { Format::Lz4 } else { Format::Plain };
            let grp = Arc::new(Workgroup::new(
                key,
                format,
                map.m_llen,
                sb.cluster_pages(),
                pageofs,
                sb.config.inplace,
                *owned_head,
            ));
            // Locked before it becomes visible.
            let work = grp.work.lock_arc();
            match sb.registry.register(grp) {
                Ok(grp) => {
                    let Some(handle) = grp.handle() else {
                        drop(work);
                        sb.registry.put(&grp);
                        return Err(ZipError::StaleHandle);
                    };
                    if *owned_head == ChainLink::Tail {
                        self.own_tail = Some(handle);
                    }
                    *owned_head = ChainLink::Linked(handle);
                    self.install(grp, work, Role::PrimaryFollowed, true);
                    break;
                }
                Err(_raced) => {
                    drop(work);
                    trace!(key, "lost workgroup registration race; retrying lookup");
                }
            }
        }
        Ok(())
    }

    fn install(&mut self, grp: Arc<Workgroup>, work: ArcMutexGuard<RawMutex, WorkState>, role: Role, hosted: bool) {
        self.role = role;
        self.hosted = hosted;
        self.cursor = if role >= Role::Primary { 0 } else { grp.clusterpages() };
        trace!(key = grp.index, ?role, hosted, "work begun");
        self.grp = Some(grp);
        self.work = Some(work);
    }

    /// Fill empty compressed slots from the managed cache.  With `reserve`,
    /// slots the cache cannot serve receive a preallocated page that the
    /// submitter inserts into the cache later.  Once every slot is backed
    /// the request no longer needs to be the one scheduling the I/O, so its
    /// role drops to `Primary`.
    pub fn scan_cachepages(&mut self, sb: &Superblock, reserve: bool, pool: &mut PagePool) {
        if self.role < Role::PrimaryTerminal {
            return;
        }
        let Some(grp) = self.grp.as_ref() else { return };

        let mut standalone = true;
        let mut first_gap = self.cursor;
        for i in self.cursor..grp.clusterpages() {
            let slot = &grp.compressed_pages[i];
            if !slot.is_empty() {
                continue;
            }

            let (page, preallocated) = match sb.managed.lookup(Mapping::Managed, grp.index + i as u64) {
                Some(page) => (page, false),
                None if reserve => match pool.alloc() {
                    Ok(page) => {
                        page.set_mapping(Mapping::Preallocated);
                        (page, true)
                    }
                    Err(_) => {
                        if standalone {
                            first_gap = i;
                        }
                        standalone = false;
                        continue;
                    }
                },
                None => {
                    if standalone {
                        first_gap = i;
                    }
                    standalone = false;
                    continue;
                }
            };

            if let Err(page) = slot.try_install(page, true) {
                if preallocated {
                    page.set_mapping(Mapping::None);
                    pool.put(page);
                }
            }
        }

        self.cursor = first_gap;
        if standalone {
            self.role = Role::Primary;
        }
    }

    /// Attach `page` to the current work.  Exclusive pages are parked in an
    /// empty compressed slot when the role and in-place strategy allow it.
    pub fn add_page(&mut self, page: &Page, ty: PageType) -> Result<()> {
        let Some(grp) = self.grp.as_ref() else {
            return Err(ZipError::StaleHandle);
        };
        if self.role >= Role::Primary
            && ty == PageType::Exclusive
            && grp.inplace.try_reuse(grp.format, &grp.compressed_pages, &mut self.cursor, page)
        {
            return Ok(());
        }
        let Some(work) = self.work.as_deref_mut() else {
            return Err(ZipError::StaleHandle);
        };
        work.pagevec.enqueue(Page::clone(page), ty).map(|_| ())
    }

    /// Unlock the current work.  Returns `false` if none was begun.
    pub fn end(&mut self, sb: &Superblock) -> bool {
        let Some(work) = self.work.take() else {
            return false;
        };
        drop(work);
        if let Some(grp) = self.grp.take() {
            if !self.hosted {
                sb.registry.put(&grp);
            }
        }
        self.hosted = false;
        true
    }
}

impl std::fmt::Debug for WorkBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkBuilder")
            .field("role", &self.role)
            .field("hosted", &self.hosted)
            .field("grp", &self.grp.as_ref().map(|g| g.index))
            .field("cursor", &self.cursor)
            .finish()
    }
}
