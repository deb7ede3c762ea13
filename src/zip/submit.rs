//! Submission scheduler.
//!
//! A request submits the chain of workgroups it owns in one pass.  For every
//! compressed slot it either finds a page that is already uptodate (no I/O
//! needed) or secures a page to read into and appends it to the current raw
//! read request.  Requests are cut at physical discontinuities and at the
//! configured size limit.  Workgroups whose slots needed no I/O at all move
//! to a second chain and are decompressed immediately; the rest are
//! decompressed once every raw request has completed, either on the caller's
//! thread (foreground) or on the work queue (background).

use std::io;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace, warn};

use crate::blockdev::{Bio, EndIo};
use crate::error::Result;
use crate::page::{Mapping, Page};
use crate::pagepool::PagePool;
use crate::sb::Superblock;
use crate::stats::Stats;
use crate::zip::tagptr::{ChainLink, ChainPtr, SlotState};
use crate::zip::unzip::unzip_all;
use crate::zip::workgroup::Workgroup;

/// Bounded retries for a staging page before a slot is given up on.
const ALLOC_RETRIES: usize = 16;

/// Completion tracker of one submission.
pub(crate) struct UnzipIo {
    sb: Arc<Superblock>,
    head: ChainPtr,
    /// Raw requests still in flight.  Goes negative while requests complete
    /// before the submitter has counted them all in.
    pending: AtomicIsize,
    waiter: Option<(Mutex<()>, Condvar)>,
}

impl UnzipIo {
    fn new(sb: &Arc<Superblock>, foreground: bool) -> Self {
        UnzipIo {
            sb: Arc::clone(sb),
            head: ChainPtr::new(ChainLink::TailClosed),
            pending: AtomicIsize::new(0),
            waiter: foreground.then(|| (Mutex::new(()), Condvar::new())),
        }
    }

    /// Adjust the in-flight count.  Reaching zero wakes the foreground
    /// waiter or queues the background decompression pass.
    fn kickoff(self: &Arc<Self>, bios: isize) {
        match &self.waiter {
            Some((lock, cond)) => {
                let _guard = lock.lock();
                if self.pending.fetch_add(bios, Ordering::AcqRel) + bios == 0 {
                    cond.notify_all();
                }
            }
            None => {
                if self.pending.fetch_add(bios, Ordering::AcqRel) + bios == 0 {
                    let io = Arc::clone(self);
                    self.sb.workqueue.enqueue(move || {
                        let mut pool = PagePool::new();
                        unzip_all(&io.sb, io.head.load(), &mut pool);
                    });
                }
            }
        }
    }

    fn wait(&self) {
        if let Some((lock, cond)) = &self.waiter {
            let mut guard = lock.lock();
            while self.pending.load(Ordering::Acquire) != 0 {
                cond.wait(&mut guard);
            }
        }
    }
}

fn read_endio(io: &Arc<UnzipIo>) -> EndIo {
    let io = Arc::clone(io);
    Box::new(move |pages: Vec<Page>, res: io::Result<()>| {
        if let Err(e) = &res {
            warn!(pages = pages.len(), error = %e, "compressed read failed");
        }
        for page in &pages {
            let managed = page.is_managed();
            if res.is_err() {
                page.set_error();
            } else if managed {
                page.set_uptodate();
            }
            if managed {
                page.unlock();
            }
        }
        io.kickoff(-1);
    })
}

/// Insert a page destined for the managed cache.  If the cache refuses it,
/// the page is demoted to a staging page; it is still read into either way.
fn add_to_managed(sb: &Superblock, grp: &Workgroup, page: &Page, blkaddr: u64) {
    if sb.managed.insert(page, Mapping::Managed, blkaddr) {
        if let Some(handle) = grp.handle() {
            page.set_private(handle.to_raw() as usize);
        }
    } else {
        page.set_mapping(Mapping::Staging);
    }
}

/// Secure the page backing compressed slot `nr` of `grp`.  Returns `None`
/// when the slot already holds uptodate data and needs no I/O.
fn grab_page_for_submission(sb: &Superblock, grp: &Workgroup, nr: usize, pool: &mut PagePool) -> Result<Option<Page>> {
    let slot = &grp.compressed_pages[nr];
    let blkaddr = grp.index + nr as u64;

    loop {
        let mut tocache = false;
        if let SlotState::Page { page, justfound } = slot.xchg_locked() {
            match page.mapping() {
                Mapping::Preallocated => {
                    slot.store(Page::clone(&page), false);
                    add_to_managed(sb, grp, &page, blkaddr);
                    return Ok(Some(page));
                }
                Mapping::File(_) | Mapping::Staging => {
                    slot.store(Page::clone(&page), justfound);
                    return Ok(Some(page));
                }
                Mapping::Managed | Mapping::None => {
                    page.lock();
                    if page.is_managed() {
                        slot.store(Page::clone(&page), false);
                        if !page.has_private() {
                            if let Some(handle) = grp.handle() {
                                page.set_private(handle.to_raw() as usize);
                            }
                        }
                        if page.is_uptodate() {
                            page.unlock();
                            return Ok(None);
                        }
                        return Ok(Some(page));
                    }
                    // Truncated out of the managed cache; replace it.
                    page.unlock();
                    tocache = true;
                }
            }
        }

        let page = alloc_with_retry(pool)?;
        if let Err(page) = slot.cmpxchg_locked(Page::clone(&page)) {
            pool.put(page);
            std::hint::spin_loop();
            continue;
        }
        if tocache {
            add_to_managed(sb, grp, &page, blkaddr);
        }
        return Ok(Some(page));
    }
}

fn alloc_with_retry(pool: &mut PagePool) -> Result<Page> {
    let mut attempt = 0;
    loop {
        match pool.alloc_staging() {
            Ok(page) => return Ok(page),
            Err(e) if attempt + 1 >= ALLOC_RETRIES => return Err(e),
            Err(_) => {
                attempt += 1;
                std::thread::yield_now();
            }
        }
    }
}

/// Walk the chain at `owned_head`, closing it, and issue raw reads.
/// Returns the head of the no-I/O chain and the number of raw requests.
fn submit_all(sb: &Arc<Superblock>, owned_head: ChainLink, pool: &mut PagePool, io: &Arc<UnzipIo>) -> (ChainLink, usize) {
    let max_pages = sb.config.max_bio_pages;
    let mut owned = owned_head;
    let mut bio: Option<Bio> = None;
    let mut last_index: Option<u64> = None;
    let mut force_submit = false;
    let mut nr_bios = 0usize;
    let mut nr_pages = 0u64;

    let mut noio_head = ChainLink::TailClosed;
    let mut lst_io: Option<Arc<Workgroup>> = None;
    let mut lst_noio: Option<Arc<Workgroup>> = None;
    io.head.store(owned_head);

    loop {
        let Some(handle) = owned.handle() else {
            error!(link = ?owned, "chain ended without a tail marker");
            break;
        };
        let grp = match sb.registry.get(handle) {
            Ok(grp) => grp,
            Err(e) => {
                error!(?handle, error = %e, "owned workgroup vanished from the registry");
                break;
            }
        };

        // Close the chain at its tail; any other link is the successor.
        owned = grp.next.compare_exchange(ChainLink::Tail, ChainLink::TailClosed);
        let iogrp_next = if owned == ChainLink::Tail { ChainLink::TailClosed } else { owned };

        let first_index = grp.index;
        force_submit |= last_index.map_or(true, |last| first_index != last + 1);

        let mut noio = 0;
        for i in 0..grp.clusterpages() {
            let page = match grab_page_for_submission(sb, &grp, i, pool) {
                Ok(Some(page)) => page,
                Ok(None) => {
                    force_submit = true;
                    noio += 1;
                    continue;
                }
                Err(e) => {
                    // The slot stays LOCKED so no joiner can fill it with a
                    // page nobody reads; decompression reports the gap.
                    warn!(key = grp.index, slot = i, error = %e, "no page for compressed block");
                    force_submit = true;
                    noio += 1;
                    continue;
                }
            };

            let full = bio.as_ref().map_or(false, |b| b.len() >= max_pages);
            if force_submit || full {
                if let Some(b) = bio.take() {
                    trace!(start = b.start_block, pages = b.len(), "submitting raw read");
                    sb.device.submit(b);
                }
            }
            let b = bio.get_or_insert_with(|| {
                nr_bios += 1;
                Bio::new(first_index + i as u64, read_endio(io))
            });
            b.add_page(page);
            nr_pages += 1;
            force_submit = false;
            last_index = Some(first_index + i as u64);
        }

        if noio < grp.clusterpages() {
            lst_io = Some(grp);
        } else {
            match &lst_io {
                Some(prev) => prev.next.store(iogrp_next),
                None => io.head.store(iogrp_next),
            }
            match &lst_noio {
                Some(prev) => prev.next.store(ChainLink::Linked(handle)),
                None => noio_head = ChainLink::Linked(handle),
            }
            lst_noio = Some(grp);
        }

        if owned == ChainLink::Tail {
            break;
        }
    }

    if let Some(b) = bio.take() {
        trace!(start = b.start_block, pages = b.len(), "submitting raw read");
        sb.device.submit(b);
    }
    if let Some(last) = lst_noio {
        last.next.store(ChainLink::TailClosed);
    }

    Stats::add(&sb.stats.bios_submitted, nr_bios as u64);
    Stats::add(&sb.stats.pages_submitted, nr_pages);
    debug!(nr_bios, nr_pages, "chain submitted");
    (noio_head, nr_bios)
}

/// Submit the chain at `owned_head` and run its decompression.
///
/// With `force_fg` the caller's thread waits for every raw request and
/// decompresses; otherwise the I/O chain is handed to the work queue when its
/// last request completes.  The no-I/O chain always runs here.  Returns the
/// number of raw requests issued.
pub fn submit_and_unzip(sb: &Arc<Superblock>, owned_head: ChainLink, pool: &mut PagePool, force_fg: bool) -> usize {
    if matches!(owned_head, ChainLink::Tail | ChainLink::TailClosed | ChainLink::Nil) {
        return 0;
    }

    let io = Arc::new(UnzipIo::new(sb, force_fg));
    let (noio_head, nr_bios) = submit_all(sb, owned_head, pool, &io);
    if force_fg || nr_bios > 0 {
        io.kickoff(nr_bios as isize);
    }

    unzip_all(sb, noio_head, pool);

    if force_fg {
        io.wait();
        unzip_all(sb, io.head.load(), pool);
    }
    nr_bios
}
