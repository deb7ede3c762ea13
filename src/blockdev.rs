//! Raw block I/O collaborator.
//!
//! The scheduler submits [`Bio`]s (a run of contiguous blocks, one page per
//! block) and is told about completion through the bio's `end_io` callback,
//! which may run on the submitting thread or on any other thread.
//!
//! [`MemDevice`] serves an in-memory image and can complete requests inline,
//! on a completion thread, or only when released by the caller, with per-block
//! fault injection.  [`FileDevice`] reads an image file with positional reads.

use std::collections::HashSet;
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, unbounded, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{trace, warn};

use crate::config::BLOCK_SIZE;
use crate::error::{Result, ZipError};
use crate::page::{Page, PageFrame};

pub type EndIo = Box<dyn FnOnce(Vec<Page>, io::Result<()>) + Send + 'static>;

/// One raw read request.
pub struct Bio {
    pub start_block: u64,
    pub pages: Vec<Page>,
    end_io: Option<EndIo>,
}

impl Bio {
    pub fn new(start_block: u64, end_io: EndIo) -> Self {
        Bio { start_block, pages: Vec::new(), end_io: Some(end_io) }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Block address one past the last page of this bio.
    pub fn end_block(&self) -> u64 {
        self.start_block + self.pages.len() as u64
    }

    pub fn add_page(&mut self, page: Page) {
        self.pages.push(page);
    }

    /// Run the completion callback.  Every bio is completed exactly once.
    pub fn complete(mut self, res: io::Result<()>) {
        let pages = std::mem::take(&mut self.pages);
        if let Some(end_io) = self.end_io.take() {
            end_io(pages, res);
        }
    }
}

impl std::fmt::Debug for Bio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bio")
            .field("start_block", &self.start_block)
            .field("pages", &self.pages.len())
            .finish()
    }
}

pub trait BlockDevice: Send + Sync {
    /// Start reading `bio`.  Completion is reported through the bio.
    fn submit(&self, bio: Bio);

    /// Device size in blocks.
    fn nr_blocks(&self) -> u64;
}

/// Synchronously read block `blkaddr` into a fresh page.
pub fn read_block(dev: &dyn BlockDevice, blkaddr: u64) -> Result<Page> {
    let page = PageFrame::alloc()?;
    let (tx, rx) = bounded::<io::Result<()>>(1);
    let mut bio = Bio::new(
        blkaddr,
        Box::new(move |_pages, res| {
            let _ = tx.send(res);
        }),
    );
    bio.add_page(Arc::clone(&page));
    dev.submit(bio);
    match rx.recv() {
        Ok(Ok(())) => Ok(page),
        Ok(Err(e)) => Err(ZipError::Io(e)),
        Err(_) => Err(ZipError::Io(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "block request dropped without completion",
        ))),
    }
}

/// Copy blocks `[start, start + pages.len())` of `image` into `pages`.
fn fill_from(image: &[u8], start: u64, pages: &[Page]) -> io::Result<()> {
    for (i, page) in pages.iter().enumerate() {
        let off = (start as usize + i) * BLOCK_SIZE;
        let block = image.get(off..off + BLOCK_SIZE).ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, format!("block {} beyond device", start as usize + i))
        })?;
        page.write().copy_from_slice(block);
    }
    Ok(())
}

/// When a [`MemDevice`] completes its requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Inside `submit`, on the submitting thread.
    Inline,
    /// On a dedicated completion thread.
    Threaded,
    /// Queued until [`MemDevice::release`] is called.  Requests starting
    /// below the [`gate_from`](MemDevice::gate_from) block complete inline.
    Gated,
}

struct MemInner {
    image: RwLock<Vec<u8>>,
    faulty: Mutex<HashSet<u64>>,
    gated: Mutex<Vec<Bio>>,
    gate_from: AtomicU64,
    requests: AtomicU64,
    log: Mutex<Vec<(u64, usize)>>,
}

impl MemInner {
    fn complete(&self, bio: Bio) {
        let res = {
            let faulty = self.faulty.lock();
            match (bio.start_block..bio.end_block()).find(|b| faulty.contains(b)) {
                Some(b) => Err(io::Error::new(io::ErrorKind::Other, format!("injected fault at block {b}"))),
                None => fill_from(&self.image.read(), bio.start_block, &bio.pages),
            }
        };
        if let Err(e) = &res {
            warn!(start = bio.start_block, len = bio.len(), "read failed: {}", e);
        }
        bio.complete(res);
    }
}

/// In-memory block device.
pub struct MemDevice {
    inner: Arc<MemInner>,
    mode: Completion,
    completer: Option<(Sender<Bio>, JoinHandle<()>)>,
}

impl MemDevice {
    pub fn new(image: Vec<u8>, mode: Completion) -> Self {
        let inner = Arc::new(MemInner {
            image: RwLock::new(image),
            faulty: Mutex::new(HashSet::new()),
            gated: Mutex::new(Vec::new()),
            gate_from: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            log: Mutex::new(Vec::new()),
        });
        let completer = (mode == Completion::Threaded).then(|| {
            let (tx, rx) = unbounded::<Bio>();
            let inner = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name("zvle-bio".into())
                .spawn(move || {
                    for bio in rx {
                        inner.complete(bio);
                    }
                })
                .map_err(|e| warn!("cannot start completion thread: {}", e))
                .ok();
            handle.map(|h| (tx, h))
        });
        MemDevice { inner, mode, completer: completer.flatten() }
    }

    /// Fail every request that touches `blkaddr`.
    pub fn inject_fault(&self, blkaddr: u64) {
        self.inner.faulty.lock().insert(blkaddr);
    }

    pub fn clear_faults(&self) {
        self.inner.faulty.lock().clear();
    }

    /// Overwrite the image starting at block `blkaddr`.
    pub fn write_blocks(&self, blkaddr: u64, data: &[u8]) {
        let mut image = self.inner.image.write();
        let off = blkaddr as usize * BLOCK_SIZE;
        if image.len() < off + data.len() {
            image.resize(off + data.len(), 0);
        }
        image[off..off + data.len()].copy_from_slice(data);
    }

    /// Number of requests submitted so far.
    pub fn requests(&self) -> u64 {
        self.inner.requests.load(Ordering::Acquire)
    }

    /// `(start_block, nr_pages)` of every submitted request, in order.
    pub fn request_log(&self) -> Vec<(u64, usize)> {
        self.inner.log.lock().clone()
    }

    /// Only hold back requests starting at or after `blkaddr`.
    pub fn gate_from(&self, blkaddr: u64) {
        self.inner.gate_from.store(blkaddr, Ordering::Release);
    }

    /// Requests held back by [`Completion::Gated`].
    pub fn gated(&self) -> usize {
        self.inner.gated.lock().len()
    }

    /// Complete every held-back request on the calling thread.
    pub fn release(&self) -> usize {
        let bios = std::mem::take(&mut *self.inner.gated.lock());
        let n = bios.len();
        for bio in bios {
            self.inner.complete(bio);
        }
        n
    }
}

impl BlockDevice for MemDevice {
    fn submit(&self, bio: Bio) {
        self.inner.requests.fetch_add(1, Ordering::AcqRel);
        self.inner.log.lock().push((bio.start_block, bio.len()));
        trace!(start = bio.start_block, len = bio.len(), "submit");
        match (self.mode, &self.completer) {
            (Completion::Gated, _) if bio.start_block >= self.inner.gate_from.load(Ordering::Acquire) => {
                self.inner.gated.lock().push(bio)
            }
            (Completion::Threaded, Some((tx, _))) => {
                if let Err(e) = tx.send(bio) {
                    self.inner.complete(e.into_inner());
                }
            }
            _ => self.inner.complete(bio),
        }
    }

    fn nr_blocks(&self) -> u64 {
        (self.inner.image.read().len() / BLOCK_SIZE) as u64
    }
}

impl Drop for MemDevice {
    fn drop(&mut self) {
        // Never leave a waiter hanging on a request nobody will complete.
        self.release();
        if let Some((tx, handle)) = self.completer.take() {
            drop(tx);
            let _ = handle.join();
        }
    }
}

/// Block device over an image file.  Requests complete inline.
pub struct FileDevice {
    file: File,
    nr_blocks: u64,
}

impl FileDevice {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let nr_blocks = file.metadata()?.len() / BLOCK_SIZE as u64;
        Ok(FileDevice { file, nr_blocks })
    }

    fn read_into(&self, start: u64, pages: &[Page]) -> io::Result<()> {
        for (i, page) in pages.iter().enumerate() {
            let blk = start + i as u64;
            if blk >= self.nr_blocks {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, format!("block {blk} beyond image")));
            }
            read_exact_at(&self.file, &mut page.write(), blk * BLOCK_SIZE as u64)?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset)? {
            0 => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short read")),
            n => {
                buf = &mut std::mem::take(&mut buf)[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

impl BlockDevice for FileDevice {
    fn submit(&self, bio: Bio) {
        let res = self.read_into(bio.start_block, &bio.pages);
        if let Err(e) = &res {
            warn!(start = bio.start_block, len = bio.len(), "read failed: {}", e);
        }
        bio.complete(res);
    }

    fn nr_blocks(&self) -> u64 {
        self.nr_blocks
    }
}
