//! Bounded background task queue.
//!
//! Asynchronous decompression passes run here.  Jobs execute on a
//! `rayon::ThreadPool`; a `crossbeam_channel::bounded` channel pre-filled with
//! tokens acts as a semaphore, so `enqueue` blocks once `queue_size + workers`
//! jobs are in flight instead of growing an unbounded backlog.

use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use rayon::ThreadPool;
use tracing::debug;

use crate::error::{Result, ZipError};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkQueue {
    pool: Arc<ThreadPool>,
    slot_tx: Sender<()>,
    slot_rx: Receiver<()>,
    /// Submitted-but-unfinished jobs plus a condvar for `flush`.
    pending: Arc<(Mutex<usize>, Condvar)>,
}

impl WorkQueue {
    /// `workers` threads, `queue_size` extra queued jobs.  Both must be >= 1.
    pub fn new(workers: usize, queue_size: usize) -> Result<Self> {
        if workers < 1 || queue_size < 1 {
            return Err(ZipError::ResourceExhausted("work queue"));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("zvle-unzip-{i}"))
            .build()
            .map_err(|_| ZipError::ResourceExhausted("work queue threads"))?;

        let capacity = queue_size + workers;
        let (slot_tx, slot_rx) = bounded(capacity);
        for _ in 0..capacity {
            slot_tx
                .send(())
                .map_err(|_| ZipError::ResourceExhausted("work queue slots"))?;
        }
        debug!(workers, capacity, "work queue started");

        Ok(WorkQueue {
            pool: Arc::new(pool),
            slot_tx,
            slot_rx,
            pending: Arc::new((Mutex::new(0), Condvar::new())),
        })
    }

    /// Queue `job`, blocking while the queue is full.
    ///
    /// Called from one of the queue's own workers, the job runs inline: a
    /// worker waiting for a slot only its peers can free could deadlock.
    pub fn enqueue<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.pool.current_thread_index().is_some() {
            job();
            return;
        }
        if self.slot_rx.recv().is_err() {
            // Every sender lives in `self`, so the channel cannot close.
            job();
            return;
        }
        *self.pending.0.lock() += 1;

        let job: Job = Box::new(job);
        let pending = Arc::clone(&self.pending);
        let slot_tx = self.slot_tx.clone();
        self.pool.spawn(move || {
            job();
            let (lock, cvar) = &*pending;
            let mut n = lock.lock();
            *n -= 1;
            if *n == 0 {
                cvar.notify_all();
            }
            drop(n);
            let _ = slot_tx.send(());
        });
    }

    /// Block until every queued job has finished.  The queue stays usable.
    pub fn flush(&self) {
        let (lock, cvar) = &*self.pending;
        let mut n = lock.lock();
        while *n > 0 {
            cvar.wait(&mut n);
        }
    }

    pub fn pending(&self) -> usize {
        *self.pending.0.lock()
    }

    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        // The last reference may be released by a job on one of our own
        // threads; flushing there would wait on itself.
        if self.pool.current_thread_index().is_none() {
            self.flush();
        }
    }
}
