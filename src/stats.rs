//! Diagnostic counters.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Stats {
    pub bios_submitted: AtomicU64,
    pub pages_submitted: AtomicU64,
    pub workgroups_created: AtomicU64,
    pub workgroups_freed: AtomicU64,
    pub unzip_passes: AtomicU64,
    pub unzip_errors: AtomicU64,
    pub meta_reads: AtomicU64,
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub bios_submitted: u64,
    pub pages_submitted: u64,
    pub workgroups_created: u64,
    pub workgroups_freed: u64,
    pub unzip_passes: u64,
    pub unzip_errors: u64,
    pub meta_reads: u64,
}

impl Stats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bios_submitted: self.bios_submitted.load(Ordering::Relaxed),
            pages_submitted: self.pages_submitted.load(Ordering::Relaxed),
            workgroups_created: self.workgroups_created.load(Ordering::Relaxed),
            workgroups_freed: self.workgroups_freed.load(Ordering::Relaxed),
            unzip_passes: self.unzip_passes.load(Ordering::Relaxed),
            unzip_errors: self.unzip_errors.load(Ordering::Relaxed),
            meta_reads: self.meta_reads.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "bios={} pages={} wg_created={} wg_freed={} unzip={} unzip_err={} meta_reads={}",
            self.bios_submitted,
            self.pages_submitted,
            self.workgroups_created,
            self.workgroups_freed,
            self.unzip_passes,
            self.unzip_errors,
            self.meta_reads
        )
    }
}
