//! Per-volume state and inodes.
//!
//! A [`Superblock`] bundles everything the read path shares across requests
//! on one image: geometry, the block device, the workgroup registry, the
//! managed compressed-page cache, the background work queue, configuration
//! and counters.  It is always handled as `Arc<Superblock>` because I/O
//! completions and background passes outlive the request that started them.

use std::sync::Arc;

use tracing::debug;

use crate::blockdev::{self, BlockDevice};
use crate::config::{Config, BLOCK_SIZE, CLUSTER_MAX_PAGES, PAGE_SHIFT};
use crate::error::{Result, ZipError};
use crate::pagecache::{MemPageCache, PageCache};
use crate::stats::Stats;
use crate::workqueue::WorkQueue;
use crate::zip::registry::Registry;

/// Size of an on-disk inode slot; nids count these from `meta_blkaddr`.
pub const INODE_SLOT_SIZE: u64 = 32;
/// Size of the compact on-disk inode.
pub const INODE_COMPACT_SIZE: u32 = 32;
/// Inline xattr body header, counted as the first xattr slot.
pub const XATTR_IBODY_HEADER_SIZE: u32 = 12;
pub const XATTR_ENTRY_SIZE: u32 = 4;

/// Data layout stored in bits 1-3 of the inode format word.
pub const INODE_LAYOUT_COMPRESSED: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Block where inode slots start.
    pub meta_blkaddr: u64,
    /// log2 of the cluster size in bytes.
    pub cluster_bits: u32,
}

impl Geometry {
    pub fn new(meta_blkaddr: u64, cluster_bits: u32) -> Result<Self> {
        if cluster_bits < PAGE_SHIFT || cluster_bits - PAGE_SHIFT > CLUSTER_MAX_PAGES.ilog2() {
            return Err(ZipError::corrupt(0, 0, "unsupported cluster size"));
        }
        Ok(Geometry { meta_blkaddr, cluster_bits })
    }

    pub fn cluster_size(&self) -> u64 {
        1 << self.cluster_bits
    }

    pub fn cluster_pages(&self) -> usize {
        1 << (self.cluster_bits - PAGE_SHIFT)
    }
}

/// The fields of an inode the read path needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inode {
    pub nid: u64,
    pub size: u64,
    pub inode_isize: u32,
    pub xattr_isize: u32,
}

impl Inode {
    /// Decode a compact inode:
    ///
    /// ```text
    /// 0 format u16   2 xattr_icount u16   4 mode u16   6 nlink u16
    /// 8 size u32    12 reserved u32      16 raw u32   20 ino u32
    /// 24 uid u16    26 gid u16           28 checksum u32
    /// ```
    pub fn decode(nid: u64, raw: &[u8]) -> Result<Self> {
        let raw = raw
            .get(..INODE_COMPACT_SIZE as usize)
            .ok_or_else(|| ZipError::corrupt(nid, 0, "truncated inode"))?;
        let format = u16::from_le_bytes([raw[0], raw[1]]);
        if format & 1 != 0 {
            return Err(ZipError::corrupt(nid, 0, "unsupported inode version"));
        }
        if (format >> 1) & 0x7 != INODE_LAYOUT_COMPRESSED {
            return Err(ZipError::corrupt(nid, 0, "inode is not compressed"));
        }
        let xattr_icount = u16::from_le_bytes([raw[2], raw[3]]) as u32;
        let size = u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]) as u64;
        Ok(Inode {
            nid,
            size,
            inode_isize: INODE_COMPACT_SIZE,
            xattr_isize: xattr_ibody_size(xattr_icount),
        })
    }

    /// Encode as a compact compressed-layout inode.
    pub fn encode(&self) -> [u8; INODE_COMPACT_SIZE as usize] {
        let mut out = [0u8; INODE_COMPACT_SIZE as usize];
        out[0..2].copy_from_slice(&(INODE_LAYOUT_COMPRESSED << 1).to_le_bytes());
        let icount = if self.xattr_isize == 0 {
            0
        } else {
            (self.xattr_isize - XATTR_IBODY_HEADER_SIZE) / XATTR_ENTRY_SIZE + 1
        };
        out[2..4].copy_from_slice(&(icount as u16).to_le_bytes());
        out[4..6].copy_from_slice(&0o100644u16.to_le_bytes());
        out[6..8].copy_from_slice(&1u16.to_le_bytes());
        out[8..12].copy_from_slice(&(self.size as u32).to_le_bytes());
        out[20..24].copy_from_slice(&(self.nid as u32).to_le_bytes());
        out
    }

    /// Number of pages covering the file.
    pub fn nr_pages(&self) -> u64 {
        self.size.div_ceil(BLOCK_SIZE as u64)
    }
}

pub fn xattr_ibody_size(icount: u32) -> u32 {
    if icount == 0 {
        0
    } else {
        XATTR_IBODY_HEADER_SIZE + (icount - 1) * XATTR_ENTRY_SIZE
    }
}

pub struct Superblock {
    pub geometry: Geometry,
    pub config: Config,
    pub device: Arc<dyn BlockDevice>,
    pub registry: Registry,
    pub managed: Arc<dyn PageCache>,
    pub workqueue: WorkQueue,
    pub stats: Arc<Stats>,
}

impl Superblock {
    pub fn new(device: Arc<dyn BlockDevice>, geometry: Geometry, config: Config) -> Result<Arc<Self>> {
        Self::with_cache(device, geometry, config, Arc::new(MemPageCache::new()))
    }

    /// Like [`new`](Self::new) with a caller-supplied managed cache.
    pub fn with_cache(
        device: Arc<dyn BlockDevice>,
        geometry: Geometry,
        config: Config,
        managed: Arc<dyn PageCache>,
    ) -> Result<Arc<Self>> {
        let workers = config.nr_workers.max(1);
        let workqueue = WorkQueue::new(workers, workers * 4)?;
        let stats = Arc::new(Stats::default());
        debug!(
            meta_blkaddr = geometry.meta_blkaddr,
            cluster_bits = geometry.cluster_bits,
            workers,
            cache = ?config.cache_strategy,
            "superblock ready"
        );
        Ok(Arc::new(Superblock {
            geometry,
            config,
            device,
            registry: Registry::new(Arc::clone(&stats)),
            managed,
            workqueue,
            stats,
        }))
    }

    /// Byte address of inode `nid`.
    pub fn iloc(&self, nid: u64) -> u64 {
        self.geometry.meta_blkaddr * BLOCK_SIZE as u64 + nid * INODE_SLOT_SIZE
    }

    pub fn cluster_pages(&self) -> usize {
        self.geometry.cluster_pages()
    }

    /// Load inode `nid` from the device.
    pub fn read_inode(&self, nid: u64) -> Result<Inode> {
        let iloc = self.iloc(nid);
        let blkaddr = iloc / BLOCK_SIZE as u64;
        let blkoff = (iloc % BLOCK_SIZE as u64) as usize;
        let page = blockdev::read_block(self.device.as_ref(), blkaddr)?;
        Stats::bump(&self.stats.meta_reads);
        let data = page.read();
        Inode::decode(nid, &data[blkoff..])
    }
}

impl std::fmt::Debug for Superblock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Superblock")
            .field("geometry", &self.geometry)
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}
