//! Extent Resolver.
//!
//! Maps a logical byte offset of a compressed file to the logical extent
//! containing it and the physical cluster holding that extent's data.  An
//! extent starts at a HEAD (or PLAIN) record's `clusterofs` and runs until the
//! next one; NONHEAD records only point back at their extent's first cluster.
//!
//! The resolver keeps the last metadata block it read, so walking a chain of
//! back-references inside one block costs a single read.

use tracing::{debug, error, trace};

use crate::blockdev;
use crate::config::BLOCK_SIZE;
use crate::error::{Result, ZipError};
use crate::page::Page;
use crate::sb::{Inode, Superblock};
use crate::stats::Stats;
use crate::vle::index::{blk_split, record_offset, ClusterType, IndexRecord, RECORD_SIZE};

pub const MAP_MAPPED: u32 = 1 << 0;
pub const MAP_ZIPPED: u32 = 1 << 1;

/// One resolved extent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapBlocks {
    /// Logical start of the extent.
    pub m_la: u64,
    /// Bytes of the extent from `m_la` to the end of the resolved cluster.
    pub m_llen: u64,
    /// Physical byte address of the cluster.
    pub m_pa: u64,
    /// Physical cluster length in bytes.
    pub m_plen: u64,
    pub m_flags: u32,
}

impl MapBlocks {
    pub fn is_mapped(&self) -> bool {
        self.m_flags & MAP_MAPPED != 0
    }

    pub fn is_zipped(&self) -> bool {
        self.m_flags & MAP_ZIPPED != 0
    }

    /// Exclusive logical end.
    pub fn end(&self) -> u64 {
        self.m_la + self.m_llen
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.m_la <= offset && offset < self.end()
    }
}

pub struct Resolver<'a> {
    sb: &'a Superblock,
    inode: &'a Inode,
    /// `(block address, page)` of the last metadata block read.
    mpage: Option<(u64, Page)>,
}

impl<'a> Resolver<'a> {
    pub fn new(sb: &'a Superblock, inode: &'a Inode) -> Self {
        Resolver { sb, inode, mpage: None }
    }

    pub fn inode(&self) -> &Inode {
        self.inode
    }

    fn clusterbits(&self) -> u32 {
        self.sb.geometry.cluster_bits
    }

    fn corrupt(&self, lcn: u64, reason: &'static str) -> ZipError {
        error!(nid = self.inode.nid, lcn, "{}", reason);
        ZipError::corrupt(self.inode.nid, lcn, reason)
    }

    /// Read the index record of logical cluster `lcn`, reusing the cached
    /// metadata block when it holds the record.
    fn record(&mut self, lcn: u64) -> Result<IndexRecord> {
        let addr = record_offset(self.sb.iloc(self.inode.nid), self.inode.inode_isize, self.inode.xattr_isize, lcn);
        let (mblk, blkoff) = blk_split(addr);
        let cached = match &self.mpage {
            Some((blk, page)) if *blk == mblk => Some(Page::clone(page)),
            _ => None,
        };
        let page = match cached {
            Some(page) => page,
            None => {
                let page = blockdev::read_block(self.sb.device.as_ref(), mblk)?;
                Stats::bump(&self.sb.stats.meta_reads);
                self.mpage = Some((mblk, Page::clone(&page)));
                page
            }
        };
        trace!(lcn, mblk, blkoff, "index record");
        let data = page.read();
        IndexRecord::decode(&data[blkoff..blkoff + RECORD_SIZE])
            .ok_or_else(|| self.corrupt(lcn, "truncated index record"))
    }

    /// Logical start of the cluster as recorded by `rec`.
    fn clusterofs(&self, rec: &IndexRecord, lcn: u64) -> Result<u32> {
        let clustersize = 1u32 << self.clusterbits();
        match rec.cluster_type() {
            ClusterType::NonHead => Ok(clustersize),
            ClusterType::HuaweiCompat if !self.sb.config.huawei_compat => {
                Err(self.corrupt(lcn, "unknown cluster type"))
            }
            ClusterType::HuaweiCompat if rec.previous_clusters(clustersize) != 0 => Ok(clustersize),
            _ => Ok(rec.clusterofs as u32),
        }
    }

    /// Clusters `rec` reaches back over.  With the compat extension enabled
    /// PLAIN records carry the count just like compat records do.
    fn compat_back(&self, rec: &IndexRecord) -> u32 {
        let clustersize = 1u32 << self.clusterbits();
        match rec.cluster_type() {
            ClusterType::Plain | ClusterType::HuaweiCompat if self.sb.config.huawei_compat => {
                rec.previous_clusters(clustersize)
            }
            _ => 0,
        }
    }

    /// Follow NONHEAD back-references from `lcn` to the record that starts
    /// the extent.  Returns the extent's logical start and physical block.
    fn logical_extent_head(&mut self, mut lcn: u64, flags: &mut u32) -> Result<(u64, u32)> {
        let clusterbits = self.clusterbits();
        let clustersize = 1u32 << clusterbits;
        loop {
            let rec = self.record(lcn)?;
            match rec.cluster_type() {
                ClusterType::NonHead => {
                    let delta0 = rec.delta(0) as u64;
                    if delta0 == 0 || delta0 > lcn {
                        return Err(self.corrupt(lcn, "invalid NONHEAD delta"));
                    }
                    lcn -= delta0;
                }
                ClusterType::HuaweiCompat if !self.sb.config.huawei_compat => {
                    return Err(self.corrupt(lcn, "unknown cluster type"));
                }
                ty => {
                    if ty == ClusterType::Plain {
                        *flags ^= MAP_ZIPPED;
                    }
                    let head_lcn = match lcn.checked_sub(self.compat_back(&rec) as u64) {
                        Some(l) => l,
                        None => return Err(self.corrupt(lcn, "compat back-reference before cluster 0")),
                    };
                    let ofs = (head_lcn << clusterbits) + (rec.clusterofs as u64 & (clustersize as u64 - 1));
                    return Ok((ofs, rec.blkaddr()));
                }
            }
        }
    }

    /// Resolve the extent containing logical byte `offset`.
    ///
    /// At or beyond end-of-file the result is unmapped: `m_la` is clipped to
    /// the file size and no flags are set.
    pub fn resolve(&mut self, offset: u64) -> Result<MapBlocks> {
        let size = self.inode.size;
        let mut map = MapBlocks { m_la: offset, ..MapBlocks::default() };
        if offset >= size {
            map.m_llen = offset + 1 - size;
            map.m_la = size;
            debug!(nid = self.inode.nid, offset, "unmapped beyond EOF");
            return Ok(map);
        }

        let clusterbits = self.clusterbits();
        let clustersize = 1u64 << clusterbits;
        let mut ofs = offset;
        let mut lcn = ofs >> clusterbits;
        let ofs_rem = (ofs & (clustersize - 1)) as u32;

        let rec = self.record(lcn)?;
        let logical_cluster_ofs = self.clusterofs(&rec, lcn)?;

        map.m_flags |= MAP_ZIPPED;
        let mut end = (lcn + 1) * clustersize;

        let pblk = match rec.cluster_type() {
            ClusterType::NonHead => {
                let (o, p) = self.logical_extent_head(lcn, &mut map.m_flags)?;
                ofs = o;
                p
            }
            ty => {
                if ty == ClusterType::Plain && ofs_rem >= logical_cluster_ofs {
                    map.m_flags ^= MAP_ZIPPED;
                }
                if self.compat_back(&rec) != 0 {
                    if lcn == 0 {
                        return Err(self.corrupt(lcn, "compat back-reference before cluster 0"));
                    }
                    end = (lcn + 1) * clustersize;
                    lcn -= 1;
                    let (o, p) = self.logical_extent_head(lcn, &mut map.m_flags)?;
                    ofs = o;
                    p
                } else if ofs_rem == logical_cluster_ofs {
                    rec.blkaddr()
                } else if ofs_rem > logical_cluster_ofs {
                    ofs = (lcn * clustersize) | logical_cluster_ofs as u64;
                    rec.blkaddr()
                } else {
                    if lcn == 0 {
                        return Err(self.corrupt(lcn, "invalid logical cluster 0"));
                    }
                    end = (lcn * clustersize) | logical_cluster_ofs as u64;
                    lcn -= 1;
                    let (o, p) = self.logical_extent_head(lcn, &mut map.m_flags)?;
                    ofs = o;
                    p
                }
            }
        };

        map.m_la = ofs;
        map.m_llen = end - ofs;
        map.m_plen = clustersize;
        map.m_pa = pblk as u64 * BLOCK_SIZE as u64;
        map.m_flags |= MAP_MAPPED;
        debug!(
            nid = self.inode.nid,
            m_la = map.m_la,
            m_llen = map.m_llen,
            m_pa = map.m_pa,
            zipped = map.is_zipped(),
            "map_blocks"
        );
        Ok(map)
    }
}
