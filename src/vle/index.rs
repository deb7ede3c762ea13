//! On-disk VLE index records.
//!
//! Each logical cluster of a compressed file has one fixed-size, little-endian
//! record:
//!
//! ```text
//! offset  size  field
//!      0     2  advise      bits 0-1 cluster type, bits 4-7 extension data
//!      2     2  clusterofs  logical start within the cluster (HEAD / PLAIN)
//!      4     4  blkaddr     physical block (HEAD / PLAIN)
//!      4   2x2  delta[2]    back-reference hops (NONHEAD)
//! ```
//!
//! The record array follows the inode, its inline xattrs (both rounded up to
//! 8 bytes) and a 16-byte extent header.

use crate::config::BLOCK_SIZE;

pub const RECORD_SIZE: usize = 8;
pub const EXTENT_HEADER_SIZE: usize = 16;
pub const EXTENT_ALIGN: u64 = 8;

pub const ADVISE_TYPE_BITS: u16 = 2;
pub const ADVISE_TYPE_MASK: u16 = (1 << ADVISE_TYPE_BITS) - 1;
pub const ADVISE_EXT_SHIFT: u16 = 4;
pub const ADVISE_EXT_MASK: u16 = 0xF;

/// Raw cluster type tag of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterType {
    Head,
    NonHead,
    Plain,
    /// Type 3: the vendor compatibility extension.  Only meaningful when the
    /// volume enables it; otherwise a corruption.
    HuaweiCompat,
}

impl ClusterType {
    pub fn from_advise(advise: u16) -> Self {
        match advise & ADVISE_TYPE_MASK {
            0 => ClusterType::Head,
            1 => ClusterType::NonHead,
            2 => ClusterType::Plain,
            _ => ClusterType::HuaweiCompat,
        }
    }

    pub fn bits(self) -> u16 {
        match self {
            ClusterType::Head => 0,
            ClusterType::NonHead => 1,
            ClusterType::Plain => 2,
            ClusterType::HuaweiCompat => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRecord {
    pub advise: u16,
    pub clusterofs: u16,
    /// `blkaddr`, or `delta[0] | delta[1] << 16`.
    pub payload: u32,
}

impl IndexRecord {
    pub fn head(clusterofs: u16, blkaddr: u32) -> Self {
        IndexRecord { advise: ClusterType::Head.bits(), clusterofs, payload: blkaddr }
    }

    pub fn plain(clusterofs: u16, blkaddr: u32) -> Self {
        IndexRecord { advise: ClusterType::Plain.bits(), clusterofs, payload: blkaddr }
    }

    pub fn nonhead(delta0: u16, delta1: u16) -> Self {
        IndexRecord {
            advise: ClusterType::NonHead.bits(),
            clusterofs: 0,
            payload: delta0 as u32 | (delta1 as u32) << 16,
        }
    }

    /// A compatibility record.  `ext` lands in advise bits 4-7.
    pub fn huawei_compat(clusterofs: u16, blkaddr: u32, ext: u16) -> Self {
        IndexRecord {
            advise: ClusterType::HuaweiCompat.bits() | (ext & ADVISE_EXT_MASK) << ADVISE_EXT_SHIFT,
            clusterofs,
            payload: blkaddr,
        }
    }

    pub fn decode(raw: &[u8]) -> Option<Self> {
        let raw: &[u8; RECORD_SIZE] = raw.get(..RECORD_SIZE)?.try_into().ok()?;
        Some(IndexRecord {
            advise: u16::from_le_bytes([raw[0], raw[1]]),
            clusterofs: u16::from_le_bytes([raw[2], raw[3]]),
            payload: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
        })
    }

    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        out[0..2].copy_from_slice(&self.advise.to_le_bytes());
        out[2..4].copy_from_slice(&self.clusterofs.to_le_bytes());
        out[4..8].copy_from_slice(&self.payload.to_le_bytes());
        out
    }

    pub fn cluster_type(&self) -> ClusterType {
        ClusterType::from_advise(self.advise)
    }

    pub fn blkaddr(&self) -> u32 {
        self.payload
    }

    pub fn delta(&self, i: usize) -> u16 {
        (self.payload >> (16 * (i & 1))) as u16
    }

    /// Clusters a compatibility record points back over: whole clusters in
    /// `clusterofs` plus the advise extension bits as the high nibble.
    pub fn previous_clusters(&self, clustersize: u32) -> u32 {
        (self.clusterofs as u32 / clustersize)
            | (((self.advise >> ADVISE_EXT_SHIFT) & ADVISE_EXT_MASK) as u32) << 4
    }
}

/// Byte offset of a file's record for logical cluster `lcn` in the image.
pub fn record_offset(iloc: u64, inode_isize: u32, xattr_isize: u32, lcn: u64) -> u64 {
    let base = (inode_isize as u64 + xattr_isize as u64).next_multiple_of(EXTENT_ALIGN);
    iloc + base + EXTENT_HEADER_SIZE as u64 + lcn * RECORD_SIZE as u64
}

/// `(block, offset within block)` of a byte address.
pub fn blk_split(addr: u64) -> (u64, usize) {
    (addr / BLOCK_SIZE as u64, (addr % BLOCK_SIZE as u64) as usize)
}
