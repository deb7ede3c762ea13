//! Fixture images: one compressed file laid out as a list of extents.
//!
//! Block layout: inode slots and the file's index records first (from
//! block 0), then one physical cluster per extent.

use zvle::config::BLOCK_SIZE;
use zvle::sb::Inode;
use zvle::vle::index::{record_offset, IndexRecord};

use super::lz4enc;

pub const NID: u64 = 1;
pub const META_BLKADDR: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Lz4,
    Plain,
}

#[derive(Debug, Clone, Copy)]
pub struct ExtentSpec {
    pub len: usize,
    pub kind: Kind,
}

impl ExtentSpec {
    pub fn lz4(len: usize) -> Self {
        ExtentSpec { len, kind: Kind::Lz4 }
    }

    pub fn plain(len: usize) -> Self {
        ExtentSpec { len, kind: Kind::Plain }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Extent {
    pub la: u64,
    pub len: usize,
    pub pblk: u64,
    pub kind: Kind,
}

#[derive(Debug, Clone)]
pub struct Image {
    pub bytes: Vec<u8>,
    pub content: Vec<u8>,
    pub extents: Vec<Extent>,
    pub cluster_bits: u32,
    pub inode: Inode,
}

/// Compressible text: numbered lines, `len` bytes.
pub fn text(len: usize, seed: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(len + 64);
    let mut i = seed;
    while out.len() < len {
        out.extend_from_slice(format!("{i:08} the quick brown fox jumps over the lazy dog\n").as_bytes());
        i += 1;
    }
    out.truncate(len);
    out
}

/// `n` extents of `len` compressible bytes each.
pub fn uniform(n: usize, len: usize) -> Vec<ExtentSpec> {
    vec![ExtentSpec::lz4(len); n]
}

pub fn build(content: &[u8], specs: &[ExtentSpec], cluster_bits: u32) -> Image {
    let clustersize = 1usize << cluster_bits;
    let clusterpages = clustersize / BLOCK_SIZE;
    let size = content.len();
    assert_eq!(specs.iter().map(|s| s.len).sum::<usize>(), size, "extents must cover the file");

    let inode = Inode { nid: NID, size: size as u64, inode_isize: 32, xattr_isize: 0 };
    let iloc = META_BLKADDR * BLOCK_SIZE as u64 + NID * 32;
    let nr_lclusters = size.div_ceil(clustersize) as u64;
    let meta_end = record_offset(iloc, inode.inode_isize, inode.xattr_isize, nr_lclusters);
    let data_start = meta_end.div_ceil(BLOCK_SIZE as u64);

    let mut extents = Vec::new();
    let mut la = 0u64;
    for (k, spec) in specs.iter().enumerate() {
        if k + 1 < specs.len() {
            assert!(spec.len >= clustersize, "inner extents span at least one cluster");
        }
        extents.push(Extent { la, len: spec.len, pblk: data_start + (k * clusterpages) as u64, kind: spec.kind });
        la += spec.len as u64;
    }

    let total_blocks = data_start as usize + extents.len() * clusterpages;
    let mut bytes = vec![0u8; total_blocks * BLOCK_SIZE];
    bytes[iloc as usize..iloc as usize + 32].copy_from_slice(&inode.encode());

    let round_end = (nr_lclusters as usize) * clustersize;
    for (k, ext) in extents.iter().enumerate() {
        let start = ext.la as usize;
        let mut data = content[start..start + ext.len].to_vec();
        if k + 1 == extents.len() {
            // The last extent decodes through to the cluster boundary.
            data.resize(round_end - start, 0);
        }
        let stored = match ext.kind {
            Kind::Lz4 => lz4enc::compress(&data),
            Kind::Plain => data[..ext.len.min(clustersize)].to_vec(),
        };
        assert!(stored.len() <= clustersize, "extent {k} does not fit its physical cluster");
        let off = ext.pblk as usize * BLOCK_SIZE;
        bytes[off..off + stored.len()].copy_from_slice(&stored);
    }

    let mut image = Image { bytes, content: content.to_vec(), extents, cluster_bits, inode };
    for lcn in 0..nr_lclusters {
        let rec = image.natural_record(lcn);
        image.set_record(lcn, rec);
    }
    image
}

impl Image {
    pub fn clustersize(&self) -> u64 {
        1 << self.cluster_bits
    }

    fn head_lcn(&self, ext: &Extent) -> u64 {
        ext.la >> self.cluster_bits
    }

    /// The record a well-formed image carries for `lcn`.
    pub fn natural_record(&self, lcn: u64) -> IndexRecord {
        if let Some(ext) = self.extents.iter().find(|e| self.head_lcn(e) == lcn) {
            let clusterofs = (ext.la & (self.clustersize() - 1)) as u16;
            return match ext.kind {
                Kind::Lz4 => IndexRecord::head(clusterofs, ext.pblk as u32),
                Kind::Plain => IndexRecord::plain(clusterofs, ext.pblk as u32),
            };
        }
        let owner = self
            .extents
            .iter()
            .rev()
            .find(|e| self.head_lcn(e) < lcn)
            .expect("lcn 0 always holds a head");
        let next = self.extents.iter().map(|e| self.head_lcn(e)).find(|&h| h > lcn).unwrap_or(lcn);
        IndexRecord::nonhead((lcn - self.head_lcn(owner)) as u16, (next - lcn) as u16)
    }

    pub fn record_addr(&self, lcn: u64) -> usize {
        let iloc = META_BLKADDR * BLOCK_SIZE as u64 + self.inode.nid * 32;
        record_offset(iloc, self.inode.inode_isize, self.inode.xattr_isize, lcn) as usize
    }

    pub fn set_record(&mut self, lcn: u64, rec: IndexRecord) {
        let at = self.record_addr(lcn);
        self.bytes[at..at + 8].copy_from_slice(&rec.encode());
    }

    /// Extent holding logical byte `offset`.
    pub fn extent_at(&self, offset: u64) -> &Extent {
        self.extents
            .iter()
            .find(|e| e.la <= offset && offset < e.la + e.len as u64)
            .expect("offset inside the file")
    }

    pub fn nr_pages(&self) -> u64 {
        self.inode.nr_pages()
    }

    /// Expected contents of file page `index`, zero-filled past EOF.
    pub fn page(&self, index: u64) -> Vec<u8> {
        let mut out = vec![0u8; BLOCK_SIZE];
        let start = (index as usize * BLOCK_SIZE).min(self.content.len());
        let end = (start + BLOCK_SIZE).min(self.content.len());
        out[..end - start].copy_from_slice(&self.content[start..end]);
        out
    }
}
