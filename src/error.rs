//! Error taxonomy of the decompression engine.
//!
//! Errors are attached to individual pages (the page `ERROR` flag) wherever a
//! partial result is still useful; a `ZipError` value only travels up the call
//! chain of the single resolution or setup step that failed.

use thiserror::Error;

use crate::codec::DecompressError;

#[derive(Debug, Error)]
pub enum ZipError {
    /// Invalid cluster type, bad back-reference delta, logical cluster 0 used
    /// as a continuation target, or an over-split page.
    #[error("corrupted compression metadata of nid {nid} at lcn {lcn}: {reason}")]
    CorruptMetadata {
        nid: u64,
        lcn: u64,
        reason: &'static str,
    },
    /// Page or workgroup allocation failed after every fallback.
    #[error("out of memory while allocating {0}")]
    ResourceExhausted(&'static str),
    /// A reclaim or migration actor holds the workgroup frozen; retry later.
    #[error("workgroup is busy")]
    Busy,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("decompression failed: {0:?}")]
    Codec(DecompressError),
    /// The pagevec has no free entry for a non-exclusive page; the caller
    /// must supply a carrier page and retry.
    #[error("pagevec is full")]
    PagevecFull,
    /// The page completed with its error flag set: a raw read or the
    /// decompression of one of its workgroups failed.
    #[error("read of page {index} of nid {nid} failed")]
    PageFailed { nid: u64, index: u64 },
    /// A workgroup handle outlived the workgroup it named.
    #[error("stale workgroup handle")]
    StaleHandle,
}

impl ZipError {
    pub fn corrupt(nid: u64, lcn: u64, reason: &'static str) -> Self {
        ZipError::CorruptMetadata { nid, lcn, reason }
    }

    /// Fill in the inode of a metadata error raised below the resolver.
    pub fn with_nid(self, nid: u64) -> Self {
        match self {
            ZipError::CorruptMetadata { lcn, reason, .. } => ZipError::CorruptMetadata { nid, lcn, reason },
            other => other,
        }
    }

    /// `Busy` is a back-off signal rather than a failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, ZipError::Busy | ZipError::PagevecFull)
    }
}

impl From<DecompressError> for ZipError {
    fn from(e: DecompressError) -> Self {
        ZipError::Codec(e)
    }
}

pub type Result<T> = std::result::Result<T, ZipError>;
