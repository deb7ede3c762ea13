//! Codec collaborator.
//!
//! The decompression scheduler only needs one primitive: decode a contiguous
//! compressed buffer into a contiguous output buffer, producing at most
//! `target` bytes.  [`Codec`] names that seam; [`Lz4`] is the implementation
//! used for `Format::Lz4` workgroups.

pub mod lz4;

pub use lz4::{decompress_partial, DecompressError, Lz4};

pub trait Codec: Send + Sync {
    /// Decode `src` into `dst[..target]`.  Returns the number of bytes
    /// produced, which may fall short of `target` when `src` ends early.
    fn decompress(&self, src: &[u8], dst: &mut [u8], target: usize)
        -> Result<usize, DecompressError>;

    fn name(&self) -> &'static str;
}
