//! LZ4 block decoder with partial-output support.
//!
//! Compressed clusters are zero-padded to the block size and a workgroup may
//! only need a prefix of the decoded cluster, so decoding stops as soon as
//! `target` output bytes exist or the input runs out after a literal run.
//!
//! # Security boundary
//!
//! The input comes straight from disk.  Malformed or truncated input must
//! return `Err(DecompressError::MalformedInput)` and never panic: every read
//! goes through a bounds-checked slice access and every length is added with
//! overflow checking.

use super::Codec;

pub const MINMATCH: usize = 4;
pub const ML_BITS: u32 = 4;
pub const ML_MASK: usize = (1 << ML_BITS) - 1;
pub const RUN_MASK: usize = (1 << (8 - ML_BITS)) - 1;

/// Errors returned by LZ4 block decompression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecompressError {
    /// The compressed data is malformed or truncated, or the requested output
    /// does not fit the destination.
    MalformedInput,
}

impl std::fmt::Display for DecompressError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("malformed LZ4 input")
    }
}

impl std::error::Error for DecompressError {}

#[inline(always)]
fn output_error<T>() -> Result<T, DecompressError> {
    Err(DecompressError::MalformedInput)
}

/// Read the 255-continued length extension starting at `*ip`.
#[inline]
fn read_variable_length(src: &[u8], ip: &mut usize) -> Result<usize, DecompressError> {
    let mut length = 0usize;
    loop {
        let s = match src.get(*ip) {
            Some(&b) => b as usize,
            None => return output_error(),
        };
        *ip += 1;
        length = match length.checked_add(s) {
            Some(l) => l,
            None => return output_error(),
        };
        if s != 255 {
            return Ok(length);
        }
    }
}

/// Decode an LZ4 block from `src` into `dst`, stopping once `target` bytes
/// have been produced.
///
/// Returns the number of bytes written.  This is `target` for a complete
/// decode and less when the input ends early on a literal run.  Match
/// back-references may only point into already-produced output.
pub fn decompress_partial(src: &[u8], dst: &mut [u8], target: usize) -> Result<usize, DecompressError> {
    if target > dst.len() {
        return output_error();
    }
    let mut ip = 0usize;
    let mut op = 0usize;

    while op < target {
        let token = match src.get(ip) {
            Some(&t) => t,
            None => break,
        };
        ip += 1;

        // Literals.
        let mut lit_length = (token >> ML_BITS) as usize;
        if lit_length == RUN_MASK {
            lit_length = match lit_length.checked_add(read_variable_length(src, &mut ip)?) {
                Some(l) => l,
                None => return output_error(),
            };
        }
        let n = lit_length.min(src.len() - ip).min(target - op);
        dst[op..op + n].copy_from_slice(&src[ip..ip + n]);
        ip += n;
        op += n;
        if op == target || ip + 2 > src.len() {
            break;
        }

        // Match.
        let offset = u16::from_le_bytes([src[ip], src[ip + 1]]) as usize;
        ip += 2;
        if offset == 0 || offset > op {
            return output_error();
        }
        let mut match_length = (token as usize) & ML_MASK;
        if match_length == ML_MASK {
            match_length = match match_length.checked_add(read_variable_length(src, &mut ip)?) {
                Some(l) => l,
                None => return output_error(),
            };
        }
        let match_length = (match_length + MINMATCH).min(target - op);
        let from = op - offset;
        if offset >= match_length {
            dst.copy_within(from..from + match_length, op);
        } else {
            // Overlapping copy repeats the last `offset` bytes.
            for i in 0..match_length {
                dst[op + i] = dst[from + i];
            }
        }
        op += match_length;
    }
    Ok(op)
}

/// The LZ4 codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct Lz4;

impl Codec for Lz4 {
    fn decompress(&self, src: &[u8], dst: &mut [u8], target: usize) -> Result<usize, DecompressError> {
        decompress_partial(src, dst, target)
    }

    fn name(&self) -> &'static str {
        "lz4"
    }
}
