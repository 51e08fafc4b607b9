// Block compression for the write and read paths.

use crate::common::exception::ZioError;
use crate::storage::blkptr::CompressKind;

const MARKER: u8 = 0xFF;
const ESCAPE: u8 = 0x00;
const ZERO_BLOCK: u8 = 0xFE;
// Run lengths must never collide with the escape or zero-block bytes.
const MAX_RUN: usize = 253;
const MIN_RUN: usize = 4;

/// Result of trying to compress one block.
#[derive(Debug, PartialEq, Eq)]
pub enum Compressed {
    /// The block is entirely zero and needs no storage at all.
    Zero,
    /// Compressed payload, strictly smaller than the input.
    Data(Vec<u8>),
    /// Compression would not save enough; store the block as is.
    Incompressible,
}

/// Compresses `data`, requiring at least a one-eighth saving to be worth it.
/// All-zero blocks are only detected when compression is enabled.
pub fn compress(kind: CompressKind, data: &[u8]) -> Compressed {
    match kind {
        CompressKind::Off => Compressed::Incompressible,
        CompressKind::Rle => {
            if data.iter().all(|&b| b == 0) {
                return Compressed::Zero;
            }
            let limit = data.len() - (data.len() >> 3);
            let out = rle_encode(data);
            if out.len() < limit {
                Compressed::Data(out)
            } else {
                Compressed::Incompressible
            }
        }
    }
}

fn rle_encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() / 2);
    let mut i = 0;

    while i < data.len() {
        let byte = data[i];
        let max_run = (data.len() - i).min(MAX_RUN);
        let mut count = 1;
        while count < max_run && data[i + count] == byte {
            count += 1;
        }

        if count >= MIN_RUN {
            out.extend_from_slice(&[MARKER, count as u8, byte]);
        } else {
            for _ in 0..count {
                if byte == MARKER {
                    out.extend_from_slice(&[MARKER, ESCAPE]);
                } else {
                    out.push(byte);
                }
            }
        }
        i += count;
    }

    out
}

/// Decompresses `src` into exactly `dst.len()` bytes.
pub fn decompress(kind: CompressKind, src: &[u8], dst: &mut [u8]) -> Result<(), ZioError> {
    match kind {
        CompressKind::Off => {
            if src.len() < dst.len() {
                return Err(ZioError::Corrupt("short uncompressed block".to_string()));
            }
            dst.copy_from_slice(&src[..dst.len()]);
            Ok(())
        }
        CompressKind::Rle => rle_decode(src, dst),
    }
}

fn rle_decode(src: &[u8], dst: &mut [u8]) -> Result<(), ZioError> {
    let corrupt = || ZioError::Corrupt("malformed run-length stream".to_string());
    let mut i = 0;
    let mut o = 0;

    while i < src.len() && o < dst.len() {
        if src[i] != MARKER {
            dst[o] = src[i];
            o += 1;
            i += 1;
            continue;
        }
        match src.get(i + 1).copied() {
            Some(ESCAPE) => {
                dst[o] = MARKER;
                o += 1;
                i += 2;
            }
            Some(ZERO_BLOCK) | None => return Err(corrupt()),
            Some(count) => {
                let byte = *src.get(i + 2).ok_or_else(corrupt)?;
                let count = count as usize;
                if o + count > dst.len() {
                    return Err(corrupt());
                }
                dst[o..o + count].fill(byte);
                o += count;
                i += 3;
            }
        }
    }

    if o != dst.len() {
        return Err(corrupt());
    }
    Ok(())
}
