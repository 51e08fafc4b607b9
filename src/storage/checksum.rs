//! Checksum functions selected by the block pointer's checksum tag.

use xxhash_rust::xxh3::xxh3_128_with_seed;
use xxhash_rust::xxh64::xxh64;

use crate::common::config::Checksum;
use crate::common::exception::ZioError;
use crate::storage::blkptr::{ChecksumKind, GANG_TAIL_SIZE};

const EMBEDDED_MAGIC: u64 = 0x0210_da7a_b10c_7a11;

pub fn compute(kind: ChecksumKind, data: &[u8]) -> Checksum {
    match kind {
        ChecksumKind::Off => [0; 4],
        ChecksumKind::Xxh64 => [xxh64(data, 0), 0, 0, 0],
        ChecksumKind::Xxh3 | ChecksumKind::GangHeader | ChecksumKind::Label => strong(data, 0),
    }
}

fn strong(data: &[u8], seed: u64) -> Checksum {
    let lo = xxh3_128_with_seed(data, seed);
    let hi = xxh3_128_with_seed(data, seed ^ 0x9e37_79b9_7f4a_7c15);
    [lo as u64, (lo >> 64) as u64, hi as u64, (hi >> 64) as u64]
}

/// Checks `data` against the checksum recorded in a block pointer.
pub fn verify(kind: ChecksumKind, data: &[u8], expected: &Checksum) -> Result<(), ZioError> {
    if kind == ChecksumKind::Off {
        return Ok(());
    }
    if compute(kind, data) == *expected {
        Ok(())
    } else {
        Err(ZioError::ChecksumMismatch)
    }
}

/// Writes a self-checksum into the tail of `block`, seeded by `verifier` so a
/// block read back from the wrong location fails verification.
pub fn embed(block: &mut [u8], verifier: u64) -> Result<(), ZioError> {
    let Some(body_len) = block.len().checked_sub(GANG_TAIL_SIZE) else {
        return Err(ZioError::Corrupt("block too small for embedded checksum".to_string()));
    };
    let cksum = strong(&block[..body_len], verifier);
    let tail = &mut block[body_len..];
    tail[..8].copy_from_slice(&EMBEDDED_MAGIC.to_le_bytes());
    for (i, word) in cksum.iter().enumerate() {
        tail[8 + i * 8..16 + i * 8].copy_from_slice(&word.to_le_bytes());
    }
    Ok(())
}

pub fn verify_embedded(block: &[u8], verifier: u64) -> Result<(), ZioError> {
    let Some(body_len) = block.len().checked_sub(GANG_TAIL_SIZE) else {
        return Err(ZioError::ChecksumMismatch);
    };
    let tail = &block[body_len..];
    let word = |i: usize| {
        let mut b = [0u8; 8];
        b.copy_from_slice(&tail[i * 8..i * 8 + 8]);
        u64::from_le_bytes(b)
    };
    if word(0) != EMBEDDED_MAGIC {
        return Err(ZioError::ChecksumMismatch);
    }
    let stored = [word(1), word(2), word(3), word(4)];
    if strong(&block[..body_len], verifier) == stored {
        Ok(())
    } else {
        Err(ZioError::ChecksumMismatch)
    }
}
