//! Block pointers, bookmarks and gang headers.
//!
//! The pipeline treats a [`BlockPointer`] as mostly opaque metadata: it reads
//! and writes the sizes, the checksum/compression/encryption kind tags, the
//! data copies (DVAs) and their gang bit, and the birth epoch. Everything else
//! about on-disk layout belongs to the layers above.

use std::cmp::Ordering;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::common::config::{
    storage_bincode_config, Checksum, Txg, VdevId, SPA_GANGBLOCKSIZE, SPA_GBH_NBLKPTRS,
    SPA_MINBLOCKSHIFT,
};
use crate::common::exception::ZioError;
use crate::storage::allocator::AllocClass;

/// Checksum algorithm tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Encode, Decode, Serialize, Deserialize)]
pub enum ChecksumKind {
    Off,
    /// 64-bit xxhash, fast but too weak for dedup or nop-write.
    Xxh64,
    /// 128-bit xxh3 spread over four words; strong enough for dedup.
    #[default]
    Xxh3,
    /// Self-checksum embedded in the tail of a gang header.
    GangHeader,
    /// Self-checksum embedded in the tail of a physical label block.
    Label,
}

impl ChecksumKind {
    pub fn is_dedup_capable(self) -> bool {
        matches!(self, ChecksumKind::Xxh3)
    }

    /// Embedded checksums live inside the block rather than in the pointer.
    pub fn is_embedded(self) -> bool {
        matches!(self, ChecksumKind::GangHeader | ChecksumKind::Label)
    }
}

/// Compression algorithm tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Encode, Decode, Serialize, Deserialize)]
pub enum CompressKind {
    #[default]
    Off,
    /// Run-length encoding with an all-zero block shortcut.
    Rle,
}

/// Encryption algorithm tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Encode, Decode, Serialize, Deserialize)]
pub enum CryptKind {
    #[default]
    Off,
    Keystream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Encode, Decode, Serialize, Deserialize)]
pub enum ObjectType {
    #[default]
    Data,
    Metadata,
}

/// Per-block encryption parameters stored alongside the pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize)]
pub struct CryptParams {
    pub key_id: u64,
    pub iv: u64,
    pub mac: u64,
}

/// Device virtual address: one copy of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Encode, Decode, Serialize, Deserialize)]
pub struct Dva {
    pub vdev: VdevId,
    pub offset: u64,
    pub asize: u64,
    /// Set when this copy holds a gang header rather than data.
    pub gang: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Encode, Decode, Serialize, Deserialize)]
pub struct BlockPointer {
    pub dvas: Vec<Dva>,
    pub lsize: u64,
    pub psize: u64,
    pub checksum_kind: ChecksumKind,
    pub compress: CompressKind,
    pub crypt: CryptKind,
    pub object_type: ObjectType,
    pub level: u8,
    pub birth_txg: Txg,
    pub dedup: bool,
    pub checksum: Checksum,
    pub crypt_params: Option<CryptParams>,
}

impl BlockPointer {
    pub fn hole() -> Self {
        Self::default()
    }

    /// No storage behind this pointer. A hole may still carry a birth txg.
    pub fn is_hole(&self) -> bool {
        self.dvas.is_empty()
    }

    pub fn is_gang(&self) -> bool {
        self.dvas.first().is_some_and(|d| d.gang)
    }

    pub fn ndvas(&self) -> usize {
        self.dvas.len()
    }

    /// Resets to a hole, as done before (re)allocation.
    pub fn zero(&mut self) {
        *self = Self::hole();
    }

    pub fn is_metadata(&self) -> bool {
        self.object_type == ObjectType::Metadata || self.level > 0
    }

    /// Verifier for self-checksummed gang headers: unique per location.
    pub fn gang_verifier(&self) -> u64 {
        match self.dvas.first() {
            Some(dva) => dva.vdev.rotate_left(48) ^ dva.offset ^ self.birth_txg.rotate_left(24),
            None => self.birth_txg,
        }
    }
}

/// Write properties chosen by the caller for a new block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteProps {
    pub checksum: ChecksumKind,
    pub compress: CompressKind,
    pub crypt: CryptKind,
    pub key_id: u64,
    pub object_type: ObjectType,
    pub level: u8,
    pub copies: usize,
    pub dedup: bool,
    pub nopwrite: bool,
    pub alloc_class: AllocClass,
}

impl Default for WriteProps {
    fn default() -> Self {
        Self {
            checksum: ChecksumKind::Xxh3,
            compress: CompressKind::Off,
            crypt: CryptKind::Off,
            key_id: 0,
            object_type: ObjectType::Data,
            level: 0,
            copies: 1,
            dedup: false,
            nopwrite: false,
            alloc_class: AllocClass::Normal,
        }
    }
}

pub const DMU_META_DNODE_OBJECT: u64 = 0;
const DNODE_SHIFT: u32 = 9;
const SPA_BLKPTRSHIFT: u32 = 7;
const COMPARE_META_LEVEL: u128 = 1 << 31;

/// Logical position of a block: dataset, object, indirection level, block id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Bookmark {
    pub objset: u64,
    pub object: u64,
    pub level: u8,
    pub blkid: u64,
}

impl Bookmark {
    pub fn new(objset: u64, object: u64, level: u8, blkid: u64) -> Self {
        Self {
            objset,
            object,
            level,
            blkid,
        }
    }

    /// Orders bookmarks by when a pre-order traversal of the object tree would
    /// reach them. `dbss` is the meta-dnode data block size in sectors, `ibs`
    /// the indirect block shift.
    ///
    /// Blocks of the meta-dnode are converted to the object they describe so
    /// they compare before any block of that object.
    pub fn traversal_cmp(&self, dbss: u64, ibs: u32, other: &Bookmark, other_dbss: u64, other_ibs: u32) -> Ordering {
        if self.object == other.object && self.level == other.level && self.blkid == other.blkid {
            return Ordering::Equal;
        }

        let (a_obj, a_l0, a_level) = self.canonical(dbss, ibs);
        let (b_obj, b_l0, b_level) = other.canonical(other_dbss, other_ibs);

        a_obj
            .cmp(&b_obj)
            .then(a_l0.cmp(&b_l0))
            // Higher levels come first within the same span.
            .then(b_level.cmp(&a_level))
    }

    /// Traversal order with the default block geometry.
    pub fn default_traversal_cmp(&self, other: &Bookmark) -> Ordering {
        self.traversal_cmp(32, 17, other, 32, 17)
    }

    fn canonical(&self, dbss: u64, ibs: u32) -> (u128, u128, u128) {
        let span_shift = (ibs.saturating_sub(SPA_BLKPTRSHIFT) as u128) * self.level as u128;
        let span: u128 = if span_shift >= 64 { u64::MAX as u128 } else { 1u128 << span_shift };
        let l0 = (self.blkid as u128).saturating_mul(span);

        if self.object == DMU_META_DNODE_OBJECT {
            let per_block = (dbss as u128) << (SPA_MINBLOCKSHIFT - DNODE_SHIFT);
            (l0.saturating_mul(per_block), 0, self.level as u128 + COMPARE_META_LEVEL)
        } else {
            (self.object as u128, l0, self.level as u128)
        }
    }
}

pub const GANG_MAGIC: u64 = 0x210d_a7ab_10c7_a11f;

/// Size of the embedded checksum tail at the end of a gang header block.
pub const GANG_TAIL_SIZE: usize = 40;

/// In-memory form of a gang header: up to three member block pointers.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct GangHeader {
    pub magic: u64,
    pub blkptrs: [Option<BlockPointer>; SPA_GBH_NBLKPTRS],
}

impl Default for GangHeader {
    fn default() -> Self {
        Self {
            magic: GANG_MAGIC,
            blkptrs: [None, None, None],
        }
    }
}

impl GangHeader {
    /// Serializes into a full gang block with a zeroed checksum tail.
    pub fn encode(&self) -> Result<Vec<u8>, ZioError> {
        let body = bincode::encode_to_vec(self, storage_bincode_config())
            .map_err(|e| ZioError::Corrupt(format!("gang header encode: {}", e)))?;
        let capacity = SPA_GANGBLOCKSIZE as usize - GANG_TAIL_SIZE;
        if body.len() > capacity {
            return Err(ZioError::Corrupt(format!(
                "gang header needs {} bytes, block holds {}",
                body.len(),
                capacity
            )));
        }
        let mut block = vec![0u8; SPA_GANGBLOCKSIZE as usize];
        block[..body.len()].copy_from_slice(&body);
        Ok(block)
    }

    pub fn decode(block: &[u8]) -> Result<Self, ZioError> {
        let capacity = (SPA_GANGBLOCKSIZE as usize - GANG_TAIL_SIZE).min(block.len());
        let (header, _): (GangHeader, usize) =
            bincode::decode_from_slice(&block[..capacity], storage_bincode_config())
                .map_err(|e| ZioError::Corrupt(format!("gang header decode: {}", e)))?;
        if header.magic != GANG_MAGIC {
            return Err(ZioError::Corrupt("bad gang header magic".to_string()));
        }
        Ok(header)
    }

    /// Sum of the member physical sizes (holes excluded).
    pub fn total_psize(&self) -> u64 {
        self.blkptrs.iter().flatten().map(|bp| bp.psize).sum()
    }
}
