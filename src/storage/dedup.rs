//! Dedup table collaborator.
//!
//! Maps the strong checksum of a block's final bytes to the single physical
//! copy that every identical block shares. An entry also remembers the one
//! in-flight write that is producing that copy, so concurrent writers of the
//! same data join it instead of allocating again.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::config::{Checksum, Txg};
use crate::storage::blkptr::{BlockPointer, ChecksumKind, CompressKind, CryptKind, Dva};
use crate::storage::zio::ZioId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DdtKey {
    pub checksum: Checksum,
    pub checksum_kind: ChecksumKind,
    pub compress: CompressKind,
    pub crypt: CryptKind,
    pub lsize: u64,
    pub psize: u64,
}

impl DdtKey {
    pub fn from_bp(bp: &BlockPointer) -> Self {
        Self {
            checksum: bp.checksum,
            checksum_kind: bp.checksum_kind,
            compress: bp.compress,
            crypt: bp.crypt,
            lsize: bp.lsize,
            psize: bp.psize,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdtPhys {
    pub dvas: Vec<Dva>,
    pub birth: Txg,
}

#[derive(Debug)]
pub struct DdtEntry {
    pub key: DdtKey,
    pub phys: Option<DdtPhys>,
    /// Block pointers referencing `phys`.
    pub refcount: u64,
    /// The write currently producing `phys`.
    pub lead: Option<ZioId>,
}

pub type DdtEntryRef = Arc<Mutex<DdtEntry>>;

pub trait DedupTable: Send + Sync {
    fn lookup_or_create(&self, key: &DdtKey) -> DdtEntryRef;

    fn lookup(&self, key: &DdtKey) -> Option<DdtEntryRef>;

    fn remove(&self, key: &DdtKey);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
pub struct MemoryDedupTable {
    entries: Mutex<HashMap<DdtKey, DdtEntryRef>>,
}

impl MemoryDedupTable {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DedupTable for MemoryDedupTable {
    fn lookup_or_create(&self, key: &DdtKey) -> DdtEntryRef {
        let mut entries = self.entries.lock();
        Arc::clone(entries.entry(*key).or_insert_with(|| {
            Arc::new(Mutex::new(DdtEntry {
                key: *key,
                phys: None,
                refcount: 0,
                lead: None,
            }))
        }))
    }

    fn lookup(&self, key: &DdtKey) -> Option<DdtEntryRef> {
        self.entries.lock().get(key).cloned()
    }

    fn remove(&self, key: &DdtKey) {
        self.entries.lock().remove(key);
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
