//! Virtual devices.
//!
//! A pool's devices form a tree: a root whose children are the top-level
//! devices, each either a single leaf disk or a mirror of leaves. Device
//! behavior is supplied by [`VdevOps`]; the pipeline calls it from the
//! VDEV_IO_START and VDEV_IO_DONE stages.

pub mod disk;
pub mod mirror;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use log::{debug, info};
use parking_lot::Mutex;

use crate::common::config::{VdevId, DEFAULT_ASHIFT};
use crate::common::exception::{PoolError, ZioError};
use crate::storage::allocator::{AllocClass, SpaceAllocator};
use crate::storage::zio::{ActiveZio, IoCompletion, ZioType};

use self::disk::{BlockDevice, DiskOps, FileDisk, MemoryDisk};
use self::mirror::MirrorOps;

/// Id of the root device; never handed to the allocator.
pub const ROOT_VDEV_ID: VdevId = u64::MAX;

/// Device behavior at the two device stages.
pub trait VdevOps: Send + Sync {
    /// Starts I/O. A leaf calls [`ActiveZio::begin_device_io`] and completes
    /// the returned handle, now or later; an interior device issues children.
    fn io_start(&self, zio: &mut ActiveZio<'_>);

    /// Inspects the outcome once every child is done. May issue more
    /// children and call [`ActiveZio::redo_io_done`].
    fn io_done(&self, zio: &mut ActiveZio<'_>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VdevKind {
    Root,
    Mirror,
    Disk,
}

/// Per-device I/O counters.
#[derive(Debug, Default)]
pub struct VdevStats {
    reads: AtomicU64,
    writes: AtomicU64,
    read_errors: AtomicU64,
    write_errors: AtomicU64,
    checksum_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VdevStatsSnapshot {
    pub reads: u64,
    pub writes: u64,
    pub read_errors: u64,
    pub write_errors: u64,
    pub checksum_errors: u64,
}

impl VdevStats {
    pub fn record_attempt(&self, io_type: ZioType) {
        match io_type {
            ZioType::Read => self.reads.fetch_add(1, Ordering::Relaxed),
            ZioType::Write => self.writes.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
    }

    pub fn record_error(&self, io_type: ZioType) {
        match io_type {
            ZioType::Read => self.read_errors.fetch_add(1, Ordering::Relaxed),
            ZioType::Write => self.write_errors.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
    }

    pub fn record_checksum_error(&self) {
        self.checksum_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> VdevStatsSnapshot {
        VdevStatsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            checksum_errors: self.checksum_errors.load(Ordering::Relaxed),
        }
    }
}

/// Test hooks for making a leaf misbehave.
#[derive(Default)]
pub struct FaultInjector {
    unavailable: AtomicBool,
    fail_reads: AtomicUsize,
    fail_writes: AtomicUsize,
    corrupt_reads: AtomicUsize,
    hold: AtomicBool,
    held: Mutex<Vec<(IoCompletion, Result<(), ZioError>)>>,
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

impl FaultInjector {
    /// Makes the device inaccessible: every I/O fails as unavailable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    pub fn is_unavailable(&self) -> bool {
        self.unavailable.load(Ordering::Acquire)
    }

    /// Fails the next `n` reads with an I/O error.
    pub fn fail_next_reads(&self, n: usize) {
        self.fail_reads.store(n, Ordering::Release);
    }

    pub fn fail_next_writes(&self, n: usize) {
        self.fail_writes.store(n, Ordering::Release);
    }

    /// Flips a bit in the data returned by the next `n` reads.
    pub fn corrupt_next_reads(&self, n: usize) {
        self.corrupt_reads.store(n, Ordering::Release);
    }

    /// While set, completions are held instead of delivered.
    pub fn hold_completions(&self, hold: bool) {
        self.hold.store(hold, Ordering::Release);
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    /// Delivers every held completion. Returns how many were released.
    pub fn release_held(&self) -> usize {
        let held = std::mem::take(&mut *self.held.lock());
        let n = held.len();
        for (done, result) in held {
            done.complete(result);
        }
        n
    }

    pub(crate) fn take_read_failure(&self) -> bool {
        take_one(&self.fail_reads)
    }

    pub(crate) fn take_write_failure(&self) -> bool {
        take_one(&self.fail_writes)
    }

    pub(crate) fn take_corruption(&self) -> bool {
        take_one(&self.corrupt_reads)
    }

    /// Completes now, or keeps the completion if holding.
    pub(crate) fn deliver(&self, done: IoCompletion, result: Result<(), ZioError>) {
        if self.hold.load(Ordering::Acquire) {
            debug!("holding completion of {}", done.id());
            self.held.lock().push((done, result));
        } else {
            done.complete(result);
        }
    }
}

pub struct Vdev {
    id: VdevId,
    kind: VdevKind,
    ashift: u32,
    children: Vec<Arc<Vdev>>,
    ops: Arc<dyn VdevOps>,
    stats: VdevStats,
    faults: FaultInjector,
}

impl Vdev {
    pub fn new(id: VdevId, kind: VdevKind, ashift: u32, children: Vec<Arc<Vdev>>, ops: Arc<dyn VdevOps>) -> Self {
        Self {
            id,
            kind,
            ashift,
            children,
            ops,
            stats: VdevStats::default(),
            faults: FaultInjector::default(),
        }
    }

    pub fn id(&self) -> VdevId {
        self.id
    }

    pub fn kind(&self) -> VdevKind {
        self.kind
    }

    pub fn ashift(&self) -> u32 {
        self.ashift
    }

    pub fn children(&self) -> &[Arc<Vdev>] {
        &self.children
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty() && self.kind == VdevKind::Disk
    }

    pub fn ops(&self) -> &Arc<dyn VdevOps> {
        &self.ops
    }

    pub fn stats(&self) -> &VdevStats {
        &self.stats
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// A leaf is accessible unless faulted; an interior device while any
    /// child is.
    pub fn is_accessible(&self) -> bool {
        if self.is_leaf() {
            !self.faults.is_unavailable()
        } else {
            self.children.iter().any(|c| c.is_accessible())
        }
    }
}

impl std::fmt::Debug for Vdev {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vdev")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("ashift", &self.ashift)
            .field("children", &self.children.len())
            .finish()
    }
}

/// Backing storage for one leaf.
#[derive(Debug, Clone)]
pub enum DeviceSpec {
    Memory { size: u64 },
    File { path: PathBuf, size: u64 },
}

impl DeviceSpec {
    fn open(&self) -> Result<Arc<dyn BlockDevice>, PoolError> {
        Ok(match self {
            DeviceSpec::Memory { size } => Arc::new(MemoryDisk::new(*size)),
            DeviceSpec::File { path, size } => Arc::new(FileDisk::open(path, *size)?),
        })
    }
}

/// One top-level device: a single disk, or a mirror of several.
#[derive(Debug, Clone)]
pub struct TopLevelSpec {
    pub class: AllocClass,
    pub ashift: u32,
    pub devices: Vec<DeviceSpec>,
}

impl TopLevelSpec {
    pub fn memory_disk(size: u64) -> Self {
        Self {
            class: AllocClass::Normal,
            ashift: DEFAULT_ASHIFT,
            devices: vec![DeviceSpec::Memory { size }],
        }
    }

    pub fn memory_mirror(size: u64, width: usize) -> Self {
        Self {
            class: AllocClass::Normal,
            ashift: DEFAULT_ASHIFT,
            devices: vec![DeviceSpec::Memory { size }; width],
        }
    }

    pub fn with_class(mut self, class: AllocClass) -> Self {
        self.class = class;
        self
    }

    pub fn with_ashift(mut self, ashift: u32) -> Self {
        self.ashift = ashift;
        self
    }
}

/// The built device tree.
pub(crate) struct VdevTree {
    pub(crate) root: Arc<Vdev>,
    pub(crate) by_id: HashMap<VdevId, Arc<Vdev>>,
    pub(crate) min_ashift: u32,
}

/// Opens every device and registers top-level space with the allocator.
/// Top-level devices get ids `0..n`; mirror leaves are numbered after them.
pub(crate) fn build_tree(
    specs: &[TopLevelSpec],
    allocator: &dyn SpaceAllocator,
) -> Result<VdevTree, PoolError> {
    if specs.is_empty() {
        return Err(PoolError::InvalidConfig("pool needs at least one device".to_string()));
    }
    let mirror_ops: Arc<dyn VdevOps> = Arc::new(MirrorOps);
    let mut by_id = HashMap::new();
    let mut top = Vec::with_capacity(specs.len());
    let mut next_leaf_id = specs.len() as VdevId;
    let mut min_ashift = u32::MAX;

    for (i, spec) in specs.iter().enumerate() {
        let id = i as VdevId;
        if spec.devices.is_empty() {
            return Err(PoolError::InvalidConfig(format!("top-level device {} has no disks", id)));
        }
        if !(9..=16).contains(&spec.ashift) {
            return Err(PoolError::InvalidConfig(format!(
                "top-level device {} has unsupported ashift {}",
                id, spec.ashift
            )));
        }

        let mut opened = Vec::with_capacity(spec.devices.len());
        for device in &spec.devices {
            opened.push(device.open()?);
        }
        let size = opened.iter().map(|d| d.size()).min().unwrap_or(0);

        let vd = if opened.len() == 1 {
            let device = opened.remove(0);
            Arc::new(Vdev::new(id, VdevKind::Disk, spec.ashift, Vec::new(), Arc::new(DiskOps::new(device))))
        } else {
            let mut leaves = Vec::with_capacity(opened.len());
            for device in opened {
                let leaf = Arc::new(Vdev::new(
                    next_leaf_id,
                    VdevKind::Disk,
                    spec.ashift,
                    Vec::new(),
                    Arc::new(DiskOps::new(device)),
                ));
                by_id.insert(next_leaf_id, Arc::clone(&leaf));
                leaves.push(leaf);
                next_leaf_id += 1;
            }
            Arc::new(Vdev::new(id, VdevKind::Mirror, spec.ashift, leaves, Arc::clone(&mirror_ops)))
        };

        allocator.add_vdev(id, spec.class, size, spec.ashift);
        info!(
            "Added top-level {:?} vdev {} ({} bytes, ashift {}, {:?})",
            vd.kind(),
            id,
            size,
            spec.ashift,
            spec.class
        );
        min_ashift = min_ashift.min(spec.ashift);
        by_id.insert(id, Arc::clone(&vd));
        top.push(vd);
    }

    let root = Arc::new(Vdev::new(ROOT_VDEV_ID, VdevKind::Root, min_ashift, top, mirror_ops));
    Ok(VdevTree {
        root,
        by_id,
        min_ashift,
    })
}
