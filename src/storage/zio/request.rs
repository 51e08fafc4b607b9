//! The request record.
//!
//! A request is split across two locks. [`ZioState`] belongs to whichever
//! thread is currently running the request's stages. [`ZioSync`] holds the
//! fields other requests touch concurrently: pending child counters, the edge
//! lists, the stall marker and the waiter handshake.
//!
//! Lock order: a parent's state before a child's state, and a child's sync
//! before its parent's sync. A stage never locks the state of another request
//! that may be running.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tokio::sync::oneshot;

use crate::common::config::Txg;
use crate::common::exception::ZioError;
use crate::storage::abd::Abd;
use crate::storage::allocator::AllocClass;
use crate::storage::blkptr::{BlockPointer, Bookmark, WriteProps};
use crate::storage::dedup::DdtEntryRef;
use crate::storage::pool::Spa;
use crate::storage::vdev::Vdev;
use crate::storage::vdev::mirror::MirrorMap;

use super::arena::ZioId;
use super::executor::IoCompletion;
use super::taskq::TaskqTier;
use super::gang::GangRef;
use super::throttle::Reservation;
use super::transform::Transform;
use super::types::{
    ChildType, IoctlCmd, Priority, RequestState, Stage, StageMask, WaitType, ZioFlags, ZioType,
};

pub const REEXECUTE_NOW: u8 = 1 << 0;
pub const REEXECUTE_SUSPEND: u8 = 1 << 1;

/// Caller-supplied completion hook.
pub type UserCallback = Box<dyn FnMut(&ZioView<'_>) + Send>;

/// Work to run when a request reaches ready or done.
pub(crate) enum Callback {
    User(UserCallback),
    /// A gang header read finished; decode it into the tree node.
    GangHeaderRead { node: GangRef, leader: ZioId },
    /// The lead dedup write has its DVAs.
    DdtLeadReady { entry: DdtEntryRef },
    DdtLeadDone { entry: DdtEntryRef },
    /// A mirror child finished; record its outcome in the parent's map.
    MirrorChild { map: Arc<MirrorMap>, index: usize },
}

/// What a successful request hands back to its waiter.
#[derive(Debug, Clone, Default)]
pub struct Completed {
    pub bp: Option<BlockPointer>,
    pub trace: Vec<Stage>,
}

pub(crate) struct ZioState {
    pub(crate) flags: ZioFlags,
    pub(crate) orig_flags: ZioFlags,
    pub(crate) stage: Stage,
    pub(crate) orig_stage: Stage,
    pub(crate) pipeline: StageMask,
    pub(crate) orig_pipeline: StageMask,

    pub(crate) bp: Option<BlockPointer>,
    /// The block pointer as it was before this request touched it.
    pub(crate) bp_orig: Option<BlockPointer>,
    pub(crate) bp_override: Option<BlockPointer>,
    pub(crate) prop: WriteProps,
    pub(crate) txg: Txg,
    pub(crate) bookmark: Bookmark,

    pub(crate) data: Abd,
    pub(crate) size: u64,
    pub(crate) orig_data: Abd,
    pub(crate) orig_size: u64,
    pub(crate) transforms: Vec<Transform>,

    pub(crate) error: Option<ZioError>,

    pub(crate) gang_leader: Option<ZioId>,
    pub(crate) gang_tree: Option<GangRef>,
    /// Set on a gang header write: the node whose header it encodes.
    pub(crate) gang_header: Option<GangRef>,
    /// Set on a gang member write: where to publish the member's pointer.
    pub(crate) gang_slot: Option<(GangRef, usize)>,

    pub(crate) ready: Option<Callback>,
    pub(crate) done: Option<Callback>,

    pub(crate) vsd: Option<Arc<MirrorMap>>,
    pub(crate) ddt_entry: Option<DdtEntryRef>,
    pub(crate) ioctl: Option<IoctlCmd>,
    pub(crate) alloc_class: AllocClass,
    /// This request holds the pool config lock as a reader.
    pub(crate) config_held: bool,
    pub(crate) trace: Vec<Stage>,
}

/// The request's place on a worker queue. The queued task and a requeue on
/// promotion race for the ticket; only the winner runs the request.
pub(crate) struct QueuedTask {
    pub(crate) tier: TaskqTier,
    pub(crate) ticket: Arc<AtomicBool>,
}

pub(crate) struct ZioSync {
    /// Pending counters, indexed by child type then wait type.
    pub(crate) children: [[u64; 2]; 4],
    pub(crate) child_error: [Option<ZioError>; 4],
    pub(crate) reexecute: u8,
    pub(crate) stall: Option<(ChildType, WaitType)>,
    pub(crate) reached: [bool; 2],
    pub(crate) parents: Vec<ZioId>,
    pub(crate) kids: Vec<ZioId>,

    pub(crate) waiter: bool,
    pub(crate) result: Option<Result<Completed, ZioError>>,
    pub(crate) async_waiter: Option<oneshot::Sender<Result<Completed, ZioError>>>,

    /// A device operation is outstanding; its completion is accepted once.
    pub(crate) device_pending: bool,
    pub(crate) device_result: Option<Result<(), ZioError>>,
    pub(crate) alloc_reserved: Option<Reservation>,
    pub(crate) timestamp: Option<Instant>,
    pub(crate) lifecycle: RequestState,
    pub(crate) queued: Option<QueuedTask>,
}

impl ZioSync {
    fn new(reached: [bool; 2]) -> Self {
        Self {
            children: [[0; 2]; 4],
            child_error: [None, None, None, None],
            reexecute: 0,
            stall: None,
            reached,
            parents: Vec::new(),
            kids: Vec::new(),
            waiter: false,
            result: None,
            async_waiter: None,
            device_pending: false,
            device_result: None,
            alloc_reserved: None,
            timestamp: None,
            lifecycle: RequestState::Created,
            queued: None,
        }
    }

    pub(crate) fn advance(&mut self, event: super::types::LifecycleEvent) {
        match self.lifecycle.on(event) {
            Some(next) => self.lifecycle = next,
            None => log::trace!(
                "ignoring lifecycle event {} in state {}",
                event.name(),
                self.lifecycle.name()
            ),
        }
    }
}

pub(crate) struct ZioNode {
    pub(crate) id: ZioId,
    pub(crate) io_type: ZioType,
    pub(crate) child_type: ChildType,
    /// Operation kind whose worker queues run this request.
    pub(crate) taskq_type: ZioType,
    pub(crate) vd: Option<Arc<Vdev>>,
    pub(crate) offset: u64,
    pub(crate) godfather: bool,
    pub(crate) state: Mutex<ZioState>,
    pub(crate) sync: Mutex<ZioSync>,
    pub(crate) cv: Condvar,
    stage_hint: AtomicU32,
    priority: AtomicU8,
}

pub(crate) struct NodeInit {
    pub(crate) io_type: ZioType,
    pub(crate) child_type: ChildType,
    pub(crate) vd: Option<Arc<Vdev>>,
    pub(crate) offset: u64,
    pub(crate) priority: Priority,
    pub(crate) state: ZioState,
}

impl ZioNode {
    pub(crate) fn new(id: ZioId, init: NodeInit) -> Self {
        let stage = init.state.stage;
        let flags = init.state.flags;
        let taskq_type = if flags.intersects(ZioFlags::CONFIG_WRITER | ZioFlags::PROBE) {
            ZioType::Null
        } else {
            init.io_type
        };
        let reached = [stage >= Stage::Ready, stage >= Stage::Done];
        Self {
            id,
            io_type: init.io_type,
            child_type: init.child_type,
            taskq_type,
            vd: init.vd,
            offset: init.offset,
            godfather: flags.contains(ZioFlags::GODFATHER),
            state: Mutex::new(init.state),
            sync: Mutex::new(ZioSync::new(reached)),
            cv: Condvar::new(),
            stage_hint: AtomicU32::new(stage.bit()),
            priority: AtomicU8::new(init.priority as u8),
        }
    }

    /// Last stage published by the running thread; readable without locks.
    pub(crate) fn stage_hint(&self) -> Stage {
        Stage::from_bit(self.stage_hint.load(Ordering::Acquire)).unwrap_or(Stage::Open)
    }

    pub(crate) fn publish_stage(&self, stage: Stage) {
        self.stage_hint.store(stage.bit(), Ordering::Release);
    }

    pub(crate) fn priority(&self) -> Priority {
        match self.priority.load(Ordering::Acquire) {
            0 => Priority::SyncRead,
            1 => Priority::SyncWrite,
            2 => Priority::AsyncRead,
            3 => Priority::AsyncWrite,
            4 => Priority::Scrub,
            5 => Priority::Trim,
            _ => Priority::Now,
        }
    }

    pub(crate) fn set_priority(&self, priority: Priority) {
        self.priority.store(priority as u8, Ordering::Release);
    }

    pub(crate) fn is_logical(&self) -> bool {
        self.child_type == ChildType::Logical
    }
}

impl ZioState {
    pub(crate) fn new(
        flags: ZioFlags,
        stage: Stage,
        pipeline: StageMask,
        data: Abd,
        size: u64,
        txg: Txg,
    ) -> Self {
        Self {
            flags,
            orig_flags: flags,
            stage,
            orig_stage: stage,
            pipeline,
            orig_pipeline: pipeline,
            bp: None,
            bp_orig: None,
            bp_override: None,
            prop: WriteProps::default(),
            txg,
            bookmark: Bookmark::default(),
            orig_data: data.clone(),
            data,
            size,
            orig_size: size,
            transforms: Vec::new(),
            error: None,
            gang_leader: None,
            gang_tree: None,
            gang_header: None,
            gang_slot: None,
            ready: None,
            done: None,
            vsd: None,
            ddt_entry: None,
            ioctl: None,
            alloc_class: AllocClass::Normal,
            config_held: false,
            trace: Vec::new(),
        }
    }

    /// True for writes that allocate new space for their block.
    pub(crate) fn is_allocating(&self) -> bool {
        self.orig_pipeline.contains(Stage::DvaAllocate)
    }
}

/// A request whose stages are being run by the current thread.
///
/// Device implementations receive one of these in [`VdevOps`] and use its
/// accessors to read the request and to issue child I/O.
///
/// [`VdevOps`]: crate::storage::vdev::VdevOps
pub struct ActiveZio<'a> {
    pub(crate) spa: &'a Arc<Spa>,
    pub(crate) node: &'a Arc<ZioNode>,
    pub(crate) st: &'a mut ZioState,
}

impl<'a> ActiveZio<'a> {
    pub fn id(&self) -> ZioId {
        self.node.id
    }

    pub fn io_type(&self) -> ZioType {
        self.node.io_type
    }

    pub fn child_type(&self) -> ChildType {
        self.node.child_type
    }

    pub fn vd(&self) -> Option<&Arc<Vdev>> {
        self.node.vd.as_ref()
    }

    pub fn offset(&self) -> u64 {
        self.node.offset
    }

    pub fn size(&self) -> u64 {
        self.st.size
    }

    pub fn data(&self) -> &Abd {
        &self.st.data
    }

    pub fn bp(&self) -> Option<&BlockPointer> {
        self.st.bp.as_ref()
    }

    pub fn flags(&self) -> ZioFlags {
        self.st.flags
    }

    pub fn priority(&self) -> Priority {
        self.node.priority()
    }

    pub fn txg(&self) -> Txg {
        self.st.txg
    }

    pub fn stage(&self) -> Stage {
        self.st.stage
    }

    pub fn error(&self) -> Option<&ZioError> {
        self.st.error.as_ref()
    }

    pub fn set_error(&mut self, error: Option<ZioError>) {
        self.st.error = error;
    }

    pub fn ioctl(&self) -> Option<IoctlCmd> {
        self.st.ioctl
    }

    pub fn vsd(&self) -> Option<Arc<MirrorMap>> {
        self.st.vsd.clone()
    }

    pub fn set_vsd(&mut self, map: Arc<MirrorMap>) {
        self.st.vsd = Some(map);
    }

    /// Marks a device operation outstanding and returns the handle that
    /// completes it, from any thread.
    pub fn begin_device_io(&mut self) -> IoCompletion {
        let mut sync = self.node.sync.lock();
        sync.device_pending = true;
        sync.device_result = None;
        IoCompletion::new(Arc::downgrade(self.spa), self.node.id)
    }

    /// Arranges for VDEV_IO_DONE to run again, after any newly issued
    /// children complete.
    pub fn redo_io_done(&mut self) {
        self.set_stage_before(Stage::VdevIoDone);
    }

    pub(crate) fn set_stage(&mut self, stage: Stage) {
        debug_assert!(self.st.pipeline.contains(stage), "{:?} not in pipeline", stage);
        self.st.stage = stage;
        self.node.publish_stage(stage);
    }

    /// Positions the request so that the next stage to run is `stage`.
    pub(crate) fn set_stage_before(&mut self, stage: Stage) {
        let prev = self
            .st
            .pipeline
            .prev_before(stage)
            .unwrap_or(self.st.orig_stage);
        self.st.stage = prev;
        self.node.publish_stage(prev);
    }

    /// Replaces the remaining pipeline. The current stage stays a member.
    pub(crate) fn set_pipeline(&mut self, pipeline: StageMask) {
        let mut pipeline = pipeline;
        pipeline.insert(self.st.stage);
        self.st.pipeline = pipeline;
    }

    pub(crate) fn view(&self) -> ZioView<'_> {
        ZioView {
            node: self.node,
            st: &*self.st,
        }
    }
}

/// Read-only view of a request, handed to completion callbacks.
pub struct ZioView<'a> {
    node: &'a ZioNode,
    st: &'a ZioState,
}

impl<'a> ZioView<'a> {
    pub fn id(&self) -> ZioId {
        self.node.id
    }

    pub fn io_type(&self) -> ZioType {
        self.node.io_type
    }

    pub fn bp(&self) -> Option<&BlockPointer> {
        self.st.bp.as_ref()
    }

    pub fn error(&self) -> Option<&ZioError> {
        self.st.error.as_ref()
    }

    pub fn size(&self) -> u64 {
        self.st.size
    }

    pub fn data(&self) -> &Abd {
        &self.st.data
    }

    pub fn stage(&self) -> Stage {
        self.st.stage
    }

    pub fn flags(&self) -> ZioFlags {
        self.st.flags
    }

    pub fn txg(&self) -> Txg {
        self.st.txg
    }

    pub fn bookmark(&self) -> &Bookmark {
        &self.st.bookmark
    }

    pub fn trace(&self) -> &[Stage] {
        &self.st.trace
    }

    pub fn parent_count(&self) -> usize {
        self.node.sync.lock().parents.len()
    }
}
