//! Request constructors.
//!
//! Every request is built from a [`ZioArgs`]: a per-kind starting point
//! (`ZioArgs::read`, `ZioArgs::write`, ...) refined with builder calls, then
//! handed to [`create`], which derives the child type, finishes the pipeline
//! and links the request under its parent.

use std::sync::Arc;

use log::warn;

use crate::common::config::Txg;
use crate::storage::abd::Abd;
use crate::storage::blkptr::{BlockPointer, Bookmark, ChecksumKind, WriteProps};
use crate::storage::pool::Spa;
use crate::storage::vdev::Vdev;

use super::arena::ZioId;
use super::executor;
use super::gang::GangRef;
use super::graph;
use super::request::{ActiveZio, Callback, NodeInit, ZioNode, ZioState};
use super::types::{
    ChildType, IoctlCmd, Priority, Stage, StageMask, ZioFlags, ZioType, CLAIM_PIPELINE,
    DDT_CHILD_READ_PIPELINE, DDT_CHILD_WRITE_PIPELINE, FREE_PIPELINE, GANG_STAGES,
    INTERLOCK_PIPELINE, IOCTL_PIPELINE, READ_PHYS_PIPELINE, READ_PIPELINE, REWRITE_PIPELINE,
    TRIM_PIPELINE, VDEV_CHILD_PIPELINE, WRITE_PHYS_PIPELINE, WRITE_PIPELINE,
};

pub(crate) struct ZioArgs {
    io_type: ZioType,
    parent: Option<ZioId>,
    bp: Option<BlockPointer>,
    data: Abd,
    size: u64,
    txg: Txg,
    vd: Option<Arc<Vdev>>,
    offset: u64,
    priority: Option<Priority>,
    flags: ZioFlags,
    stage: Stage,
    pipeline: StageMask,
    prop: WriteProps,
    bookmark: Bookmark,
    ready: Option<Callback>,
    done: Option<Callback>,
    gang_leader: Option<ZioId>,
    gang_header: Option<GangRef>,
    gang_slot: Option<(GangRef, usize)>,
    bp_override: Option<BlockPointer>,
    ioctl: Option<IoctlCmd>,
}

impl ZioArgs {
    fn new(io_type: ZioType, pipeline: StageMask) -> Self {
        Self {
            io_type,
            parent: None,
            bp: None,
            data: Abd::alloc(0),
            size: 0,
            txg: 0,
            vd: None,
            offset: 0,
            priority: None,
            flags: ZioFlags::NONE,
            stage: Stage::Open,
            pipeline,
            prop: WriteProps::default(),
            bookmark: Bookmark::default(),
            ready: None,
            done: None,
            gang_leader: None,
            gang_header: None,
            gang_slot: None,
            bp_override: None,
            ioctl: None,
        }
    }

    pub(crate) fn null() -> Self {
        Self::new(ZioType::Null, INTERLOCK_PIPELINE)
    }

    pub(crate) fn read(bp: BlockPointer, data: Abd, size: u64) -> Self {
        Self {
            bp: Some(bp),
            data,
            size,
            priority: Some(Priority::SyncRead),
            ..Self::new(ZioType::Read, READ_PIPELINE)
        }
    }

    /// A write of new data. `bp` is the pointer being replaced, if any.
    pub(crate) fn write(
        txg: Txg,
        bp: Option<BlockPointer>,
        data: Abd,
        size: u64,
        prop: WriteProps,
    ) -> Self {
        Self {
            bp,
            data,
            size,
            txg,
            prop,
            priority: Some(Priority::AsyncWrite),
            ..Self::new(ZioType::Write, WRITE_PIPELINE)
        }
    }

    /// Rewrites an allocated block in place.
    pub(crate) fn rewrite(txg: Txg, bp: BlockPointer, data: Abd, size: u64) -> Self {
        let prop = WriteProps {
            checksum: bp.checksum_kind,
            compress: bp.compress,
            crypt: bp.crypt,
            object_type: bp.object_type,
            level: bp.level,
            copies: bp.ndvas().max(1),
            ..WriteProps::default()
        };
        Self {
            bp: Some(bp),
            data,
            size,
            txg,
            prop,
            priority: Some(Priority::AsyncWrite),
            flags: ZioFlags::IO_REWRITE,
            ..Self::new(ZioType::Write, REWRITE_PIPELINE)
        }
    }

    pub(crate) fn free(txg: Txg, bp: BlockPointer) -> Self {
        let size = bp.psize;
        let mut args = Self {
            txg,
            size,
            ..Self::new(ZioType::Free, FREE_PIPELINE)
        };
        if bp.is_gang() || bp.dedup {
            args.pipeline.insert(Stage::IssueAsync);
        }
        args.bp = Some(bp);
        args
    }

    pub(crate) fn claim(txg: Txg, bp: BlockPointer) -> Self {
        Self {
            size: bp.psize,
            bp: Some(bp),
            txg,
            ..Self::new(ZioType::Claim, CLAIM_PIPELINE)
        }
    }

    fn ioctl_leaf(vd: Arc<Vdev>, cmd: IoctlCmd) -> Self {
        Self {
            vd: Some(vd),
            ioctl: Some(cmd),
            ..Self::new(ZioType::Ioctl, IOCTL_PIPELINE)
        }
    }

    pub(crate) fn trim(vd: Arc<Vdev>, offset: u64, size: u64) -> Self {
        Self {
            vd: Some(vd),
            offset,
            size,
            priority: Some(Priority::Trim),
            ..Self::new(ZioType::Trim, TRIM_PIPELINE)
        }
    }

    /// Reads raw bytes from a leaf device, bypassing block pointers.
    pub(crate) fn read_phys(vd: Arc<Vdev>, offset: u64, data: Abd, size: u64, checksum: ChecksumKind) -> Self {
        let mut args = Self {
            vd: Some(vd),
            offset,
            data,
            size,
            priority: Some(Priority::SyncRead),
            flags: ZioFlags::PHYSICAL,
            ..Self::new(ZioType::Read, READ_PHYS_PIPELINE)
        };
        args.prop.checksum = checksum;
        args
    }

    pub(crate) fn write_phys(vd: Arc<Vdev>, offset: u64, data: Abd, size: u64, checksum: ChecksumKind) -> Self {
        // Embedded checksums are written into the buffer, so the caller's
        // copy must stay untouched.
        let data = if checksum.is_embedded() {
            Abd::from_vec(data.to_vec())
        } else {
            data
        };
        let mut args = Self {
            vd: Some(vd),
            offset,
            data,
            size,
            priority: Some(Priority::SyncWrite),
            flags: ZioFlags::PHYSICAL,
            ..Self::new(ZioType::Write, WRITE_PHYS_PIPELINE)
        };
        args.prop.checksum = checksum;
        args
    }

    /// I/O to one device on behalf of a parent, starting just past READY.
    pub(crate) fn vdev_child(io_type: ZioType, vd: Arc<Vdev>, offset: u64, data: Abd, size: u64) -> Self {
        Self {
            vd: Some(vd),
            offset,
            data,
            size,
            stage: Stage::Ready,
            ..Self::new(io_type, VDEV_CHILD_PIPELINE)
        }
    }

    pub(crate) fn parent(mut self, parent: ZioId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub(crate) fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Adds to the flags the kind already set.
    pub(crate) fn flags(mut self, flags: ZioFlags) -> Self {
        self.flags.insert(flags);
        self
    }

    pub(crate) fn bookmark(mut self, bookmark: Bookmark) -> Self {
        self.bookmark = bookmark;
        self
    }

    pub(crate) fn bp(mut self, bp: Option<BlockPointer>) -> Self {
        self.bp = bp;
        self
    }

    pub(crate) fn on_ready(mut self, cb: Callback) -> Self {
        self.ready = Some(cb);
        self
    }

    pub(crate) fn on_done(mut self, cb: Callback) -> Self {
        self.done = Some(cb);
        self
    }

    pub(crate) fn gang_leader(mut self, leader: ZioId) -> Self {
        self.gang_leader = Some(leader);
        self
    }

    pub(crate) fn gang_header(mut self, node: GangRef) -> Self {
        self.gang_header = Some(node);
        self
    }

    pub(crate) fn gang_slot(mut self, node: GangRef, index: usize) -> Self {
        self.gang_slot = Some((node, index));
        self
    }

    /// Supplies the finished block pointer up front; the write skips
    /// compression, checksumming and allocation.
    pub(crate) fn override_bp(mut self, bp: BlockPointer) -> Self {
        self.bp_override = Some(bp);
        self
    }
}

fn child_type_of(args: &ZioArgs) -> ChildType {
    if args.vd.is_some() {
        ChildType::Vdev
    } else if args.flags.contains(ZioFlags::GANG_CHILD) {
        ChildType::Gang
    } else if args.flags.contains(ZioFlags::DDT_CHILD) {
        ChildType::Ddt
    } else {
        ChildType::Logical
    }
}

/// Builds the request described by `args` and links it under its parent.
pub(crate) fn create(spa: &Arc<Spa>, args: ZioArgs) -> Arc<ZioNode> {
    let child_type = child_type_of(&args);
    let mut pipeline = args.pipeline;

    if args.flags.contains(ZioFlags::DDT_CHILD) {
        if args.io_type == ZioType::Read && pipeline == READ_PIPELINE {
            pipeline = DDT_CHILD_READ_PIPELINE;
        } else if args.io_type == ZioType::Write && pipeline == WRITE_PIPELINE {
            pipeline = DDT_CHILD_WRITE_PIPELINE;
        }
    }
    if child_type > ChildType::Gang && args.bp.as_ref().is_some_and(BlockPointer::is_gang) {
        pipeline = pipeline.union(GANG_STAGES);
    }
    pipeline.insert(args.stage);

    let mut st = ZioState::new(args.flags, args.stage, pipeline, args.data, args.size, args.txg);
    st.bp_orig = args.bp.clone();
    st.bp = args.bp;
    st.bp_override = args.bp_override;
    st.alloc_class = args.prop.alloc_class;
    st.prop = args.prop;
    st.bookmark = args.bookmark;
    st.ready = args.ready;
    st.done = args.done;
    st.gang_leader = args.gang_leader;
    st.gang_header = args.gang_header;
    st.gang_slot = args.gang_slot;
    st.ioctl = args.ioctl;

    let node = spa.arena.insert(|id| {
        ZioNode::new(
            id,
            NodeInit {
                io_type: args.io_type,
                child_type,
                vd: args.vd,
                offset: args.offset,
                priority: args.priority.unwrap_or(Priority::Now),
                state: st,
            },
        )
    });

    if let Some(pid) = args.parent {
        match spa.arena.get(pid) {
            Some(parent) => graph::add_child(&parent, &node),
            None => warn!("{}: parent {} of {} is gone", spa.name, pid, node.id),
        }
    }
    node
}

pub(crate) fn null(spa: &Arc<Spa>, parent: Option<ZioId>, flags: ZioFlags) -> Arc<ZioNode> {
    let mut args = ZioArgs::null().flags(flags);
    args.parent = parent;
    create(spa, args)
}

/// A parentless null request that only gathers children.
pub(crate) fn root(spa: &Arc<Spa>, flags: ZioFlags) -> Arc<ZioNode> {
    null(spa, None, flags)
}

/// Device control on `vd`: one request per leaf under a null request for
/// each interior device.
pub(crate) fn ioctl(
    spa: &Arc<Spa>,
    parent: Option<ZioId>,
    vd: &Arc<Vdev>,
    cmd: IoctlCmd,
    flags: ZioFlags,
) -> Arc<ZioNode> {
    if vd.is_leaf() {
        let mut args = ZioArgs::ioctl_leaf(Arc::clone(vd), cmd).flags(flags);
        args.parent = parent;
        return create(spa, args);
    }
    let node = null(spa, parent, flags);
    for child in vd.children() {
        let leaf = ioctl(spa, Some(node.id), child, cmd, flags);
        executor::nowait(spa, &leaf);
    }
    node
}

/// Flushes the write caches of every leaf under `vd`. Failures are ignored.
pub(crate) fn flush(spa: &Arc<Spa>, parent: Option<ZioId>, vd: &Arc<Vdev>) -> Arc<ZioNode> {
    ioctl(
        spa,
        parent,
        vd,
        IoctlCmd::FlushCache,
        ZioFlags::CANFAIL | ZioFlags::DONT_PROPAGATE | ZioFlags::DONT_RETRY,
    )
}

/// Issues I/O to a child device of the request being run.
///
/// A read that carries a block pointer moves checksum verification down to
/// the child, so errors are detected as close to the leaves as possible.
/// Every retry of the parent's children verifies too.
pub(crate) fn vdev_child_io(pio: &mut ActiveZio<'_>, args: ZioArgs) -> Arc<ZioNode> {
    let mut args = args;
    args.parent = Some(pio.node.id);
    args.txg = pio.st.txg;
    args.bookmark = pio.st.bookmark;
    if args.bp.is_none() {
        args.bp = pio.st.bp.clone();
    }
    args.priority.get_or_insert(pio.priority());

    let verify = pio.st.pipeline.union(pio.st.orig_pipeline);
    if args.io_type == ZioType::Read && args.bp.is_some() && verify.contains(Stage::ChecksumVerify) {
        args.pipeline.insert(Stage::ChecksumVerify);
        pio.st.pipeline.remove(Stage::ChecksumVerify);
    }

    args.flags.insert(pio.st.flags.vdev_child());
    if args.flags.contains(ZioFlags::IO_REPAIR) {
        args.flags.remove(ZioFlags::SPECULATIVE);
    }
    create(pio.spa, args)
}

/// Device I/O issued by a device implementation outside any request tree.
pub(crate) fn vdev_delegated_io(spa: &Arc<Spa>, args: ZioArgs) -> Arc<ZioNode> {
    let mut args = args;
    args.stage = Stage::Open;
    args.flags
        .insert(ZioFlags::CANFAIL | ZioFlags::DONT_RETRY | ZioFlags::DELEGATED);
    create(spa, args)
}
