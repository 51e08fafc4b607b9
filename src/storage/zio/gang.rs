//! Gang blocks: splitting a write that cannot be allocated contiguously.
//!
//! A gang block is a 512-byte header naming up to three member blocks, each
//! of which may itself be a gang block. The in-memory [`GangNode`] tree
//! mirrors the on-disk headers while a gang leader is in flight; members
//! publish their pointers into their parent node as they allocate.

use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::common::config::{
    p2roundup, Txg, SPA_GANGBLOCKSIZE, SPA_GANG_MAX_DEPTH, SPA_GBH_NBLKPTRS, SPA_MINBLOCKSIZE,
};
use crate::common::exception::ZioError;
use crate::storage::abd::Abd;
use crate::storage::blkptr::{
    BlockPointer, Bookmark, CompressKind, CryptKind, GangHeader, WriteProps,
};
use crate::storage::pool::Spa;

use super::arena::ZioId;
use super::construct::{self, ZioArgs};
use super::executor;
use super::graph;
use super::request::{ActiveZio, Callback, ZioNode};
use super::stages::Next;
use super::types::{ChildMask, ChildType, Priority, WaitType, ZioFlags, ZioType, INTERLOCK_PIPELINE};

pub(crate) type GangRef = Arc<Mutex<GangNode>>;

pub(crate) struct GangNode {
    pub(crate) header: GangHeader,
    pub(crate) children: [Option<GangRef>; SPA_GBH_NBLKPTRS],
    pub(crate) depth: usize,
}

impl GangNode {
    pub(crate) fn new_ref(depth: usize) -> GangRef {
        Arc::new(Mutex::new(GangNode {
            header: GangHeader::default(),
            children: [None, None, None],
            depth,
        }))
    }
}

/// Copies a member's block pointer into its slot of the parent header.
pub(crate) fn publish(zio: &ActiveZio<'_>) {
    if let Some((node, g)) = &zio.st.gang_slot {
        node.lock().header.blkptrs[*g] = zio.st.bp.clone();
    }
}

/// Settings every child issued on behalf of a gang leader shares.
struct GangCtx {
    leader: ZioId,
    flags: ZioFlags,
    priority: Priority,
    bookmark: Bookmark,
    txg: Txg,
}

impl GangCtx {
    fn of(zio: &ActiveZio<'_>, leader: ZioId) -> Self {
        Self {
            leader,
            flags: zio.st.flags.gang_child(),
            priority: zio.priority(),
            bookmark: zio.st.bookmark,
            txg: zio.st.txg,
        }
    }

    fn child(&self, args: ZioArgs, parent: ZioId) -> ZioArgs {
        args.parent(parent)
            .priority(self.priority)
            .flags(self.flags)
            .bookmark(self.bookmark)
            .gang_leader(self.leader)
    }
}

/// Replaces a failed allocation with a gang header plus up to three smaller
/// member writes. The request itself then only waits for its children.
pub(crate) fn write_gang_block(pio: &mut ActiveZio<'_>) -> Next {
    let spa = pio.spa;
    let txg = pio.st.txg;
    let leader = pio.st.gang_leader.unwrap_or(pio.node.id);
    let depth = pio
        .st
        .gang_slot
        .as_ref()
        .map_or(0, |(parent, _)| parent.lock().depth + 1);

    if depth >= SPA_GANG_MAX_DEPTH {
        warn!(
            "{}: gang tree for {} reached depth {}, giving up",
            spa.name, leader, depth
        );
        pio.st.error = Some(ZioError::NoSpace);
        return Next::Continue;
    }

    let copies = pio.st.prop.copies.clamp(1, spa.config.max_replication);
    let gbh_copies = (copies + 1).min(spa.config.max_replication);
    let mut dvas = match spa.allocator.allocate(
        pio.st.prop.alloc_class,
        SPA_GANGBLOCKSIZE,
        gbh_copies,
        txg,
    ) {
        Ok(dvas) => dvas,
        Err(e) => {
            pio.st.error = Some(e);
            return Next::Continue;
        }
    };
    for dva in &mut dvas {
        dva.gang = true;
    }

    let bp = {
        let bp = pio.st.bp.get_or_insert_with(BlockPointer::hole);
        bp.dvas = dvas;
        bp.birth_txg = txg;
        bp.clone()
    };
    publish(pio);
    debug!(
        "{}: ganging {} bytes of {} at depth {}",
        spa.name, pio.st.size, pio.node.id, depth
    );

    let node = GangNode::new_ref(depth);
    match &pio.st.gang_slot {
        Some((parent, g)) => parent.lock().children[*g] = Some(Arc::clone(&node)),
        None => pio.st.gang_tree = Some(Arc::clone(&node)),
    }

    let ctx = GangCtx::of(pio, leader);
    let header = construct::create(
        spa,
        ctx.child(
            ZioArgs::rewrite(txg, bp, Abd::alloc(SPA_GANGBLOCKSIZE as usize), SPA_GANGBLOCKSIZE),
            pio.node.id,
        )
        .gang_header(Arc::clone(&node)),
    );

    let member_prop = WriteProps {
        compress: CompressKind::Off,
        crypt: CryptKind::Off,
        copies,
        dedup: false,
        nopwrite: false,
        ..pio.st.prop.clone()
    };

    let mut resid = pio.st.size;
    let mut offset = 0u64;
    for g in 0..SPA_GBH_NBLKPTRS {
        if resid == 0 {
            break;
        }
        let lsize = p2roundup(resid / (SPA_GBH_NBLKPTRS - g) as u64, SPA_MINBLOCKSIZE).min(resid);
        let data = pio.st.data.get_offset(offset as usize, lsize as usize);
        let member = construct::create(
            spa,
            ctx.child(
                ZioArgs::write(txg, None, data, lsize, member_prop.clone()),
                header.id,
            )
            .gang_slot(Arc::clone(&node), g),
        );
        executor::nowait(spa, &member);
        resid -= lsize;
        offset += lsize;
    }

    pio.set_pipeline(INTERLOCK_PIPELINE);
    executor::nowait(spa, &header);
    Next::Continue
}

/// Reads the whole gang tree under `zio` before it is read, freed or claimed.
pub(crate) fn assemble(zio: &mut ActiveZio<'_>) -> Next {
    let Some(bp) = zio.st.bp.clone() else {
        return Next::Continue;
    };
    debug_assert!(bp.is_gang());
    debug_assert!(zio.st.gang_leader.is_none());
    debug_assert!(zio.node.child_type > ChildType::Gang);

    zio.st.gang_leader = Some(zio.node.id);
    let node = GangNode::new_ref(0);
    zio.st.gang_tree = Some(Arc::clone(&node));

    let ctx = GangCtx::of(zio, zio.node.id);
    read_header(zio.spa, &ctx, &bp, node);
    Next::Continue
}

fn read_header(spa: &Arc<Spa>, ctx: &GangCtx, bp: &BlockPointer, node: GangRef) {
    let child = construct::create(
        spa,
        ctx.child(
            ZioArgs::read(bp.clone(), Abd::alloc(SPA_GANGBLOCKSIZE as usize), SPA_GANGBLOCKSIZE),
            ctx.leader,
        )
        .on_done(Callback::GangHeaderRead {
            node,
            leader: ctx.leader,
        }),
    );
    executor::nowait(spa, &child);
}

/// Decodes a header read into its tree node and reads any nested headers.
pub(crate) fn header_read_done(zio: &mut ActiveZio<'_>, node: &GangRef, leader: ZioId) {
    if zio.st.error.is_some() {
        return;
    }
    let header = match zio.st.data.with_slice(GangHeader::decode) {
        Ok(header) => header,
        Err(e) => {
            zio.st.error = Some(e);
            return;
        }
    };

    let nested: Vec<(usize, BlockPointer)> = header
        .blkptrs
        .iter()
        .enumerate()
        .filter_map(|(g, bp)| bp.as_ref().filter(|b| b.is_gang()).map(|b| (g, b.clone())))
        .collect();
    let depth = {
        let mut n = node.lock();
        n.header = header;
        n.depth
    };

    let ctx = GangCtx::of(zio, leader);
    for (g, gbp) in nested {
        let child = GangNode::new_ref(depth + 1);
        node.lock().children[g] = Some(Arc::clone(&child));
        read_header(zio.spa, &ctx, &gbp, child);
    }
}

/// Issues the operation against every block of the assembled tree.
pub(crate) fn issue(zio: &mut ActiveZio<'_>) -> Next {
    if graph::wait_for_children(zio, ChildMask::GANG, WaitType::Done) {
        return Next::Stop;
    }
    let failed = zio.node.sync.lock().child_error[ChildType::Gang.index()].is_some();

    if !failed {
        if let Some(bp) = zio.st.bp.clone() {
            let tree = zio.st.gang_tree.clone();
            let data = zio.st.data.clone();
            let ctx = GangCtx::of(zio, zio.node.id);
            let issued = tree_issue(zio, &ctx, zio.node.id, tree.as_ref(), None, &bp, &data, 0);
            debug_assert!(
                zio.node.io_type != ZioType::Read || issued == zio.st.size,
                "gang members cover {} of {} bytes",
                issued,
                zio.st.size
            );
        }
    } else {
        zio.st.gang_tree = None;
    }

    zio.set_pipeline(INTERLOCK_PIPELINE);
    Next::Continue
}

/// Returns the number of data bytes covered at and below this block.
#[allow(clippy::too_many_arguments)]
fn tree_issue(
    zio: &ActiveZio<'_>,
    ctx: &GangCtx,
    parent: ZioId,
    node: Option<&GangRef>,
    slot: Option<(GangRef, usize)>,
    bp: &BlockPointer,
    data: &Abd,
    offset: u64,
) -> u64 {
    let issued = issue_one(zio, ctx, parent, node, slot, bp, data, offset);
    let below = issued.as_ref().map_or(parent, |n| n.id);

    let mut covered = 0;
    match node {
        Some(node) => {
            let (header, children) = {
                let n = node.lock();
                (n.header.clone(), n.children.clone())
            };
            for (g, gbp) in header.blkptrs.iter().enumerate() {
                let Some(gbp) = gbp.as_ref().filter(|b| !b.is_hole()) else {
                    continue;
                };
                covered += tree_issue(
                    zio,
                    ctx,
                    below,
                    children[g].as_ref(),
                    Some((Arc::clone(node), g)),
                    gbp,
                    data,
                    offset + covered,
                );
            }
        }
        None => covered = bp.psize,
    }

    if let Some(child) = issued {
        executor::nowait(zio.spa, &child);
    }
    covered
}

#[allow(clippy::too_many_arguments)]
fn issue_one(
    zio: &ActiveZio<'_>,
    ctx: &GangCtx,
    parent: ZioId,
    node: Option<&GangRef>,
    slot: Option<(GangRef, usize)>,
    bp: &BlockPointer,
    data: &Abd,
    offset: u64,
) -> Option<Arc<ZioNode>> {
    let psize = bp.psize;
    let args = match zio.node.io_type {
        ZioType::Read => {
            // Headers were already read during assembly.
            if node.is_some() {
                return None;
            }
            ZioArgs::read(bp.clone(), data.get_offset(offset as usize, psize as usize), psize)
        }
        ZioType::Write => match node {
            Some(node) => ZioArgs::rewrite(
                ctx.txg,
                bp.clone(),
                Abd::alloc(SPA_GANGBLOCKSIZE as usize),
                SPA_GANGBLOCKSIZE,
            )
            .gang_header(Arc::clone(node)),
            None => {
                let args = ZioArgs::rewrite(
                    ctx.txg,
                    bp.clone(),
                    data.get_offset(offset as usize, psize as usize),
                    psize,
                );
                match slot {
                    Some((n, g)) => args.gang_slot(n, g),
                    None => args,
                }
            }
        },
        ZioType::Free => ZioArgs::free(ctx.txg, bp.clone()),
        ZioType::Claim => ZioArgs::claim(ctx.txg, bp.clone()),
        _ => return None,
    };
    Some(construct::create(zio.spa, ctx.child(args, parent)))
}

/// Frees everything a failed gang write allocated in `txg`.
pub(crate) fn dva_unallocate(spa: &Spa, txg: Txg, node: Option<&GangRef>, bp: &BlockPointer) {
    if !bp.is_hole() && bp.birth_txg == txg {
        spa.allocator.free(&bp.dvas, txg);
    }
    let Some(node) = node else {
        return;
    };
    let (header, children) = {
        let n = node.lock();
        (n.header.clone(), n.children.clone())
    };
    for (g, gbp) in header.blkptrs.iter().enumerate() {
        if let Some(gbp) = gbp {
            dva_unallocate(spa, txg, children[g].as_ref(), gbp);
        }
    }
}
