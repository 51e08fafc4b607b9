//! Parent/child edges and the pending-child counters that gate stages.

use std::sync::Arc;

use crate::common::exception::ZioError;
use crate::storage::pool::Spa;

use super::request::{ActiveZio, ZioNode};
use super::types::{ChildMask, WaitType, ZioFlags};

/// Links `child` under `parent`. For each wait kind the child has not yet
/// reached, the parent's pending counter for the child's type goes up by one.
pub(crate) fn add_child(parent: &ZioNode, child: &ZioNode) {
    debug_assert!(
        child.child_type <= parent.child_type,
        "{:?} child under {:?} parent",
        child.child_type,
        parent.child_type
    );
    let mut cs = child.sync.lock();
    let mut ps = parent.sync.lock();
    debug_assert!(!ps.reached[WaitType::Done.index()], "parent {} already done", parent.id);

    let ct = child.child_type.index();
    for w in WaitType::ALL {
        if !cs.reached[w.index()] {
            ps.children[ct][w.index()] += 1;
        }
    }
    ps.kids.push(child.id);
    cs.parents.push(parent.id);
}

/// Returns true, leaving the request parked, when any child type in `mask`
/// still has children that have not reached `wait`. The request is rewound
/// so this stage runs again when the last such child notifies it.
pub(crate) fn wait_for_children(zio: &mut ActiveZio<'_>, mask: ChildMask, wait: WaitType) -> bool {
    let node = zio.node;
    let mut sync = node.sync.lock();
    debug_assert!(sync.stall.is_none());

    for ct in mask.iter() {
        if sync.children[ct.index()][wait.index()] != 0 {
            sync.stall = Some((ct, wait));
            let prev = zio
                .st
                .pipeline
                .prev_before(zio.st.stage)
                .unwrap_or(zio.st.orig_stage);
            zio.st.stage = prev;
            node.publish_stage(prev);
            return true;
        }
    }
    false
}

/// What a child carries up to its parent when it reaches a wait point.
pub(crate) struct Notice<'a> {
    pub(crate) wait: WaitType,
    pub(crate) error: Option<&'a ZioError>,
    pub(crate) flags: ZioFlags,
    pub(crate) reexecute: u8,
    pub(crate) detach: bool,
}

/// Decrements the parent's counter for `child`. Returns the parent when this
/// was the last child it was stalled on, so the caller can run it.
pub(crate) fn notify_parent(
    spa: &Arc<Spa>,
    child: &ZioNode,
    parent_id: super::arena::ZioId,
    notice: &Notice<'_>,
) -> Option<Arc<ZioNode>> {
    let parent = spa.arena.get(parent_id)?;
    let mut cs = child.sync.lock();
    let mut ps = parent.sync.lock();

    let ct = child.child_type;
    if let Some(err) = notice.error {
        if !notice.flags.contains(ZioFlags::DONT_PROPAGATE) {
            let slot = &mut ps.child_error[ct.index()];
            *slot = ZioError::worst(slot.take(), Some(err.clone()));
        }
    }
    ps.reexecute |= notice.reexecute;

    let counter = &mut ps.children[ct.index()][notice.wait.index()];
    debug_assert!(*counter > 0, "counter underflow on {}", parent.id);
    *counter = counter.saturating_sub(1);
    let runnable = *counter == 0 && ps.stall == Some((ct, notice.wait));

    if notice.detach {
        ps.kids.retain(|&k| k != child.id);
        cs.parents.retain(|&p| p != parent.id);
    }

    if runnable {
        ps.stall = None;
        drop(ps);
        drop(cs);
        return Some(parent);
    }
    None
}

/// Removes the edge without touching counters. Used once the child has
/// already reported done.
pub(crate) fn remove_child(parent: &ZioNode, child: &ZioNode) {
    let mut cs = child.sync.lock();
    let mut ps = parent.sync.lock();
    ps.kids.retain(|&k| k != child.id);
    cs.parents.retain(|&p| p != parent.id);
}
