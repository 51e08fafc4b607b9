//! Dedup stages.
//!
//! The first writer of a block's data becomes the lead: it issues one DDT
//! child write that allocates and writes the shared copy. Writers that find
//! a lead in flight attach themselves as extra parents of that child and
//! pick up its DVAs at READY. Writers that find a finished copy take a
//! reference and write nothing.

use log::{debug, warn};

use crate::storage::dedup::{DdtEntryRef, DdtKey, DdtPhys};

use super::construct::{self, ZioArgs};
use super::executor;
use super::graph;
use super::request::{ActiveZio, Callback};
use super::stages::Next;
use super::types::{ChildMask, WaitType};

pub(crate) fn read_start(zio: &mut ActiveZio<'_>) -> Next {
    let Some(bp) = zio.st.bp.clone() else {
        return Next::Continue;
    };
    let child = construct::create(
        zio.spa,
        ZioArgs::read(bp, zio.st.data.clone(), zio.st.size)
            .parent(zio.node.id)
            .priority(zio.priority())
            .flags(zio.st.flags.ddt_child())
            .bookmark(zio.st.bookmark),
    );
    executor::nowait(zio.spa, &child);
    Next::Continue
}

pub(crate) fn read_done(zio: &mut ActiveZio<'_>) -> Next {
    if graph::wait_for_children(zio, ChildMask::DDT, WaitType::Done) {
        return Next::Stop;
    }
    Next::Continue
}

pub(crate) fn write(zio: &mut ActiveZio<'_>) -> Next {
    let spa = zio.spa;
    let Some(bp) = zio.st.bp.clone() else {
        return Next::Continue;
    };
    debug_assert!(bp.dedup);
    debug_assert!(bp.checksum_kind.is_dedup_capable());

    let entry = spa.ddt.lookup_or_create(&DdtKey::from_bp(&bp));
    let mut e = entry.lock();

    if let Some(lead) = e.lead.and_then(|id| spa.arena.get(id)) {
        debug!("{}: {} joins dedup write {}", spa.name, zio.node.id, lead.id);
        graph::add_child(zio.node, &lead);
        drop(e);
        zio.st.ddt_entry = Some(entry);
        return Next::Continue;
    }

    if let Some(phys) = e.phys.clone() {
        e.refcount += 1;
        drop(e);
        if let Some(bp) = zio.st.bp.as_mut() {
            bp.dvas = phys.dvas;
            bp.birth_txg = phys.birth;
        }
        return Next::Continue;
    }

    let lead = construct::create(
        spa,
        ZioArgs::write(
            zio.st.txg,
            Some(bp),
            zio.st.data.clone(),
            zio.st.size,
            zio.st.prop.clone(),
        )
        .parent(zio.node.id)
        .priority(zio.priority())
        .flags(zio.st.flags.ddt_child())
        .bookmark(zio.st.bookmark)
        .on_ready(Callback::DdtLeadReady {
            entry: entry.clone(),
        })
        .on_done(Callback::DdtLeadDone {
            entry: entry.clone(),
        }),
    );
    e.lead = Some(lead.id);
    drop(e);
    zio.st.ddt_entry = Some(entry);
    executor::nowait(spa, &lead);
    Next::Continue
}

pub(crate) fn lead_ready(zio: &mut ActiveZio<'_>, entry: &DdtEntryRef) {
    if zio.st.error.is_some() {
        return;
    }
    if let Some(bp) = zio.st.bp.as_ref() {
        entry.lock().phys = Some(DdtPhys {
            dvas: bp.dvas.clone(),
            birth: bp.birth_txg,
        });
    }
}

/// Each parent of the lead now references the shared copy. Joiners attach
/// under the entry lock, so the parents are counted under it too.
pub(crate) fn lead_done(zio: &mut ActiveZio<'_>, entry: &DdtEntryRef) {
    let mut e = entry.lock();
    let parents = zio.node.sync.lock().parents.len() as u64;
    e.lead = None;
    if zio.st.error.is_none() {
        e.refcount += parents;
        return;
    }
    e.phys = None;
    if e.refcount == 0 {
        let key = e.key;
        drop(e);
        zio.spa.ddt.remove(&key);
    }
}

pub(crate) fn free(zio: &mut ActiveZio<'_>) -> Next {
    let spa = zio.spa;
    let Some(bp) = zio.st.bp.clone() else {
        return Next::Continue;
    };
    let key = DdtKey::from_bp(&bp);
    let Some(entry) = spa.ddt.lookup(&key) else {
        warn!(
            "{}: freeing deduplicated block with no table entry, releasing its space",
            spa.name
        );
        if !bp.is_hole() {
            spa.allocator.free(&bp.dvas, zio.st.txg);
        }
        return Next::Continue;
    };

    let mut e = entry.lock();
    e.refcount = e.refcount.saturating_sub(1);
    if e.refcount == 0 && e.lead.is_none() {
        if let Some(phys) = e.phys.take() {
            spa.allocator.free(&phys.dvas, zio.st.txg);
        }
        drop(e);
        spa.ddt.remove(&key);
    }
    Next::Continue
}
