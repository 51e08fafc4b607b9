//! Pipeline stage functions.
//!
//! Each stage runs with the request's state locked by the executing thread
//! and reports whether the executor should go on to the next stage, stop
//! (the request is parked or was handed to another thread), or switch to a
//! parent that this stage made runnable.

use std::sync::Arc;

use log::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::common::config::{
    p2phase, p2roundup, FailureMode, SPA_GANGBLOCKSIZE, SPA_MINBLOCKSIZE,
};
use crate::common::exception::ZioError;
use crate::storage::abd::Abd;
use crate::storage::blkptr::{BlockPointer, ChecksumKind, CompressKind, CryptKind};
use crate::storage::compression::{self, Compressed};
use crate::storage::{checksum, crypt};

use super::arena::ZioId;
use super::executor;
use super::graph::{self, Notice};
use super::request::{ActiveZio, Callback, Completed, REEXECUTE_NOW, REEXECUTE_SUSPEND};
use super::taskq::TaskqTier;
use super::transform::{self, Undo};
use super::types::{
    ChildMask, ChildType, LifecycleEvent, Stage, WaitType, ZioFlags, ZioType, DDT_FREE_PIPELINE,
    DDT_READ_PIPELINE, DDT_WRITE_PIPELINE, INTERLOCK_PIPELINE, VDEV_IO_STAGES, WRITE_PIPELINE,
};
use super::{ddt, gang, suspend, throttle};

/// What the executor does after a stage returns.
pub(crate) enum Next {
    Continue,
    /// Run this parent next on the current thread.
    Handoff(ZioId),
    Stop,
}

pub(crate) fn run(stage: Stage, zio: &mut ActiveZio<'_>) -> Next {
    match stage {
        Stage::Open => Next::Continue,
        Stage::ReadBpInit => read_bp_init(zio),
        Stage::WriteBpInit => write_bp_init(zio),
        Stage::FreeBpInit => free_bp_init(zio),
        Stage::IssueAsync => issue_async(zio),
        Stage::WriteCompress => write_compress(zio),
        Stage::Encrypt => encrypt(zio),
        Stage::ChecksumGenerate => checksum_generate(zio),
        Stage::NopWrite => nop_write(zio),
        Stage::DdtReadStart => ddt::read_start(zio),
        Stage::DdtReadDone => ddt::read_done(zio),
        Stage::DdtWrite => ddt::write(zio),
        Stage::DdtFree => ddt::free(zio),
        Stage::GangAssemble => gang::assemble(zio),
        Stage::GangIssue => gang::issue(zio),
        Stage::DvaThrottle => throttle::dva_throttle(zio),
        Stage::DvaAllocate => dva_allocate(zio),
        Stage::DvaFree => dva_free(zio),
        Stage::DvaClaim => dva_claim(zio),
        Stage::Ready => ready(zio),
        Stage::VdevIoStart => vdev_io_start(zio),
        Stage::VdevIoDone => vdev_io_done(zio),
        Stage::VdevIoAssess => vdev_io_assess(zio),
        Stage::ChecksumVerify => checksum_verify(zio),
        Stage::Done => done(zio),
    }
}

fn fail(zio: &mut ActiveZio<'_>, error: ZioError) -> Next {
    zio.st.error = Some(error);
    zio.set_pipeline(INTERLOCK_PIPELINE);
    Next::Continue
}

// ==========================================================================
// Read and write setup
// ==========================================================================

fn read_bp_init(zio: &mut ActiveZio<'_>) -> Next {
    let Some(bp) = zio.st.bp.clone() else {
        return Next::Continue;
    };
    let logical = zio.node.is_logical();

    if bp.is_hole() {
        let size = zio.st.size as usize;
        zio.st.data.zero_range(0, size.min(zio.st.data.len()));
        zio.set_pipeline(INTERLOCK_PIPELINE);
        return Next::Continue;
    }

    if logical && !zio.st.flags.contains(ZioFlags::RAW) {
        let psize = bp.psize;
        if bp.compress != CompressKind::Off {
            let st = &mut *zio.st;
            transform::push(
                &mut st.transforms,
                &mut st.data,
                &mut st.size,
                Abd::alloc(psize as usize),
                psize,
                Undo::Decompress(bp.compress),
            );
        }
        if bp.crypt != CryptKind::Off {
            let Some(params) = bp.crypt_params else {
                return fail(zio, ZioError::Corrupt("encrypted block without parameters".to_string()));
            };
            let key = match zio.spa.keys.key(params.key_id) {
                Ok(key) => key,
                Err(_) if zio.st.flags.contains(ZioFlags::SPECULATIVE) => {
                    return fail(zio, ZioError::NotFound);
                }
                Err(e) => return fail(zio, e),
            };
            let st = &mut *zio.st;
            transform::push(
                &mut st.transforms,
                &mut st.data,
                &mut st.size,
                Abd::alloc(psize as usize),
                psize,
                Undo::Decrypt { key, params },
            );
        }
    }

    if !bp.is_metadata() && bp.level == 0 {
        zio.st.flags.insert(ZioFlags::DONT_CACHE);
    }

    if bp.dedup && logical {
        zio.set_pipeline(DDT_READ_PIPELINE);
    }

    Next::Continue
}

fn write_bp_init(zio: &mut ActiveZio<'_>) -> Next {
    if !zio.st.is_allocating() {
        return Next::Continue;
    }
    debug_assert!(zio.node.child_type != ChildType::Ddt);

    if let Some(ov) = zio.st.bp_override.clone() {
        let nopwrite = !ov.is_hole() && zio.st.prop.nopwrite;
        zio.st.bp = Some(ov);
        zio.set_pipeline(INTERLOCK_PIPELINE);
        if nopwrite {
            zio.st.flags.insert(ZioFlags::NOPWRITE);
        }
    }
    Next::Continue
}

fn free_bp_init(zio: &mut ActiveZio<'_>) -> Next {
    let dedup = zio.st.bp.as_ref().is_some_and(|bp| bp.dedup);
    if dedup && zio.node.is_logical() {
        zio.set_pipeline(DDT_FREE_PIPELINE);
    }
    Next::Continue
}

fn issue_async(zio: &mut ActiveZio<'_>) -> Next {
    executor::dispatch(zio.spa, zio.node, TaskqTier::Issue, false);
    Next::Stop
}

fn write_compress(zio: &mut ActiveZio<'_>) -> Next {
    // Members must have their pointers before a header can be encoded, and
    // logical children before the parent's data is final.
    if graph::wait_for_children(zio, ChildMask::LOGICAL | ChildMask::GANG, WaitType::Ready) {
        return Next::Stop;
    }

    if let Some(node) = zio.st.gang_header.clone() {
        let encoded = node.lock().header.encode();
        match encoded {
            Ok(block) => zio.st.data.copy_from_slice(0, &block),
            Err(e) => return fail(zio, e),
        }
    }

    if !zio.st.is_allocating() {
        return Next::Continue;
    }
    debug_assert!(zio.st.bp_override.is_none());

    let spa = zio.spa;
    let prop = zio.st.prop.clone();
    let lsize = zio.st.size;
    let mut compress = prop.compress;
    let mut psize = lsize;

    if compress != CompressKind::Off {
        let result = zio
            .st
            .data
            .with_slice(|s| compression::compress(compress, &s[..lsize as usize]));
        match result {
            Compressed::Zero => psize = 0,
            Compressed::Incompressible => compress = CompressKind::Off,
            Compressed::Data(mut packed) => {
                // Charge for the padding of the last sector.
                let rounded = p2roundup(packed.len() as u64, 1 << spa.min_ashift);
                if rounded >= lsize {
                    compress = CompressKind::Off;
                } else {
                    packed.resize(rounded as usize, 0);
                    psize = rounded;
                    let st = &mut *zio.st;
                    transform::push(
                        &mut st.transforms,
                        &mut st.data,
                        &mut st.size,
                        Abd::from_vec(packed),
                        rounded,
                        Undo::None,
                    );
                }
            }
        }
    }

    let orig_birth = zio.st.bp_orig.as_ref().map_or(0, |bp| bp.birth_txg);
    let mut bp = BlockPointer::hole();
    zio.set_pipeline(WRITE_PIPELINE);

    if psize == 0 {
        if orig_birth != 0 {
            bp.lsize = lsize;
            bp.object_type = prop.object_type;
            bp.level = prop.level;
            bp.birth_txg = zio.st.txg;
        }
        zio.st.bp = Some(bp);
        zio.set_pipeline(INTERLOCK_PIPELINE);
        return Next::Continue;
    }

    bp.lsize = lsize;
    bp.psize = psize;
    bp.compress = compress;
    bp.checksum_kind = prop.checksum;
    bp.object_type = prop.object_type;
    bp.level = prop.level;
    bp.dedup = prop.dedup;
    zio.st.bp = Some(bp);

    if prop.dedup {
        debug_assert!(zio.node.is_logical());
        debug_assert!(!zio.st.flags.contains(ZioFlags::IO_REWRITE));
        zio.set_pipeline(DDT_WRITE_PIPELINE);
    }
    if prop.nopwrite {
        debug_assert!(zio.node.is_logical());
        zio.st.pipeline.insert(Stage::NopWrite);
    }
    Next::Continue
}

fn encrypt(zio: &mut ActiveZio<'_>) -> Next {
    let prop = zio.st.prop.clone();
    if prop.crypt == CryptKind::Off || !zio.st.is_allocating() || !zio.node.is_logical() {
        return Next::Continue;
    }
    if zio.st.bp.as_ref().is_none_or(|bp| bp.psize == 0) {
        return Next::Continue;
    }

    let key = match zio.spa.keys.key(prop.key_id) {
        Ok(key) => key,
        Err(e) => return fail(zio, e),
    };
    let size = zio.st.size as usize;
    // Deduplicated blocks need identical ciphertext for identical data.
    let iv = if prop.dedup {
        zio.st.data.with_slice(|s| xxh3_64(&s[..size]))
    } else {
        zio.spa
            .iv_counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    };
    let (cipher, params) = zio
        .st
        .data
        .with_slice(|s| crypt::encrypt(prop.key_id, key, iv, &s[..size]));

    let st = &mut *zio.st;
    transform::push(
        &mut st.transforms,
        &mut st.data,
        &mut st.size,
        Abd::from_vec(cipher),
        size as u64,
        Undo::None,
    );
    if let Some(bp) = st.bp.as_mut() {
        bp.crypt = CryptKind::Keystream;
        bp.crypt_params = Some(params);
    }
    Next::Continue
}

fn checksum_generate(zio: &mut ActiveZio<'_>) -> Next {
    let size = zio.st.size as usize;
    let result = match zio.st.bp.as_mut() {
        None => {
            if zio.st.prop.checksum == ChecksumKind::Off {
                return Next::Continue;
            }
            debug_assert_eq!(zio.st.prop.checksum, ChecksumKind::Label);
            let verifier = zio.node.offset;
            zio.st.data.with_slice_mut(|s| checksum::embed(&mut s[..size], verifier))
        }
        Some(bp) if bp.is_gang() && zio.node.child_type == ChildType::Gang => {
            let verifier = bp.gang_verifier();
            zio.st.data.with_slice_mut(|s| checksum::embed(&mut s[..size], verifier))
        }
        Some(bp) => {
            let kind = bp.checksum_kind;
            bp.checksum = zio.st.data.with_slice(|s| checksum::compute(kind, &s[..size]));
            Ok(())
        }
    };
    match result {
        Ok(()) => Next::Continue,
        Err(e) => fail(zio, e),
    }
}

fn nop_write(zio: &mut ActiveZio<'_>) -> Next {
    let (Some(bp), Some(orig)) = (zio.st.bp.as_ref(), zio.st.bp_orig.as_ref()) else {
        return Next::Continue;
    };
    // The old block can stand in only if it was written the same way.
    if orig.is_hole()
        || !bp.checksum_kind.is_dedup_capable()
        || bp.checksum_kind != orig.checksum_kind
        || bp.compress != orig.compress
        || bp.crypt != orig.crypt
        || bp.dedup != orig.dedup
        || zio.st.prop.copies != orig.ndvas()
    {
        return Next::Continue;
    }
    if bp.checksum == orig.checksum && bp.psize == orig.psize {
        debug!("{}: nopwrite, block unchanged", zio.node.id);
        let orig = orig.clone();
        zio.st.bp = Some(orig);
        zio.set_pipeline(INTERLOCK_PIPELINE);
        zio.st.flags.insert(ZioFlags::NOPWRITE);
    }
    Next::Continue
}

// ==========================================================================
// Space
// ==========================================================================

fn dva_allocate(zio: &mut ActiveZio<'_>) -> Next {
    if zio.st.gang_leader.is_none() {
        debug_assert!(zio.node.child_type > ChildType::Gang);
        zio.st.gang_leader = Some(zio.node.id);
    }
    let spa = zio.spa;
    let size = zio.st.size;
    let copies = zio.st.prop.copies.clamp(1, spa.config.max_replication);

    match spa
        .allocator
        .allocate(zio.st.prop.alloc_class, size, copies, zio.st.txg)
    {
        Ok(dvas) => {
            let txg = zio.st.txg;
            let bp = zio.st.bp.get_or_insert_with(BlockPointer::hole);
            bp.dvas = dvas;
            bp.birth_txg = txg;
            gang::publish(zio);
        }
        Err(e) => {
            debug!(
                "{}: allocation failure for {}: size {}, error {}",
                spa.name, zio.node.id, size, e
            );
            if e == ZioError::NoSpace && size > SPA_MINBLOCKSIZE {
                return gang::write_gang_block(zio);
            }
            zio.st.error = Some(e);
        }
    }
    Next::Continue
}

fn dva_free(zio: &mut ActiveZio<'_>) -> Next {
    if let Some(bp) = zio.st.bp.as_ref() {
        if !bp.is_hole() {
            zio.spa.allocator.free(&bp.dvas, zio.st.txg);
        }
    }
    Next::Continue
}

fn dva_claim(zio: &mut ActiveZio<'_>) -> Next {
    let result = match zio.st.bp.as_ref() {
        Some(bp) if !bp.is_hole() => zio.spa.allocator.claim(&bp.dvas, zio.st.txg),
        _ => Ok(()),
    };
    if let Err(e) = result {
        zio.st.error = Some(e);
    }
    Next::Continue
}

// ==========================================================================
// Interlocks
// ==========================================================================

pub(crate) fn run_callback(zio: &mut ActiveZio<'_>, cb: &mut Callback) {
    match cb {
        Callback::User(f) => f(&zio.view()),
        Callback::GangHeaderRead { node, leader } => gang::header_read_done(zio, node, *leader),
        Callback::DdtLeadReady { entry } => ddt::lead_ready(zio, entry),
        Callback::DdtLeadDone { entry } => ddt::lead_done(zio, entry),
        Callback::MirrorChild { map, index } => map.record(*index, zio.st.error.clone()),
    }
}

fn ready(zio: &mut ActiveZio<'_>) -> Next {
    if graph::wait_for_children(zio, ChildMask::GANG | ChildMask::DDT, WaitType::Ready) {
        return Next::Stop;
    }
    let spa = zio.spa;
    let node = zio.node;

    if let Some(entry) = zio.st.ddt_entry.take() {
        let e = entry.lock();
        if let (Some(phys), Some(bp)) = (e.phys.as_ref(), zio.st.bp.as_mut()) {
            bp.dvas = phys.dvas.clone();
            bp.birth_txg = phys.birth;
        }
    }

    gang::publish(zio);

    if let Some(mut cb) = zio.st.ready.take() {
        run_callback(zio, &mut cb);
        zio.st.ready = Some(cb);
    }

    if zio.st.error.is_some() {
        zio.set_pipeline(INTERLOCK_PIPELINE);
    }

    let (parents, reexecute, reservation) = {
        let mut sync = node.sync.lock();
        sync.reached[WaitType::Ready.index()] = true;
        sync.advance(LifecycleEvent::ReachReady);
        (sync.parents.clone(), sync.reexecute, sync.alloc_reserved.take())
    };
    if let Some(reservation) = reservation {
        throttle::release(spa, reservation);
    }

    let notice = Notice {
        wait: WaitType::Ready,
        error: zio.st.error.as_ref(),
        flags: zio.st.flags,
        reexecute,
        detach: false,
    };
    for pid in parents {
        if let Some(parent) = graph::notify_parent(spa, node, pid, &notice) {
            executor::schedule(spa, &parent);
        }
    }

    if zio.st.flags.contains(ZioFlags::NODATA) {
        if zio.st.bp.as_ref().is_some_and(BlockPointer::is_gang) {
            zio.st.flags.remove(ZioFlags::NODATA);
        } else {
            zio.st.pipeline = zio.st.pipeline.without(VDEV_IO_STAGES);
        }
    }

    Next::Continue
}

fn done(zio: &mut ActiveZio<'_>) -> Next {
    // Waits in child type order: device, gang, dedup, logical.
    if graph::wait_for_children(zio, ChildMask::ALL, WaitType::Done) {
        return Next::Stop;
    }
    let spa = zio.spa;
    let node = zio.node;

    {
        let sync = node.sync.lock();
        for ct in [ChildType::Vdev, ChildType::Gang, ChildType::Ddt] {
            if zio.st.error.is_none() {
                zio.st.error = sync.child_error[ct.index()].clone();
            }
        }
    }

    {
        let flags = zio.st.flags;
        let st = &mut *zio.st;
        transform::pop_all(
            &mut st.transforms,
            &mut st.data,
            &mut st.size,
            node.io_type,
            flags,
            &mut st.error,
        );
    }

    // A failed logical request decides here whether to be run again.
    let mut own_reexecute = 0u8;
    if let (Some(err), true) = (zio.st.error.as_ref(), node.is_logical()) {
        let flags = zio.st.flags;
        if zio.st.is_allocating() && !flags.contains(ZioFlags::CANFAIL) {
            own_reexecute |= if *err == ZioError::NoSpace {
                REEXECUTE_SUSPEND
            } else {
                REEXECUTE_NOW
            };
        }
        if matches!(node.io_type, ZioType::Read | ZioType::Free)
            && !flags.contains(ZioFlags::SCAN_THREAD)
            && *err == ZioError::DeviceUnavailable
            && spa.config.failure_mode != FailureMode::Continue
        {
            own_reexecute |= REEXECUTE_SUSPEND;
        }
        if !flags.contains(ZioFlags::CANFAIL) && own_reexecute == 0 {
            own_reexecute |= REEXECUTE_SUSPEND;
        }
    }

    let mut reexecute = {
        let mut sync = node.sync.lock();
        sync.reexecute |= own_reexecute;
        if zio.st.error.is_none() {
            zio.st.error = sync.child_error[ChildType::Logical.index()].clone();
        }
        sync.reexecute
    };

    if (zio.st.error.is_some() || reexecute != 0)
        && zio.st.is_allocating()
        && zio.st.gang_leader == Some(node.id)
        && !zio
            .st
            .flags
            .intersects(ZioFlags::IO_REWRITE | ZioFlags::NOPWRITE)
    {
        if let Some(bp) = zio.st.bp.clone() {
            gang::dva_unallocate(spa, zio.st.txg, zio.st.gang_tree.as_ref(), &bp);
        }
    }
    zio.st.gang_tree = None;

    // Godfathers never suspend.
    if node.godfather && reexecute & REEXECUTE_SUSPEND != 0 {
        reexecute = 0;
        node.sync.lock().reexecute = 0;
    }

    if reexecute != 0 {
        return done_reexecute(zio, reexecute);
    }

    if let Some(mut cb) = zio.st.done.take() {
        run_callback(zio, &mut cb);
    }

    let result = match zio.st.error.clone() {
        Some(e) => Err(e),
        None => Ok(Completed {
            bp: zio.st.bp.clone(),
            trace: std::mem::take(&mut zio.st.trace),
        }),
    };

    let (parents, leftover) = {
        let mut sync = node.sync.lock();
        sync.reached[WaitType::Done.index()] = true;
        sync.advance(if result.is_ok() {
            LifecycleEvent::Complete
        } else {
            LifecycleEvent::Fail
        });
        (sync.parents.clone(), sync.alloc_reserved.take())
    };
    if let Some(reservation) = leftover {
        throttle::release(spa, reservation);
    }

    let notice = Notice {
        wait: WaitType::Done,
        error: zio.st.error.as_ref(),
        flags: zio.st.flags,
        reexecute: 0,
        detach: true,
    };
    let mut handoff = None;
    for pid in parents {
        let Some(parent) = graph::notify_parent(spa, node, pid, &notice) else {
            continue;
        };
        let same_kind = parent.io_type == node.io_type || parent.io_type == ZioType::Null;
        if handoff.is_none() && same_kind {
            handoff = Some(parent.id);
        } else {
            executor::schedule(spa, &parent);
        }
    }

    let mut sync = node.sync.lock();
    if sync.waiter {
        sync.result = Some(result);
        node.cv.notify_all();
    } else if let Some(tx) = sync.async_waiter.take() {
        drop(sync);
        // The receiver may have been dropped; the result is then discarded.
        let _ = tx.send(result);
        spa.arena.remove(node.id);
    } else {
        drop(sync);
        spa.arena.remove(node.id);
    }

    match handoff {
        Some(pid) => Next::Handoff(pid),
        None => Next::Stop,
    }
}

fn done_reexecute(zio: &mut ActiveZio<'_>, reexecute: u8) -> Next {
    debug_assert!(zio.node.is_logical());
    let spa = zio.spa;
    let node = zio.node;
    zio.st.gang_leader = None;

    let parents = {
        let mut sync = node.sync.lock();
        sync.reached[WaitType::Done.index()] = true;
        sync.advance(LifecycleEvent::RequestReexecute);
        sync.parents.clone()
    };

    // A godfather must not wait on a request that is going to run again.
    let mut remaining = Vec::with_capacity(parents.len());
    for pid in parents {
        match spa.arena.get(pid) {
            Some(parent) if parent.godfather => {
                let notice = Notice {
                    wait: WaitType::Done,
                    error: None,
                    flags: ZioFlags::DONT_PROPAGATE,
                    reexecute: 0,
                    detach: true,
                };
                if let Some(parent) = graph::notify_parent(spa, node, pid, &notice) {
                    executor::schedule(spa, &parent);
                }
            }
            Some(_) => remaining.push(pid),
            None => {}
        }
    }

    if !remaining.is_empty() {
        // Not a root: the parent will reexecute us top-down. Our failure is
        // not final, so it is not propagated.
        debug_assert_eq!(remaining.len(), 1);
        zio.st.flags.insert(ZioFlags::DONT_PROPAGATE);
        let notice = Notice {
            wait: WaitType::Done,
            error: zio.st.error.as_ref(),
            flags: zio.st.flags,
            reexecute,
            detach: false,
        };
        for pid in remaining {
            if let Some(parent) = graph::notify_parent(spa, node, pid, &notice) {
                executor::schedule(spa, &parent);
            }
        }
    } else if reexecute & REEXECUTE_SUSPEND != 0 {
        let reason = match zio.st.error.as_ref() {
            Some(e) => format!("{:?} request {} failed: {}", node.io_type, node.id, e),
            None => format!("{:?} request {} failed", node.io_type, node.id),
        };
        suspend::suspend_zio(spa, Some(node), &reason);
    } else {
        info!(
            "{}: reexecuting {:?} request {} after {:?}",
            spa.name, node.io_type, node.id, zio.st.error
        );
        let spa_clone = Arc::clone(spa);
        let id = node.id;
        spa.taskqs.dispatch(
            ZioType::Claim,
            TaskqTier::Issue,
            Box::new(move || suspend::reexecute(&spa_clone, id)),
            false,
        );
    }
    Next::Stop
}

// ==========================================================================
// Device I/O
// ==========================================================================

fn vdev_io_start(zio: &mut ActiveZio<'_>) -> Next {
    debug_assert!(zio.st.error.is_none());
    let spa = zio.spa;

    let Some(vd) = zio.node.vd.clone() else {
        if !zio.st.flags.contains(ZioFlags::CONFIG_WRITER) {
            spa.config_lock.r_lock();
            zio.st.config_held = true;
        }
        let root = Arc::clone(&spa.root_vdev);
        root.ops().io_start(zio);
        return Next::Continue;
    };

    let io_type = zio.node.io_type;
    let is_data = matches!(io_type, ZioType::Read | ZioType::Write);
    let align = 1u64 << vd.ashift();
    let size = zio.st.size;

    // Logical sizes become whole sectors on the way to a device.
    if is_data && !zio.st.flags.contains(ZioFlags::PHYSICAL) && p2phase(size, align) != 0 {
        let asize = p2roundup(size, align);
        let padded = Abd::alloc(asize as usize);
        if io_type == ZioType::Write {
            padded.copy_from(&zio.st.data, size as usize);
        }
        let st = &mut *zio.st;
        transform::push(
            &mut st.transforms,
            &mut st.data,
            &mut st.size,
            padded,
            asize,
            Undo::Subblock,
        );
    }

    if !vd.is_leaf() {
        vd.ops().io_start(zio);
        return Next::Continue;
    }

    if is_data {
        vd.stats().record_attempt(io_type);
        if !vd.is_accessible() {
            zio.begin_device_io().complete(Err(ZioError::DeviceUnavailable));
            return Next::Stop;
        }
    }
    vd.ops().io_start(zio);
    Next::Stop
}

fn vdev_io_done(zio: &mut ActiveZio<'_>) -> Next {
    if graph::wait_for_children(zio, ChildMask::VDEV, WaitType::Done) {
        return Next::Stop;
    }

    let device_result = zio.node.sync.lock().device_result.take();
    if let Some(Err(e)) = device_result {
        if zio.st.error.is_none() {
            zio.st.error = Some(e);
        }
    }

    match zio.node.vd.clone() {
        Some(vd) => {
            if vd.is_leaf() && zio.st.error.is_some() && !vd.is_accessible() {
                zio.st.error = Some(ZioError::DeviceUnavailable);
            }
            vd.ops().io_done(zio);
        }
        None => {
            let root = Arc::clone(&zio.spa.root_vdev);
            root.ops().io_done(zio);
        }
    }
    Next::Continue
}

fn vdev_io_assess(zio: &mut ActiveZio<'_>) -> Next {
    if graph::wait_for_children(zio, ChildMask::VDEV, WaitType::Done) {
        return Next::Stop;
    }
    let spa = zio.spa;
    let vd = zio.node.vd.clone();

    if zio.st.config_held {
        spa.config_lock.r_unlock();
        zio.st.config_held = false;
    }
    zio.st.vsd = None;

    // A failed logical I/O gets one more attempt, ahead of queued work.
    if zio.st.error.is_some()
        && vd.is_none()
        && !zio
            .st
            .flags
            .intersects(ZioFlags::DONT_RETRY | ZioFlags::IO_RETRY)
    {
        debug!(
            "{}: retrying {:?} request {} after {:?}",
            spa.name, zio.node.io_type, zio.node.id, zio.st.error
        );
        zio.st.error = None;
        zio.st
            .flags
            .insert(ZioFlags::IO_RETRY | ZioFlags::DONT_CACHE | ZioFlags::DONT_AGGREGATE);
        zio.set_stage_before(Stage::VdevIoStart);
        executor::dispatch(
            spa,
            zio.node,
            TaskqTier::Issue,
            spa.config.requeue_io_start_cut_in_line,
        );
        return Next::Stop;
    }

    if let Some(vd) = &vd {
        if zio.st.error.is_some() && vd.is_leaf() && !vd.is_accessible() {
            if zio.st.error != Some(ZioError::DeviceUnavailable) {
                debug!(
                    "{}: device {} inaccessible, reporting {:?} as unavailable",
                    spa.name,
                    vd.id(),
                    zio.st.error
                );
            }
            zio.st.error = Some(ZioError::DeviceUnavailable);
        }
        if zio.st.error == Some(ZioError::DeviceUnavailable)
            && zio.node.io_type == ZioType::Write
            && !vd.is_leaf()
        {
            warn!("{}: cannot write to device {}", spa.name, vd.id());
            spa.allocator.set_cant_write(vd.id(), true);
        }
    }

    if zio.st.error.is_some() {
        zio.set_pipeline(INTERLOCK_PIPELINE);
    }
    Next::Continue
}

fn checksum_verify(zio: &mut ActiveZio<'_>) -> Next {
    let result = match zio.st.bp.as_ref() {
        None => {
            if zio.st.prop.checksum == ChecksumKind::Off {
                return Next::Continue;
            }
            debug_assert_eq!(zio.st.prop.checksum, ChecksumKind::Label);
            let size = zio.st.size as usize;
            let verifier = zio.node.offset;
            zio.st
                .data
                .with_slice(|s| checksum::verify_embedded(&s[..size.min(s.len())], verifier))
        }
        Some(bp) if bp.is_gang() => {
            let verifier = bp.gang_verifier();
            let len = SPA_GANGBLOCKSIZE as usize;
            zio.st
                .data
                .with_slice(|s| checksum::verify_embedded(&s[..len.min(s.len())], verifier))
        }
        Some(bp) => {
            let psize = bp.psize as usize;
            zio.st.data.with_slice(|s| {
                checksum::verify(bp.checksum_kind, &s[..psize.min(s.len())], &bp.checksum)
            })
        }
    };

    if let Err(e) = result {
        if let Some(vd) = zio.node.vd.as_ref() {
            vd.stats().record_checksum_error();
        }
        if !zio.st.flags.contains(ZioFlags::SPECULATIVE) {
            debug!("{}: checksum error on {}", zio.spa.name, zio.node.id);
        }
        zio.st.error = Some(e);
    }
    Next::Continue
}
