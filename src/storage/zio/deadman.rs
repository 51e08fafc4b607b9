//! Hung I/O detection.
//!
//! A blocking waiter that has waited past the configured sync time walks its
//! request tree looking for device operations that have been outstanding at
//! least that long, reports them, and reacts per the deadman fail mode.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use log::{error, warn};

use crate::common::config::DeadmanFailMode;
use crate::common::exception::ZioError;
use crate::storage::pool::Spa;

use super::arena::ZioId;
use super::executor;
use super::request::ZioNode;
use super::types::Stage;

/// A device operation outstanding longer than the sync time.
#[derive(Debug, Clone)]
pub struct SlowIo {
    pub id: ZioId,
    pub vdev: u64,
    pub offset: u64,
    /// Where the operation is parked.
    pub stage: Stage,
    pub age: Duration,
}

fn collect_stuck(spa: &Spa, roots: Vec<Arc<ZioNode>>, synctime: Duration) -> Vec<SlowIo> {
    let mut seen: HashSet<ZioId> = roots.iter().map(|n| n.id).collect();
    let mut stack = roots;
    let mut stuck = Vec::new();

    while let Some(node) = stack.pop() {
        let (kids, pending, started) = {
            let sync = node.sync.lock();
            (sync.kids.clone(), sync.device_pending, sync.timestamp)
        };
        if let (true, Some(vd), Some(started)) = (pending, node.vd.as_ref(), started) {
            let age = started.elapsed();
            if vd.is_leaf() && age >= synctime {
                stuck.push(SlowIo {
                    id: node.id,
                    vdev: vd.id(),
                    offset: node.offset,
                    stage: node.stage_hint(),
                    age,
                });
            }
        }
        for kid in kids {
            if seen.insert(kid) {
                if let Some(child) = spa.arena.get(kid) {
                    stack.push(child);
                }
            }
        }
    }
    stuck
}

fn react(spa: &Arc<Spa>, stuck: &[SlowIo]) {
    for io in stuck {
        warn!(
            "{}: slow I/O {} on vdev {} at offset {:#x} in {:?}, outstanding {:?}",
            spa.name, io.id, io.vdev, io.offset, io.stage, io.age
        );
    }
    if stuck.is_empty() {
        return;
    }
    match spa.config.deadman.failmode {
        DeadmanFailMode::Wait => {}
        DeadmanFailMode::Continue => {
            for io in stuck {
                executor::complete_device_io(spa, io.id, Err(ZioError::TimedOut));
            }
        }
        DeadmanFailMode::Panic => {
            error!("{}: deadman found {} hung I/Os", spa.name, stuck.len());
            panic!(
                "I/O to pool '{}' appears to be hung: {} device operations outstanding",
                spa.name,
                stuck.len()
            );
        }
    }
}

/// Checks the tree under a request whose waiter has waited too long.
pub(crate) fn check(spa: &Arc<Spa>, node: &Arc<ZioNode>) -> Vec<SlowIo> {
    warn!(
        "{}: {:?} request {} has not completed after {:?} (at {:?})",
        spa.name,
        node.io_type,
        node.id,
        node.sync.lock().timestamp.map(|t| t.elapsed()),
        node.stage_hint()
    );
    let stuck = collect_stuck(spa, vec![Arc::clone(node)], spa.config.deadman.synctime);
    react(spa, &stuck);
    stuck
}

/// Checks every in-flight request in the pool.
pub(crate) fn check_pool(spa: &Arc<Spa>) -> Vec<SlowIo> {
    let live: Vec<Arc<ZioNode>> = spa
        .arena
        .ids()
        .into_iter()
        .filter_map(|id| spa.arena.get(id))
        .collect();
    let stuck = collect_stuck(spa, live, spa.config.deadman.synctime);
    react(spa, &stuck);
    stuck
}
