//! Allocation throttle.
//!
//! Allocating writes reserve one slot per copy in an allocator shard before
//! DVA_ALLOCATE. When a shard is full, writers queue in bookmark traversal
//! order and are admitted as reservations are released at READY, so blocks
//! of one object tend to be laid out in logical order.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use log::trace;
use parking_lot::Mutex;

use crate::common::config::ThrottleConfig;
use crate::storage::allocator::AllocClass;
use crate::storage::blkptr::Bookmark;
use crate::storage::pool::Spa;

use super::arena::ZioId;
use super::executor;
use super::request::ActiveZio;
use super::stages::Next;
use super::taskq::TaskqTier;
use super::types::{Priority, ZioFlags};

/// Slots held by an admitted write until it reaches READY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Reservation {
    class: AllocClass,
    shard: usize,
    slots: u64,
}

#[derive(PartialEq, Eq)]
struct QueueKey {
    bookmark: Bookmark,
    seq: u64,
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bookmark
            .default_traversal_cmp(&other.bookmark)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct Shard {
    reserved: u64,
    queue: BTreeMap<QueueKey, (ZioId, u64)>,
}

pub(crate) struct Throttle {
    enabled: bool,
    nshards: usize,
    limit: u64,
    seq: AtomicU64,
    shards: Mutex<HashMap<(AllocClass, usize), Shard>>,
}

impl Throttle {
    pub(crate) fn new(config: &ThrottleConfig) -> Self {
        Self {
            enabled: config.enabled,
            nshards: config.shards.max(1),
            limit: config.slots_per_shard.max(1),
            seq: AtomicU64::new(0),
            shards: Mutex::new(HashMap::new()),
        }
    }

    /// Blocks of one object share a shard so their queue order is meaningful.
    fn shard_for(&self, bookmark: &Bookmark) -> usize {
        let h = bookmark.objset.rotate_left(17) ^ bookmark.object;
        (h % self.nshards as u64) as usize
    }

    fn enqueue(&self, class: AllocClass, shard: usize, bookmark: Bookmark, id: ZioId, slots: u64) {
        let key = QueueKey {
            bookmark,
            seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
        };
        self.shards
            .lock()
            .entry((class, shard))
            .or_default()
            .queue
            .insert(key, (id, slots));
    }

    /// Admits queued writers, in order, while they fit.
    fn admit(&self, class: AllocClass, shard: usize) -> Vec<(ZioId, Reservation)> {
        let mut shards = self.shards.lock();
        let Some(s) = shards.get_mut(&(class, shard)) else {
            return Vec::new();
        };
        let mut admitted = Vec::new();
        while let Some(entry) = s.queue.first_entry() {
            let (id, slots) = *entry.get();
            // An idle shard always admits, however large the request.
            if s.reserved > 0 && s.reserved + slots > self.limit {
                break;
            }
            entry.remove();
            s.reserved += slots;
            admitted.push((id, Reservation { class, shard, slots }));
        }
        admitted
    }

    fn release_slots(&self, reservation: &Reservation) {
        let mut shards = self.shards.lock();
        if let Some(s) = shards.get_mut(&(reservation.class, reservation.shard)) {
            debug_assert!(s.reserved >= reservation.slots);
            s.reserved = s.reserved.saturating_sub(reservation.slots);
        }
    }

    pub(crate) fn reserved(&self) -> u64 {
        self.shards.lock().values().map(|s| s.reserved).sum()
    }

    pub(crate) fn queued(&self) -> usize {
        self.shards.lock().values().map(|s| s.queue.len()).sum()
    }
}

/// Hands admitted writers their reservations and wakes the ones parked in
/// this stage. Returns the reservation for `me`, if it was admitted.
fn wake_admitted(
    spa: &Arc<Spa>,
    admitted: Vec<(ZioId, Reservation)>,
    me: Option<ZioId>,
) -> Option<Reservation> {
    let mut mine = None;
    for (id, reservation) in admitted {
        if Some(id) == me {
            mine = Some(reservation);
            continue;
        }
        match spa.arena.get(id) {
            Some(node) => {
                node.sync.lock().alloc_reserved = Some(reservation);
                executor::dispatch(spa, &node, TaskqTier::Issue, false);
            }
            None => spa.throttle.release_slots(&reservation),
        }
    }
    mine
}

pub(crate) fn dva_throttle(zio: &mut ActiveZio<'_>) -> Next {
    let spa = zio.spa;
    let throttle = &spa.throttle;
    if !throttle.enabled
        || zio.priority() == Priority::SyncWrite
        || zio.st.flags.intersects(ZioFlags::GANG_CHILD | ZioFlags::NODATA)
    {
        return Next::Continue;
    }
    // Admitted while parked here.
    if zio.node.sync.lock().alloc_reserved.is_some() {
        return Next::Continue;
    }

    let class = zio.st.prop.alloc_class;
    let shard = throttle.shard_for(&zio.st.bookmark);
    let slots = zio.st.prop.copies.clamp(1, spa.config.max_replication) as u64;
    throttle.enqueue(class, shard, zio.st.bookmark, zio.node.id, slots);

    let admitted = throttle.admit(class, shard);
    match wake_admitted(spa, admitted, Some(zio.node.id)) {
        Some(reservation) => {
            zio.node.sync.lock().alloc_reserved = Some(reservation);
            Next::Continue
        }
        None => {
            trace!("{}: {} waiting for allocation slots", spa.name, zio.node.id);
            Next::Stop
        }
    }
}

/// Returns a reservation's slots and admits whoever now fits.
pub(crate) fn release(spa: &Arc<Spa>, reservation: Reservation) {
    spa.throttle.release_slots(&reservation);
    let admitted = spa.throttle.admit(reservation.class, reservation.shard);
    wake_admitted(spa, admitted, None);
}
