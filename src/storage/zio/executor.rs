//! Runs requests through their pipelines.
//!
//! A thread that starts a request becomes its executor and keeps running
//! runnable requests from a thread-local worklist until the list drains.
//! Requests made runnable by completions are appended to that list rather
//! than run recursively; once the list reaches the configured limit, further
//! work goes to a worker queue instead. Done hands control directly to a
//! parent of the same kind without touching the list.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use log::trace;
use tokio::sync::oneshot;

use crate::common::exception::ZioError;
use crate::storage::pool::Spa;

use super::arena::ZioId;
use super::request::{ActiveZio, Completed, QueuedTask, ZioNode};
use super::stages::{self, Next};
use super::suspend::{self, Admission};
use super::taskq::{self, TaskqTier};
use super::types::{LifecycleEvent, Priority, Stage};
use super::deadman;

thread_local! {
    static WORKLIST: RefCell<Option<VecDeque<(Arc<Spa>, ZioId)>>> = const { RefCell::new(None) };
}

fn in_executor() -> bool {
    WORKLIST.with(|w| w.borrow().is_some())
}

/// Completes an outstanding device operation. Handed to device code by
/// [`ActiveZio::begin_device_io`]; may be completed from any thread.
#[must_use = "a device operation must be completed"]
pub struct IoCompletion {
    spa: Weak<Spa>,
    id: ZioId,
}

impl IoCompletion {
    pub(crate) fn new(spa: Weak<Spa>, id: ZioId) -> Self {
        Self { spa, id }
    }

    pub fn id(&self) -> ZioId {
        self.id
    }

    /// Delivers the device result. Late or duplicate completions are ignored.
    pub fn complete(self, result: Result<(), ZioError>) {
        if let Some(spa) = self.spa.upgrade() {
            complete_device_io(&spa, self.id, result);
        }
    }
}

impl std::fmt::Debug for IoCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoCompletion").field("id", &self.id).finish()
    }
}

/// Accepts the first completion of a pending device operation and resumes
/// the request on the interrupt tier. Returns false if none was pending.
pub(crate) fn complete_device_io(spa: &Arc<Spa>, id: ZioId, result: Result<(), ZioError>) -> bool {
    let Some(node) = spa.arena.get(id) else {
        return false;
    };
    {
        let mut sync = node.sync.lock();
        if !sync.device_pending {
            trace!("ignoring late device completion for {}", id);
            return false;
        }
        sync.device_pending = false;
        sync.device_result = Some(result);
    }
    dispatch(spa, &node, TaskqTier::Interrupt, false);
    true
}

/// Hands the request to a worker queue of its kind.
pub(crate) fn dispatch(spa: &Arc<Spa>, node: &ZioNode, tier: TaskqTier, cut_in_line: bool) {
    let tier = if node.priority() == Priority::Now {
        tier.high()
    } else {
        tier
    };
    let ticket = Arc::new(AtomicBool::new(false));
    node.sync.lock().queued = Some(QueuedTask {
        tier,
        ticket: Arc::clone(&ticket),
    });
    let spa_clone = Arc::clone(spa);
    let id = node.id;
    spa.taskqs.dispatch(
        node.taskq_type,
        tier,
        Box::new(move || {
            if ticket.swap(true, Ordering::AcqRel) {
                trace!("{} moved to another queue; dropping stale entry", id);
                return;
            }
            run_executor(&spa_clone, id)
        }),
        cut_in_line,
    );
}

/// Moves a request promoted to [`Priority::Now`] from a normal-tier queue
/// to the high tier. Returns false if it was not waiting on a normal queue.
pub(crate) fn requeue_promoted(spa: &Arc<Spa>, node: &ZioNode) -> bool {
    let tier = {
        let mut sync = node.sync.lock();
        match sync.queued.take() {
            Some(q) if !q.tier.is_high() && !q.ticket.swap(true, Ordering::AcqRel) => q.tier,
            other => {
                sync.queued = other;
                return false;
            }
        }
    };
    trace!("{} promoted off the {:?} queue", node.id, tier);
    dispatch(spa, node, tier.high(), true);
    true
}

/// Tier for a request woken by another: issue work until it reaches the
/// device stages, interrupt work after.
fn wake_tier(node: &ZioNode) -> TaskqTier {
    if node.stage_hint() < Stage::VdevIoStart {
        TaskqTier::Issue
    } else {
        TaskqTier::Interrupt
    }
}

/// Makes a request runnable: on this thread's worklist if there is room,
/// otherwise on a worker queue. Outside any executor, runs it right here.
pub(crate) fn schedule(spa: &Arc<Spa>, node: &ZioNode) {
    enum Placed {
        Queued,
        Full,
        NoExecutor,
    }
    let placed = WORKLIST.with(|w| match w.borrow_mut().as_mut() {
        Some(list) if list.len() < spa.config.worklist_limit => {
            list.push_back((Arc::clone(spa), node.id));
            Placed::Queued
        }
        Some(_) => Placed::Full,
        None => Placed::NoExecutor,
    });
    match placed {
        Placed::Queued => {}
        Placed::Full => dispatch(spa, node, wake_tier(node), false),
        Placed::NoExecutor => run_executor(spa, node.id),
    }
}

/// Drives `id` and everything it makes runnable until the worklist drains.
/// Called re-entrantly, it only queues.
fn run_executor(spa: &Arc<Spa>, id: ZioId) {
    let nested = WORKLIST.with(|w| {
        let mut w = w.borrow_mut();
        match w.as_mut() {
            Some(list) => {
                list.push_back((Arc::clone(spa), id));
                true
            }
            None => {
                *w = Some(VecDeque::new());
                false
            }
        }
    });
    if nested {
        return;
    }

    let mut next = Some((Arc::clone(spa), id));
    while let Some((spa, id)) = next.take() {
        next = match run_zio(&spa, id) {
            Some(handoff) => Some((spa, handoff)),
            None => WORKLIST.with(|w| w.borrow_mut().as_mut().and_then(|l| l.pop_front())),
        };
    }
    WORKLIST.with(|w| *w.borrow_mut() = None);
}

/// Moves everything queued on this thread to worker queues, so the thread
/// can block.
fn drain_worklist() {
    let drained: Vec<(Arc<Spa>, ZioId)> =
        WORKLIST.with(|w| w.borrow_mut().as_mut().map(|l| l.drain(..).collect()).unwrap_or_default());
    for (spa, id) in drained {
        if let Some(node) = spa.arena.get(id) {
            dispatch(&spa, &node, wake_tier(&node), false);
        }
    }
}

/// Runs stages of one request until it parks, finishes, or hands off.
/// Returns the parent to continue with on a handoff.
fn run_zio(spa: &Arc<Spa>, id: ZioId) -> Option<ZioId> {
    let node = spa.arena.get(id)?;
    let mut guard = node.state.lock();
    let mut zio = ActiveZio {
        spa,
        node: &node,
        st: &mut guard,
    };

    loop {
        let stage = zio.st.pipeline.next_after(zio.st.stage)?;

        // Stages that may block must not tie up an interrupt thread.
        if stage.is_blocking()
            && node.vd.is_none()
            && taskq::current_tier().is_some_and(TaskqTier::is_interrupt)
        {
            let cut = stage == Stage::VdevIoStart && spa.config.requeue_io_start_cut_in_line;
            dispatch(spa, &node, TaskqTier::Issue, cut);
            return None;
        }

        zio.set_stage(stage);
        if spa.config.trace_stages {
            zio.st.trace.push(stage);
        }

        match stages::run(stage, &mut zio) {
            Next::Continue => continue,
            Next::Handoff(parent) => return Some(parent),
            Next::Stop => return None,
        }
    }
}

/// Marks the request submitted and makes it runnable.
pub(crate) fn execute(spa: &Arc<Spa>, node: &ZioNode) {
    {
        let mut sync = node.sync.lock();
        sync.timestamp = Some(Instant::now());
        sync.advance(LifecycleEvent::Submit);
    }
    schedule(spa, node);
}

/// Submits without waiting. A parentless logical request is adopted by one
/// of the pool's godfather roots so the pool can drain it on close.
pub(crate) fn nowait(spa: &Arc<Spa>, node: &Arc<ZioNode>) {
    if suspend::admit(spa, node, false) == Admission::Parked {
        return;
    }
    adopt(spa, node);
    execute(spa, node);
}

pub(crate) fn adopt(spa: &Arc<Spa>, node: &ZioNode) {
    if !node.is_logical() || node.godfather {
        return;
    }
    {
        let sync = node.sync.lock();
        if !sync.parents.is_empty() || sync.waiter || sync.async_waiter.is_some() {
            return;
        }
    }
    if let Some(root) = spa.next_godfather() {
        super::graph::add_child(&root, node);
    }
}

/// Submits and blocks until the request is done. The request is destroyed
/// on return.
pub(crate) fn wait(spa: &Arc<Spa>, node: Arc<ZioNode>) -> Result<Completed, ZioError> {
    suspend::admit(spa, &node, true);
    node.sync.lock().waiter = true;

    if in_executor() {
        // Queued work on this thread must not wait behind us.
        drain_worklist();
        {
            let mut sync = node.sync.lock();
            sync.timestamp = Some(Instant::now());
            sync.advance(LifecycleEvent::Submit);
        }
        dispatch(spa, &node, TaskqTier::Issue, false);
    } else {
        execute(spa, &node);
    }

    let deadman = &spa.config.deadman;
    let mut sync = node.sync.lock();
    let result = loop {
        if let Some(result) = sync.result.take() {
            break result;
        }
        if !deadman.enabled {
            node.cv.wait(&mut sync);
            continue;
        }
        let timed_out = node.cv.wait_for(&mut sync, deadman.checktime).timed_out();
        let overdue = sync
            .timestamp
            .is_some_and(|t| t.elapsed() >= deadman.synctime);
        if timed_out && overdue && sync.result.is_none() {
            drop(sync);
            deadman::check(spa, &node);
            sync = node.sync.lock();
        }
    };
    drop(sync);

    spa.arena.remove(node.id);
    result
}

/// Submits on a worker queue and resolves when the request is done.
pub(crate) async fn wait_async(spa: Arc<Spa>, node: Arc<ZioNode>) -> Result<Completed, ZioError> {
    let (tx, rx) = oneshot::channel();
    node.sync.lock().async_waiter = Some(tx);

    if suspend::admit(&spa, &node, false) != Admission::Parked {
        {
            let mut sync = node.sync.lock();
            sync.timestamp = Some(Instant::now());
            sync.advance(LifecycleEvent::Submit);
        }
        dispatch(&spa, &node, TaskqTier::Issue, false);
    }

    match rx.await {
        Ok(result) => result,
        Err(_) => Err(ZioError::Io),
    }
}
