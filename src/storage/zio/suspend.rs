//! Pool suspension and request reexecution.
//!
//! A request that fails in a way that must not be reported to its caller is
//! parked under the pool's suspend root until the pool is resumed, then run
//! again from the top with its original pipeline.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::common::config::FailureMode;
use crate::common::exception::{PoolError, ZioError};
use crate::storage::pool::Spa;

use super::arena::ZioId;
use super::construct;
use super::executor;
use super::graph;
use super::request::ZioNode;
use super::types::{LifecycleEvent, Stage, WaitType, ZioFlags, ZioType, INTERLOCK_PIPELINE};

/// Pool-wide I/O admission state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolIoState {
    Active,
    Suspended,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEvent {
    Suspend,
    Resume,
    Close,
}

impl PoolIoState {
    pub fn on(self, event: PoolEvent) -> Result<PoolIoState, PoolError> {
        use PoolEvent as E;
        use PoolIoState as S;
        match (self, event) {
            (S::Active | S::Suspended, E::Suspend) => Ok(S::Suspended),
            (S::Active | S::Suspended, E::Resume) => Ok(S::Active),
            (S::Active | S::Closed, E::Close) => Ok(S::Closed),
            (from, event) => Err(PoolError::IllegalTransition {
                from: from.name(),
                event: event.name(),
            }),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PoolIoState::Active => "active",
            PoolIoState::Suspended => "suspended",
            PoolIoState::Closed => "closed",
        }
    }
}

impl PoolEvent {
    pub fn name(self) -> &'static str {
        match self {
            PoolEvent::Suspend => "suspend",
            PoolEvent::Resume => "resume",
            PoolEvent::Close => "close",
        }
    }
}

pub(crate) struct SuspendState {
    pub(crate) state: PoolIoState,
    pub(crate) reason: Option<String>,
    pub(crate) since: Option<DateTime<Utc>>,
    /// Parent of every request parked by a failure.
    root: Option<ZioId>,
    /// Top-level requests submitted without waiting while suspended.
    parked: Vec<ZioId>,
}

pub(crate) struct SuspendCtl {
    pub(crate) inner: Mutex<SuspendState>,
    cv: Condvar,
}

impl SuspendCtl {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(SuspendState {
                state: PoolIoState::Active,
                reason: None,
                since: None,
                root: None,
                parked: Vec::new(),
            }),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn state(&self) -> PoolIoState {
        self.inner.lock().state
    }

    /// Applies a state change, waking blocked submitters on any change.
    pub(crate) fn transition(&self, event: PoolEvent) -> Result<PoolIoState, PoolError> {
        let mut s = self.inner.lock();
        let next = s.state.on(event)?;
        s.state = next;
        if next != PoolIoState::Suspended {
            self.cv.notify_all();
        }
        Ok(next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Proceed,
    /// Held until the pool resumes.
    Parked,
}

/// Gates a new top-level modifying request on a suspended pool.
pub(crate) fn admit(spa: &Arc<Spa>, node: &Arc<ZioNode>, blocking: bool) -> Admission {
    if !node.is_logical()
        || node.godfather
        || !matches!(node.io_type, ZioType::Write | ZioType::Free | ZioType::Claim)
    {
        return Admission::Proceed;
    }
    if !node.sync.lock().parents.is_empty() {
        return Admission::Proceed;
    }

    let mut s = spa.suspend.inner.lock();
    if s.state != PoolIoState::Suspended {
        return Admission::Proceed;
    }
    match spa.config.failure_mode {
        FailureMode::Continue => {
            drop(s);
            debug!("{}: failing {} on suspended pool", spa.name, node.id);
            let mut st = node.state.lock();
            st.error = Some(ZioError::Suspended);
            st.flags.insert(ZioFlags::CANFAIL);
            let mut pipeline = INTERLOCK_PIPELINE;
            pipeline.insert(st.stage);
            st.pipeline = pipeline;
            Admission::Proceed
        }
        _ if blocking => {
            debug!("{}: {} waiting for pool to resume", spa.name, node.id);
            while s.state == PoolIoState::Suspended {
                spa.suspend.cv.wait(&mut s);
            }
            Admission::Proceed
        }
        _ => {
            debug!("{}: parking {} until pool resumes", spa.name, node.id);
            s.parked.push(node.id);
            node.sync.lock().timestamp = None;
            Admission::Parked
        }
    }
}

/// Suspends the pool and, if given, parks `node` under the suspend root.
pub(crate) fn suspend_zio(spa: &Arc<Spa>, node: Option<&Arc<ZioNode>>, reason: &str) {
    if spa.config.failure_mode == FailureMode::Panic {
        panic!(
            "pool '{}' has encountered an uncorrectable I/O failure and the failure mode \
             property for this pool is set to panic: {}",
            spa.name, reason
        );
    }
    warn!("{}: suspending I/O: {}", spa.name, reason);

    let root = {
        let mut s = spa.suspend.inner.lock();
        match s.state.on(PoolEvent::Suspend) {
            Ok(next) => s.state = next,
            Err(e) => error!("{}: {}", spa.name, e),
        }
        if s.since.is_none() {
            s.since = Some(Utc::now());
            s.reason = Some(reason.to_string());
        }
        match s.root.and_then(|id| spa.arena.get(id)) {
            Some(root) => root,
            None => {
                let root = construct::root(
                    spa,
                    ZioFlags::CANFAIL | ZioFlags::SPECULATIVE | ZioFlags::GODFATHER,
                );
                s.root = Some(root.id);
                root
            }
        }
    };

    if let Some(node) = node {
        graph::add_child(&root, node);
        node.sync.lock().advance(LifecycleEvent::Suspend);
    }
}

/// Resumes a suspended pool: releases blocked and parked submitters, then
/// reexecutes everything parked under the suspend root and waits for it.
pub(crate) fn resume(spa: &Arc<Spa>) -> Result<(), PoolError> {
    let (root, parked) = {
        let mut s = spa.suspend.inner.lock();
        s.state = s.state.on(PoolEvent::Resume)?;
        s.reason = None;
        s.since = None;
        spa.suspend.cv.notify_all();
        (s.root.take(), std::mem::take(&mut s.parked))
    };
    info!(
        "{}: resuming I/O ({} parked submissions)",
        spa.name,
        parked.len()
    );

    for id in parked {
        if let Some(node) = spa.arena.get(id) {
            executor::adopt(spa, &node);
            executor::execute(spa, &node);
        }
    }

    if let Some(root) = root.and_then(|id| spa.arena.get(id)) {
        reexecute(spa, root.id);
        if let Err(e) = executor::wait(spa, root) {
            debug!("{}: suspend root finished with {}", spa.name, e);
        }
    }
    Ok(())
}

/// Resets `id` and its remaining children to their initial stage and runs
/// them again. Children are reset before the parent resumes so a child
/// cannot complete into a parent that has not been reset yet.
pub(crate) fn reexecute(spa: &Arc<Spa>, id: ZioId) {
    let Some(node) = spa.arena.get(id) else {
        return;
    };

    let kids = {
        let mut st = node.state.lock();
        debug_assert!(st.transforms.is_empty());
        st.flags = st.orig_flags | ZioFlags::REEXECUTED;
        st.stage = st.orig_stage;
        st.pipeline = st.orig_pipeline;
        node.publish_stage(st.stage);
        st.error = None;
        st.vsd = None;
        st.ddt_entry = None;
        st.gang_leader = None;
        st.trace.clear();
        if st.is_allocating() {
            if let Some(bp) = st.bp.as_mut() {
                bp.zero();
            }
        }

        let mut sync = node.sync.lock();
        sync.reexecute = 0;
        sync.reached = [st.orig_stage >= Stage::Ready, st.orig_stage >= Stage::Done];
        sync.child_error = [None, None, None, None];
        sync.stall = None;
        sync.result = None;
        sync.device_pending = false;
        sync.device_result = None;
        sync.advance(LifecycleEvent::Reexecute);
        sync.kids.clone()
    };

    for kid in kids {
        let Some(child) = spa.arena.get(kid) else {
            continue;
        };
        {
            let mut sync = node.sync.lock();
            for w in WaitType::ALL {
                sync.children[child.child_type.index()][w.index()] += 1;
            }
        }
        reexecute(spa, kid);
    }

    if !node.godfather {
        executor::adopt(spa, &node);
        executor::execute(spa, &node);
    }
}

/// Marks the pool suspended without parking a request.
pub(crate) fn suspend_pool(spa: &Arc<Spa>, reason: &str) {
    suspend_zio(spa, None, reason);
}
