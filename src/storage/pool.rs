//! # Pool
//!
//! `Pool` is the entry point for block I/O. It owns the device tree, the
//! space allocator, the dedup table and the worker queues, and hands out
//! [`Zio`] handles for every kind of request.
//!
//! ```text
//!   caller
//!   ═══════════════════════════════════════════════════════════════════
//!      │ pool.write(..) / read(..) / free(..) / claim(..) / flush(..)
//!      ▼
//!   ┌────────────────────────────────────────────────────────────────┐
//!   │ Zio handle ── wait() ── nowait() ── wait_async().await         │
//!   └──────────────────────────────┬─────────────────────────────────┘
//!                                  ▼
//!   ┌────────────────────────────────────────────────────────────────┐
//!   │ executor: stage pipeline, worklist trampoline, worker queues   │
//!   │   ├── gang assembly / issue                                    │
//!   │   ├── allocation throttle                                      │
//!   │   ├── dedup                                                    │
//!   │   └── suspend / reexecute / deadman                            │
//!   └──────────────────────────────┬─────────────────────────────────┘
//!                                  ▼
//!   ┌────────────────────────────────────────────────────────────────┐
//!   │ root vdev ── mirror ── disk (memory or file)                   │
//!   └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! | Method                  | Description                                   |
//! |-------------------------|-----------------------------------------------|
//! | `open()` / `builder()`  | Build the device tree and start worker queues |
//! | `write()` / `rewrite()` | Allocate and write a block, or overwrite one  |
//! | `read()`                | Read a block back through its block pointer   |
//! | `free()` / `claim()`    | Release or claim a block's space              |
//! | `flush()` / `trim()`    | Device cache flush and discard                |
//! | `suspend()` / `resume()`| Pool-wide pause of modifying I/O              |
//! | `close()`               | Drain asynchronous I/O and stop the queues    |

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::common::config::{PoolConfig, Txg, VdevId, TXG_INITIAL};
use crate::common::exception::{PoolError, ZioError};
use crate::common::rwlatch::ReaderWriterLatch;
use crate::storage::abd::Abd;
use crate::storage::allocator::{ExtentAllocator, SpaceAllocator};
use crate::storage::blkptr::{BlockPointer, Bookmark, ChecksumKind, WriteProps};
use crate::storage::crypt::KeyStore;
use crate::storage::dedup::{DdtKey, DedupTable, MemoryDedupTable};
use crate::storage::vdev::{self, TopLevelSpec, Vdev, VdevStatsSnapshot};
use crate::storage::zio::arena::{ZioArena, ZioId};
use crate::storage::zio::construct::{self, ZioArgs};
use crate::storage::zio::deadman::{self, SlowIo};
use crate::storage::zio::executor;
use crate::storage::zio::request::{Callback, Completed, UserCallback, ZioNode, ZioView};
use crate::storage::zio::suspend::{self, PoolEvent, PoolIoState, SuspendCtl};
use crate::storage::zio::taskq::TaskqSet;
use crate::storage::zio::throttle::Throttle;
use crate::storage::zio::{IoctlCmd, Priority, RequestState, ZioFlags, ZioType};

/// Pool-wide state shared by every request.
pub(crate) struct Spa {
    pub(crate) name: String,
    pub(crate) config: PoolConfig,
    pub(crate) arena: ZioArena,
    pub(crate) taskqs: TaskqSet,
    pub(crate) allocator: Arc<dyn SpaceAllocator>,
    pub(crate) ddt: Arc<dyn DedupTable>,
    pub(crate) keys: KeyStore,
    pub(crate) root_vdev: Arc<Vdev>,
    vdevs: HashMap<VdevId, Arc<Vdev>>,
    pub(crate) min_ashift: u32,
    /// Held as a reader by logical device I/O, as a writer by reconfiguration.
    pub(crate) config_lock: ReaderWriterLatch,
    pub(crate) suspend: SuspendCtl,
    pub(crate) throttle: Throttle,
    godfathers: Mutex<Vec<ZioId>>,
    rotor: AtomicUsize,
    txg: AtomicU64,
    pub(crate) iv_counter: AtomicU64,
}

impl Spa {
    pub(crate) fn vdev(&self, id: VdevId) -> Option<Arc<Vdev>> {
        self.vdevs.get(&id).cloned()
    }

    /// Picks the next godfather root, round robin. None once the pool is
    /// closing.
    pub(crate) fn next_godfather(&self) -> Option<Arc<ZioNode>> {
        let roots = self.godfathers.lock();
        if roots.is_empty() {
            return None;
        }
        let i = self.rotor.fetch_add(1, Ordering::Relaxed) % roots.len();
        self.arena.get(roots[i])
    }
}

/// Per-request options shared by every constructor.
#[derive(Default)]
pub struct IoOptions {
    parent: Option<ZioId>,
    flags: ZioFlags,
    priority: Option<Priority>,
    bookmark: Bookmark,
    txg: Option<Txg>,
    ready: Option<UserCallback>,
    done: Option<UserCallback>,
}

impl IoOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the request a child of `parent`, which will not finish before it.
    pub fn parent(mut self, parent: ZioId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn flags(mut self, flags: ZioFlags) -> Self {
        self.flags.insert(flags);
        self
    }

    /// Lets the request fail instead of suspending the pool.
    pub fn can_fail(self) -> Self {
        self.flags(ZioFlags::CANFAIL)
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn bookmark(mut self, bookmark: Bookmark) -> Self {
        self.bookmark = bookmark;
        self
    }

    pub fn txg(mut self, txg: Txg) -> Self {
        self.txg = Some(txg);
        self
    }

    pub fn on_ready(mut self, f: impl FnMut(&ZioView<'_>) + Send + 'static) -> Self {
        self.ready = Some(Box::new(f));
        self
    }

    pub fn on_done(mut self, f: impl FnMut(&ZioView<'_>) + Send + 'static) -> Self {
        self.done = Some(Box::new(f));
        self
    }

    fn apply(self, mut args: ZioArgs) -> ZioArgs {
        if let Some(parent) = self.parent {
            args = args.parent(parent);
        }
        if let Some(priority) = self.priority {
            args = args.priority(priority);
        }
        if let Some(f) = self.ready {
            args = args.on_ready(Callback::User(f));
        }
        if let Some(f) = self.done {
            args = args.on_done(Callback::User(f));
        }
        args.flags(self.flags).bookmark(self.bookmark)
    }
}

impl fmt::Debug for IoOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoOptions")
            .field("parent", &self.parent)
            .field("flags", &self.flags)
            .field("priority", &self.priority)
            .field("bookmark", &self.bookmark)
            .field("txg", &self.txg)
            .finish()
    }
}

/// A constructed request. Submit it with [`Zio::wait`], [`Zio::nowait`] or
/// [`Zio::wait_async`]; dropping an unsubmitted handle submits it without
/// waiting.
pub struct Zio {
    spa: Arc<Spa>,
    node: Arc<ZioNode>,
    submitted: bool,
}

impl Zio {
    fn new(spa: &Arc<Spa>, node: Arc<ZioNode>) -> Self {
        Self {
            spa: Arc::clone(spa),
            node,
            submitted: false,
        }
    }

    pub fn id(&self) -> ZioId {
        self.node.id
    }

    pub fn io_type(&self) -> ZioType {
        self.node.io_type
    }

    /// Runs the request and blocks until it is done.
    pub fn wait(mut self) -> Result<Completed, ZioError> {
        self.submitted = true;
        executor::wait(&self.spa, Arc::clone(&self.node))
    }

    /// Runs the request without waiting for it.
    pub fn nowait(mut self) {
        self.submitted = true;
        executor::nowait(&self.spa, &self.node);
    }

    /// Runs the request on a worker queue and resolves when it is done.
    pub async fn wait_async(mut self) -> Result<Completed, ZioError> {
        self.submitted = true;
        executor::wait_async(Arc::clone(&self.spa), Arc::clone(&self.node)).await
    }
}

impl Drop for Zio {
    fn drop(&mut self) {
        if !self.submitted {
            debug!("{}: {} dropped unsubmitted; issuing without wait", self.spa.name, self.node.id);
            executor::nowait(&self.spa, &self.node);
        }
    }
}

impl fmt::Debug for Zio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Zio")
            .field("id", &self.node.id)
            .field("type", &self.node.io_type)
            .finish()
    }
}

pub struct PoolBuilder {
    name: String,
    config: PoolConfig,
    vdevs: Vec<TopLevelSpec>,
    allocator: Option<Arc<dyn SpaceAllocator>>,
    ddt: Option<Arc<dyn DedupTable>>,
}

impl PoolBuilder {
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    pub fn vdev(mut self, spec: TopLevelSpec) -> Self {
        self.vdevs.push(spec);
        self
    }

    /// Replaces the default first-fit extent allocator.
    pub fn allocator(mut self, allocator: Arc<dyn SpaceAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    pub fn dedup_table(mut self, ddt: Arc<dyn DedupTable>) -> Self {
        self.ddt = Some(ddt);
        self
    }

    pub fn open(self) -> Result<Pool, PoolError> {
        let config = self.config;
        if config.max_replication == 0 {
            return Err(PoolError::InvalidConfig("max_replication must be at least 1".to_string()));
        }
        if config.worklist_limit == 0 {
            return Err(PoolError::InvalidConfig("worklist_limit must be at least 1".to_string()));
        }

        let allocator = self
            .allocator
            .unwrap_or_else(|| Arc::new(ExtentAllocator::new()));
        let ddt = self
            .ddt
            .unwrap_or_else(|| Arc::new(MemoryDedupTable::new()));
        let tree = vdev::build_tree(&self.vdevs, allocator.as_ref())?;
        let taskqs = TaskqSet::start(&self.name, &config.taskq)?;

        let spa = Arc::new(Spa {
            name: self.name,
            throttle: Throttle::new(&config.throttle),
            arena: ZioArena::new(),
            taskqs,
            allocator,
            ddt,
            keys: KeyStore::new(),
            root_vdev: tree.root,
            vdevs: tree.by_id,
            min_ashift: tree.min_ashift,
            config_lock: ReaderWriterLatch::new(),
            suspend: SuspendCtl::new(),
            godfathers: Mutex::new(Vec::new()),
            rotor: AtomicUsize::new(0),
            txg: AtomicU64::new(TXG_INITIAL),
            iv_counter: AtomicU64::new(1),
            config,
        });

        let roots: Vec<ZioId> = (0..spa.config.async_roots.max(1))
            .map(|_| {
                construct::root(
                    &spa,
                    ZioFlags::CANFAIL | ZioFlags::SPECULATIVE | ZioFlags::GODFATHER,
                )
                .id
            })
            .collect();
        *spa.godfathers.lock() = roots;

        info!(
            "Opened pool {} with {} top-level vdevs, {} bytes free",
            spa.name,
            spa.root_vdev.children().len(),
            spa.allocator.free_space()
        );
        Ok(Pool {
            spa,
            closed: AtomicBool::new(false),
        })
    }
}

/// An open storage pool.
pub struct Pool {
    spa: Arc<Spa>,
    closed: AtomicBool,
}

impl Pool {
    pub fn builder(name: impl Into<String>) -> PoolBuilder {
        PoolBuilder {
            name: name.into(),
            config: PoolConfig::default(),
            vdevs: Vec::new(),
            allocator: None,
            ddt: None,
        }
    }

    /// Opens a pool over `vdevs` with the default allocator and dedup table.
    pub fn open(name: &str, config: PoolConfig, vdevs: Vec<TopLevelSpec>) -> Result<Pool, PoolError> {
        vdevs
            .into_iter()
            .fold(Self::builder(name).config(config), PoolBuilder::vdev)
            .open()
    }

    pub fn name(&self) -> &str {
        &self.spa.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.spa.config
    }

    /// The open transaction group new writes are born in.
    pub fn txg(&self) -> Txg {
        self.spa.txg.load(Ordering::Acquire)
    }

    /// Moves to the next transaction group and returns it.
    pub fn advance_txg(&self) -> Txg {
        self.spa.txg.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn check_open(&self) -> Result<(), PoolError> {
        if self.closed.load(Ordering::Acquire) {
            Err(PoolError::Closed)
        } else {
            Ok(())
        }
    }

    fn build(&self, args: ZioArgs) -> Zio {
        Zio::new(&self.spa, construct::create(&self.spa, args))
    }

    fn txg_of(&self, opts: &IoOptions) -> Txg {
        opts.txg.unwrap_or_else(|| self.txg())
    }

    pub fn vdev(&self, id: VdevId) -> Result<Arc<Vdev>, PoolError> {
        self.spa.vdev(id).ok_or(PoolError::VdevNotFound(id))
    }

    pub fn root_vdev(&self) -> &Arc<Vdev> {
        &self.spa.root_vdev
    }

    pub fn vdev_stats(&self, id: VdevId) -> Result<VdevStatsSnapshot, PoolError> {
        Ok(self.vdev(id)?.stats().snapshot())
    }

    // ----------------------------------------------------------------------
    // Constructors
    // ----------------------------------------------------------------------

    /// A request that does nothing itself and finishes after its children.
    pub fn null(&self, opts: IoOptions) -> Zio {
        self.build(opts.apply(ZioArgs::null()))
    }

    /// A parentless null request for gathering children.
    pub fn root(&self) -> Zio {
        self.null(IoOptions::default())
    }

    /// Writes `size` bytes of `data` as a new block.
    pub fn write(&self, data: Abd, size: u64, prop: WriteProps, opts: IoOptions) -> Zio {
        let txg = self.txg_of(&opts);
        self.build(opts.apply(ZioArgs::write(txg, None, data, size, prop)))
    }

    /// Writes `data` as the new version of the block behind `prev`; with
    /// nop-write enabled an unchanged block keeps `prev`.
    pub fn overwrite(
        &self,
        prev: &BlockPointer,
        data: Abd,
        size: u64,
        prop: WriteProps,
        opts: IoOptions,
    ) -> Zio {
        let txg = self.txg_of(&opts);
        self.build(opts.apply(ZioArgs::write(txg, Some(prev.clone()), data, size, prop)))
    }

    /// Writes with a block pointer the caller already allocated.
    pub fn write_override(
        &self,
        data: Abd,
        size: u64,
        prop: WriteProps,
        bp: BlockPointer,
        opts: IoOptions,
    ) -> Zio {
        let txg = self.txg_of(&opts);
        self.build(opts.apply(ZioArgs::write(txg, None, data, size, prop).override_bp(bp)))
    }

    /// Rewrites the block at `bp` in place with new contents.
    pub fn rewrite(&self, bp: &BlockPointer, data: Abd, opts: IoOptions) -> Zio {
        let txg = self.txg_of(&opts);
        let size = bp.psize;
        self.build(opts.apply(ZioArgs::rewrite(txg, bp.clone(), data, size)))
    }

    /// Reads the block at `bp` into `data`, which must hold `bp.lsize` bytes.
    pub fn read(&self, bp: &BlockPointer, data: Abd, opts: IoOptions) -> Zio {
        let size = bp.lsize;
        self.build(opts.apply(ZioArgs::read(bp.clone(), data, size)))
    }

    pub fn free(&self, bp: &BlockPointer, opts: IoOptions) -> Zio {
        let txg = self.txg_of(&opts);
        self.build(opts.apply(ZioArgs::free(txg, bp.clone())))
    }

    /// Frees `bp` and waits for it.
    pub fn free_sync(&self, bp: &BlockPointer) -> Result<(), ZioError> {
        self.free(bp, IoOptions::default()).wait().map(|_| ())
    }

    pub fn claim(&self, bp: &BlockPointer, opts: IoOptions) -> Zio {
        let txg = self.txg_of(&opts);
        self.build(opts.apply(ZioArgs::claim(txg, bp.clone())))
    }

    /// Discards a range of a device.
    pub fn trim(&self, vdev: VdevId, offset: u64, size: u64, opts: IoOptions) -> Result<Zio, PoolError> {
        let vd = self.vdev(vdev)?;
        Ok(self.build(opts.apply(ZioArgs::trim(vd, offset, size))))
    }

    /// Device control on every leaf under `vdev`, or under the whole pool.
    pub fn ioctl(&self, vdev: Option<VdevId>, cmd: IoctlCmd, opts: IoOptions) -> Result<Zio, PoolError> {
        let vd = match vdev {
            Some(id) => self.vdev(id)?,
            None => Arc::clone(&self.spa.root_vdev),
        };
        let node = construct::ioctl(&self.spa, opts.parent, &vd, cmd, opts.flags);
        Ok(Zio::new(&self.spa, node))
    }

    /// Flushes the write cache of every leaf under `vdev` (or the pool).
    /// Individual flush failures are ignored.
    pub fn flush(&self, vdev: Option<VdevId>, parent: Option<ZioId>) -> Result<Zio, PoolError> {
        let vd = match vdev {
            Some(id) => self.vdev(id)?,
            None => Arc::clone(&self.spa.root_vdev),
        };
        Ok(Zio::new(&self.spa, construct::flush(&self.spa, parent, &vd)))
    }

    /// Reads raw bytes from a leaf.
    pub fn read_phys(
        &self,
        vdev: VdevId,
        offset: u64,
        data: Abd,
        checksum: ChecksumKind,
        opts: IoOptions,
    ) -> Result<Zio, PoolError> {
        let vd = self.leaf(vdev)?;
        let size = data.len() as u64;
        Ok(self.build(opts.apply(ZioArgs::read_phys(vd, offset, data, size, checksum))))
    }

    /// Writes raw bytes to a leaf. An embedded checksum is stored in the
    /// tail of the block.
    pub fn write_phys(
        &self,
        vdev: VdevId,
        offset: u64,
        data: Abd,
        checksum: ChecksumKind,
        opts: IoOptions,
    ) -> Result<Zio, PoolError> {
        let vd = self.leaf(vdev)?;
        let size = data.len() as u64;
        Ok(self.build(opts.apply(ZioArgs::write_phys(vd, offset, data, size, checksum))))
    }

    /// Leaf I/O outside of any request tree, as issued by device code.
    pub fn vdev_delegated_io(
        &self,
        vdev: VdevId,
        io_type: ZioType,
        offset: u64,
        data: Abd,
    ) -> Result<Zio, PoolError> {
        if !matches!(io_type, ZioType::Read | ZioType::Write) {
            return Err(PoolError::InvalidRequest(format!(
                "delegated {:?} is not supported",
                io_type
            )));
        }
        let vd = self.leaf(vdev)?;
        let size = data.len() as u64;
        let args = ZioArgs::vdev_child(io_type, vd, offset, data, size).priority(Priority::Now);
        Ok(Zio::new(&self.spa, construct::vdev_delegated_io(&self.spa, args)))
    }

    fn leaf(&self, vdev: VdevId) -> Result<Arc<Vdev>, PoolError> {
        let vd = self.vdev(vdev)?;
        if !vd.is_leaf() {
            return Err(PoolError::InvalidRequest(format!("vdev {} is not a leaf", vdev)));
        }
        Ok(vd)
    }

    // ----------------------------------------------------------------------
    // Control
    // ----------------------------------------------------------------------

    /// Suspends modifying I/O until [`Pool::resume`].
    pub fn suspend(&self, reason: &str) -> Result<(), PoolError> {
        self.check_open()?;
        suspend::suspend_pool(&self.spa, reason);
        Ok(())
    }

    /// Resumes a suspended pool and reexecutes everything that was parked.
    /// A pool that is not suspended is left alone.
    pub fn resume(&self) -> Result<(), PoolError> {
        self.check_open()?;
        if self.spa.suspend.state() != PoolIoState::Suspended {
            debug!("{}: resume of a pool that is not suspended", self.spa.name);
            return Ok(());
        }
        suspend::resume(&self.spa)
    }

    pub fn io_state(&self) -> PoolIoState {
        self.spa.suspend.state()
    }

    pub fn is_suspended(&self) -> bool {
        self.io_state() == PoolIoState::Suspended
    }

    /// Why the pool is suspended, if it is.
    pub fn suspend_reason(&self) -> Option<String> {
        self.spa.suspend.inner.lock().reason.clone()
    }

    /// Sets the priority of an in-flight request and of every descendant.
    /// Requests promoted to [`Priority::Now`] while waiting on a normal
    /// worker queue move to the high-priority queue.
    pub fn change_priority(&self, id: ZioId, priority: Priority) -> Result<(), PoolError> {
        let node = self
            .spa
            .arena
            .get(id)
            .ok_or_else(|| PoolError::RequestNotFound(id.to_string()))?;
        let mut stack = vec![node];
        while let Some(node) = stack.pop() {
            node.set_priority(priority);
            if priority == Priority::Now {
                executor::requeue_promoted(&self.spa, &node);
            }
            let kids = node.sync.lock().kids.clone();
            stack.extend(kids.into_iter().filter_map(|k| self.spa.arena.get(k)));
        }
        debug!("{}: {} promoted to {:?}", self.spa.name, id, priority);
        Ok(())
    }

    /// Runs `f` with the configuration lock held as writer, after in-flight
    /// logical device I/O has drained.
    pub fn reconfigure<R>(&self, f: impl FnOnce() -> R) -> R {
        self.spa.config_lock.w_lock();
        let result = f();
        self.spa.config_lock.w_unlock();
        result
    }

    /// Delivers a device completion by request id. Late or duplicate
    /// completions are ignored; returns whether one was accepted.
    pub fn complete_device_io(&self, id: ZioId, result: Result<(), ZioError>) -> bool {
        executor::complete_device_io(&self.spa, id, result)
    }

    pub fn request_state(&self, id: ZioId) -> Option<RequestState> {
        self.spa.arena.get(id).map(|n| n.sync.lock().lifecycle)
    }

    /// Requests currently alive, including the pool's own roots.
    pub fn live_requests(&self) -> usize {
        self.spa.arena.live()
    }

    pub fn free_space(&self) -> u64 {
        self.spa.allocator.free_space()
    }

    /// Allocation slots currently reserved by the throttle.
    pub fn throttle_reserved(&self) -> u64 {
        self.spa.throttle.reserved()
    }

    /// Allocating writes waiting in the throttle queues.
    pub fn throttle_queued(&self) -> usize {
        self.spa.throttle.queued()
    }

    pub fn dedup_entries(&self) -> usize {
        self.spa.ddt.len()
    }

    /// References held on the shared copy behind a deduplicated `bp`.
    pub fn dedup_refcount(&self, bp: &BlockPointer) -> u64 {
        self.spa
            .ddt
            .lookup(&DdtKey::from_bp(bp))
            .map_or(0, |entry| entry.lock().refcount)
    }

    pub fn load_key(&self, key_id: u64, material: &[u8]) {
        self.spa.keys.load_key(key_id, material);
    }

    pub fn unload_key(&self, key_id: u64) {
        self.spa.keys.unload_key(key_id);
    }

    /// Reports every device operation outstanding past the deadman sync
    /// time and reacts per the configured fail mode.
    pub fn check_deadman(&self) -> Vec<SlowIo> {
        deadman::check_pool(&self.spa)
    }

    /// Waits for asynchronous I/O, then stops the worker queues. Fails on a
    /// suspended pool; resume it first.
    pub fn close(&self) -> Result<(), PoolError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.spa.suspend.transition(PoolEvent::Close)?;
        self.closed.store(true, Ordering::Release);

        let roots = std::mem::take(&mut *self.spa.godfathers.lock());
        for id in roots {
            if let Some(root) = self.spa.arena.get(id) {
                if let Err(e) = executor::wait(&self.spa, root) {
                    warn!("{}: async root {} finished with {}", self.spa.name, id, e);
                }
            }
        }
        self.spa.taskqs.wait_idle();
        self.spa.taskqs.shutdown();
        info!("Closed pool {}", self.spa.name);
        Ok(())
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("{}: close failed: {}; stopping worker queues", self.spa.name, e);
            self.spa.taskqs.shutdown();
        }
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.spa.name)
            .field("state", &self.io_state())
            .field("txg", &self.txg())
            .field("live_requests", &self.live_requests())
            .finish()
    }
}
