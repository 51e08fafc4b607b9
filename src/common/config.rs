use std::time::Duration;

use bincode::config as bincode_config;

/** Smallest unit of allocation and I/O, in bytes. */
pub const SPA_MINBLOCKSHIFT: u32 = 9;
pub const SPA_MINBLOCKSIZE: u64 = 1 << SPA_MINBLOCKSHIFT;

/** Largest logical block the pipeline accepts. */
pub const SPA_MAXBLOCKSIZE: u64 = 16 * 1024 * 1024;

/** A gang header always occupies exactly one minimum-sized block. */
pub const SPA_GANGBLOCKSIZE: u64 = SPA_MINBLOCKSIZE;

/** Number of member block pointers in one gang header. */
pub const SPA_GBH_NBLKPTRS: usize = 3;

/** Gang trees deeper than this are refused rather than split further. */
pub const SPA_GANG_MAX_DEPTH: usize = 8;

/** Upper bound on data copies (DVAs) carried by one block pointer. */
pub const SPA_DVAS_PER_BP: usize = 3;

/** Default sector shift for devices that do not report one. */
pub const DEFAULT_ASHIFT: u32 = 9;

pub type Txg = u64; // transaction group (epoch) number
pub type VdevId = u64; // device id, unique within a pool
pub type Checksum = [u64; 4]; // 256-bit checksum words

pub const TXG_INITIAL: Txg = 4;

/// What a pool does when it hits an uncorrectable I/O failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureMode {
    /// Block new top-level I/O until the pool is resumed.
    #[default]
    Wait,
    /// Fail new top-level I/O with `Suspended`.
    Continue,
    /// Halt the process for postmortem diagnosis.
    Panic,
}

/// What the deadman does when it finds I/O stuck past `synctime`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeadmanFailMode {
    /// Report only; keep waiting.
    #[default]
    Wait,
    /// Force stuck leaf I/O to complete with `TimedOut`.
    Continue,
    /// Report, then panic.
    Panic,
}

/// Deadman timing and reaction.
#[derive(Debug, Clone)]
pub struct DeadmanConfig {
    pub enabled: bool,
    /// Age at which an in-flight request is considered hung.
    pub synctime: Duration,
    /// How often a blocking waiter wakes to check.
    pub checktime: Duration,
    pub failmode: DeadmanFailMode,
}

impl Default for DeadmanConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            synctime: Duration::from_secs(600),
            checktime: Duration::from_secs(60),
            failmode: DeadmanFailMode::Wait,
        }
    }
}

/// Worker thread counts per tier for read and write queues. Every other
/// operation kind runs one thread per tier.
#[derive(Debug, Clone)]
pub struct TaskqConfig {
    pub issue_threads: usize,
    pub issue_high_threads: usize,
    pub interrupt_threads: usize,
    pub interrupt_high_threads: usize,
}

impl Default for TaskqConfig {
    fn default() -> Self {
        let cpus = num_cpus::get().max(1);
        Self {
            issue_threads: cpus.min(8),
            issue_high_threads: 2,
            interrupt_threads: cpus.min(8),
            interrupt_high_threads: 2,
        }
    }
}

/// Admission control for allocating writes.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    pub enabled: bool,
    /// Allocator shards per allocation class.
    pub shards: usize,
    /// Concurrent allocation slots per shard; one slot per copy.
    pub slots_per_shard: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            shards: 4,
            slots_per_shard: 32,
        }
    }
}

/// Configuration for a pool and its I/O pipeline.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub failure_mode: FailureMode,
    pub deadman: DeadmanConfig,
    pub taskq: TaskqConfig,
    pub throttle: ThrottleConfig,

    /// Runnable requests a single thread may queue for inline execution
    /// before further ones are handed to a worker queue.
    pub worklist_limit: usize,

    /// Number of godfather roots that adopt parentless async I/O.
    pub async_roots: usize,

    /// Requeue reissued device starts at the front of the issue queue.
    pub requeue_io_start_cut_in_line: bool,

    /// Record every executed stage per request (for tests and debugging).
    pub trace_stages: bool,

    /// Maximum number of copies any write may request.
    pub max_replication: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            failure_mode: FailureMode::Wait,
            deadman: DeadmanConfig::default(),
            taskq: TaskqConfig::default(),
            throttle: ThrottleConfig::default(),
            worklist_limit: 64,
            async_roots: num_cpus::get().max(1),
            requeue_io_start_cut_in_line: true,
            trace_stages: false,
            max_replication: SPA_DVAS_PER_BP,
        }
    }
}

/// Bincode configuration for persisted encodings (gang headers, labels).
///
/// Variable-length integers keep three fully replicated member pointers
/// inside one 512-byte gang block.
///
/// NOTE: Changing this is an on-disk format change.
#[inline]
pub(crate) fn storage_bincode_config() -> impl bincode_config::Config {
    bincode_config::standard()
        .with_little_endian()
        .with_variable_int_encoding()
}

#[inline]
pub fn p2roundup(x: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (x + align - 1) & !(align - 1)
}

#[inline]
pub fn p2phase(x: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    x & (align - 1)
}
