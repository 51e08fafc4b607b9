use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use zpipe::common::config::{PoolConfig, TaskqConfig};
use zpipe::common::exception::ZioError;
use zpipe::storage::abd::Abd;
use zpipe::storage::blkptr::{BlockPointer, WriteProps};
use zpipe::storage::pool::{IoOptions, Pool};
use zpipe::storage::vdev::TopLevelSpec;

use super::logger::init_test_logger;

pub const BLOCK: usize = 4096;
pub const DISK: u64 = 1 << 20;

/// Few threads and two async roots keep test pools cheap to open.
pub fn small_config() -> PoolConfig {
    PoolConfig {
        taskq: TaskqConfig {
            issue_threads: 2,
            issue_high_threads: 1,
            interrupt_threads: 2,
            interrupt_high_threads: 1,
        },
        async_roots: 2,
        ..PoolConfig::default()
    }
}

/// Incompressible bytes, reproducible per seed.
pub fn pattern(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; len];
    rng.fill(&mut data[..]);
    data
}

/// A pool that is resumed and closed when the test ends, along with the
/// directory backing any file devices.
pub struct TestPool {
    pub pool: Pool,
    _dir: Option<TempDir>,
}

impl TestPool {
    pub fn new(config: PoolConfig, vdevs: Vec<TopLevelSpec>) -> Self {
        init_test_logger();
        let pool = Pool::open("testpool", config, vdevs).expect("pool opens");
        Self { pool, _dir: None }
    }

    pub fn single_disk() -> Self {
        Self::new(small_config(), vec![TopLevelSpec::memory_disk(DISK)])
    }

    pub fn from_pool(pool: Pool, dir: Option<TempDir>) -> Self {
        init_test_logger();
        Self { pool, _dir: dir }
    }

    pub fn write_block(&self, data: &[u8], prop: WriteProps) -> BlockPointer {
        self.write_with(data, prop, IoOptions::new())
            .expect("write succeeds")
    }

    pub fn write_with(&self, data: &[u8], prop: WriteProps, opts: IoOptions) -> Result<BlockPointer, ZioError> {
        let done = self
            .pool
            .write(Abd::from_slice(data), data.len() as u64, prop, opts)
            .wait()?;
        Ok(done.bp.expect("completed write carries a block pointer"))
    }

    pub fn read_block(&self, bp: &BlockPointer) -> Vec<u8> {
        self.read_with(bp, IoOptions::new()).expect("read succeeds")
    }

    pub fn read_with(&self, bp: &BlockPointer, opts: IoOptions) -> Result<Vec<u8>, ZioError> {
        let buf = Abd::alloc(bp.lsize as usize);
        self.pool.read(bp, buf.clone(), opts).wait()?;
        Ok(buf.to_vec())
    }
}

impl std::ops::Deref for TestPool {
    type Target = Pool;

    fn deref(&self) -> &Pool {
        &self.pool
    }
}

impl Drop for TestPool {
    fn drop(&mut self) {
        if self.pool.is_suspended() {
            let _ = self.pool.resume();
        }
        let _ = self.pool.close();
    }
}

/// Polls `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

pub fn shared<T>(value: T) -> Arc<parking_lot::Mutex<T>> {
    Arc::new(parking_lot::Mutex::new(value))
}
