#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use zpipe::common::config::{FailureMode, PoolConfig};
    use zpipe::common::exception::{PoolError, ZioError};
    use zpipe::storage::abd::Abd;
    use zpipe::storage::blkptr::WriteProps;
    use zpipe::storage::pool::IoOptions;
    use zpipe::storage::vdev::TopLevelSpec;
    use zpipe::storage::zio::PoolIoState;

    use crate::assert_ok;
    use crate::common::harness::{pattern, small_config, wait_until, TestPool, BLOCK, DISK};

    const PATIENCE: Duration = Duration::from_secs(10);

    fn with_mode(failure_mode: FailureMode) -> PoolConfig {
        PoolConfig {
            failure_mode,
            ..small_config()
        }
    }

    #[test]
    fn failed_rewrite_suspends_until_resume() {
        let ctx = TestPool::single_disk();
        let bp = ctx.write_block(&pattern(BLOCK, 60), WriteProps::default());
        let replacement = pattern(BLOCK, 61);
        assert_ok!(ctx.vdev(0)).faults().fail_next_writes(2);

        thread::scope(|s| {
            let writer = s.spawn(|| {
                ctx.rewrite(&bp, Abd::from_slice(&replacement), IoOptions::new())
                    .wait()
            });

            assert!(wait_until(PATIENCE, || ctx.is_suspended()));
            let reason = ctx.suspend_reason().expect("suspended pool has a reason");
            assert!(reason.contains("Write"), "{}", reason);
            assert!(!writer.is_finished());

            assert_ok!(ctx.resume());
            let done = assert_ok!(writer.join().expect("writer thread"));
            let rewritten = done.bp.expect("rewrite hands back its block pointer");
            assert_eq!(rewritten.dvas, bp.dvas);
            assert_eq!(ctx.read_block(&rewritten), replacement);
        });

        assert_eq!(ctx.io_state(), PoolIoState::Active);
    }

    #[test]
    fn out_of_space_write_waits_for_room() {
        let ctx = TestPool::new(small_config(), vec![TopLevelSpec::memory_disk(2 * BLOCK as u64)]);
        let filler = ctx.write_block(&pattern(2 * BLOCK, 62), WriteProps::default());
        assert_eq!(ctx.free_space(), 0);
        let data = pattern(BLOCK, 63);

        thread::scope(|s| {
            let writer = s.spawn(|| ctx.write_with(&data, WriteProps::default(), IoOptions::new()));

            assert!(wait_until(PATIENCE, || ctx.is_suspended()));

            // Frees submitted without waiting are parked until resume.
            ctx.free(&filler, IoOptions::new()).nowait();
            assert_eq!(ctx.free_space(), 0);

            // The write may run again before the free lands and suspend
            // once more; keep resuming until it gets through.
            assert_ok!(ctx.resume());
            assert!(wait_until(PATIENCE, || {
                if ctx.is_suspended() {
                    assert_ok!(ctx.resume());
                }
                writer.is_finished()
            }));
            let bp = assert_ok!(writer.join().expect("writer thread"));
            assert_eq!(ctx.read_block(&bp), data);
        });
        assert_eq!(ctx.free_space(), BLOCK as u64);
    }

    #[test]
    fn suspended_pool_blocks_waiting_writers() {
        let ctx = TestPool::single_disk();
        let existing = ctx.write_block(&pattern(BLOCK, 65), WriteProps::default());
        let before = ctx.free_space();
        assert_ok!(ctx.suspend("maintenance"));
        assert!(ctx.is_suspended());

        let finished = AtomicBool::new(false);
        let data = pattern(BLOCK, 64);
        thread::scope(|s| {
            let writer = s.spawn(|| {
                let bp = ctx.write_block(&data, WriteProps::default());
                finished.store(true, Ordering::SeqCst);
                bp
            });

            thread::sleep(Duration::from_millis(50));
            assert!(!finished.load(Ordering::SeqCst));
            assert_eq!(ctx.free_space(), before);

            // Reads are not held back.
            assert_eq!(ctx.read_block(&existing), pattern(BLOCK, 65));

            assert_ok!(ctx.resume());
            let bp = writer.join().expect("writer thread");
            assert_eq!(ctx.read_block(&bp), data);
        });
    }

    #[test]
    fn parked_async_writes_run_on_resume() {
        let ctx = TestPool::single_disk();
        assert_ok!(ctx.suspend("maintenance"));

        let (tx, rx) = mpsc::channel();
        let opts = IoOptions::new().on_done(move |view| {
            let _ = tx.send(view.bp().cloned());
        });
        let data = pattern(BLOCK, 66);
        ctx.write(Abd::from_slice(&data), BLOCK as u64, WriteProps::default(), opts)
            .nowait();
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        assert_ok!(ctx.resume());
        let bp = rx
            .recv_timeout(PATIENCE)
            .expect("parked write runs")
            .expect("write has a block pointer");
        assert_eq!(ctx.read_block(&bp), data);
    }

    #[test]
    fn continue_mode_fails_new_writes() {
        let ctx = TestPool::new(with_mode(FailureMode::Continue), vec![TopLevelSpec::memory_disk(DISK)]);
        let before = ctx.free_space();
        let existing = ctx.write_block(&pattern(BLOCK, 67), WriteProps::default());
        assert_ok!(ctx.suspend("maintenance"));

        let result = ctx.write_with(&pattern(BLOCK, 68), WriteProps::default(), IoOptions::new());
        assert_eq!(result.err(), Some(ZioError::Suspended));
        assert_eq!(ctx.free(&existing, IoOptions::new()).wait().err(), Some(ZioError::Suspended));
        assert_eq!(ctx.free_space(), before - BLOCK as u64);

        // Reads still work.
        assert_eq!(ctx.read_block(&existing), pattern(BLOCK, 67));

        assert_ok!(ctx.resume());
        assert_ok!(ctx.free_sync(&existing));
        assert_eq!(ctx.free_space(), before);
    }

    #[test]
    fn resume_of_an_active_pool_is_a_no_op() {
        let ctx = TestPool::single_disk();
        assert_ok!(ctx.resume());
        assert_eq!(ctx.io_state(), PoolIoState::Active);
        assert_eq!(ctx.suspend_reason(), None);

        assert_ok!(ctx.close());
        assert!(matches!(ctx.resume(), Err(PoolError::Closed)));
    }
}
