#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::time::Duration;

    use zpipe::common::config::{DeadmanConfig, DeadmanFailMode, FailureMode, PoolConfig};
    use zpipe::common::exception::ZioError;
    use zpipe::storage::abd::Abd;
    use zpipe::storage::blkptr::WriteProps;
    use zpipe::storage::pool::IoOptions;
    use zpipe::storage::vdev::TopLevelSpec;
    use zpipe::storage::zio::{Priority, RequestState, Stage};

    use crate::assert_ok;
    use crate::common::harness::{pattern, shared, small_config, wait_until, TestPool, BLOCK, DISK};

    fn tracing(failure_mode: FailureMode) -> PoolConfig {
        PoolConfig {
            failure_mode,
            trace_stages: true,
            ..small_config()
        }
    }

    #[test]
    fn unavailable_device_read_is_retried_once_then_fails() {
        let ctx = TestPool::new(tracing(FailureMode::Continue), vec![TopLevelSpec::memory_disk(DISK)]);
        let bp = ctx.write_block(&pattern(BLOCK, 50), WriteProps::default());
        assert_ok!(ctx.vdev(0)).faults().set_unavailable(true);

        let trace = shared(Vec::new());
        let t = Arc::clone(&trace);
        let opts = IoOptions::new().can_fail().on_done(move |view| {
            *t.lock() = view.trace().to_vec();
        });
        let result = ctx.read_with(&bp, opts);
        assert_eq!(result.err(), Some(ZioError::DeviceUnavailable));

        let starts = trace
            .lock()
            .iter()
            .filter(|s| **s == Stage::VdevIoStart)
            .count();
        assert_eq!(starts, 2);
        assert!(!ctx.is_suspended());

        assert_ok!(ctx.vdev(0)).faults().set_unavailable(false);
        assert_eq!(ctx.read_block(&bp), pattern(BLOCK, 50));
    }

    #[test]
    fn transient_read_error_is_hidden_by_the_retry() {
        let ctx = TestPool::new(tracing(FailureMode::Wait), vec![TopLevelSpec::memory_disk(DISK)]);
        let data = pattern(BLOCK, 51);
        let bp = ctx.write_block(&data, WriteProps::default());
        let leaf = assert_ok!(ctx.vdev(0));
        leaf.faults().fail_next_reads(1);

        assert_eq!(ctx.read_block(&bp), data);
        let stats = leaf.stats().snapshot();
        assert_eq!(stats.read_errors, 1);
        assert_eq!(stats.reads, 2);
    }

    #[test]
    fn corrupted_read_reports_checksum_error() {
        let ctx = TestPool::single_disk();
        let data = pattern(BLOCK, 52);
        let bp = ctx.write_block(&data, WriteProps::default());
        let leaf = assert_ok!(ctx.vdev(0));

        // One bad read is repaired by the retry.
        leaf.faults().corrupt_next_reads(1);
        assert_eq!(ctx.read_block(&bp), data);
        assert_eq!(leaf.stats().snapshot().checksum_errors, 1);

        leaf.faults().corrupt_next_reads(2);
        let result = ctx.read_with(&bp, IoOptions::new().can_fail());
        assert_eq!(result.err(), Some(ZioError::ChecksumMismatch));
        assert_eq!(leaf.stats().snapshot().checksum_errors, 3);
    }

    #[test]
    fn failed_write_attempts_do_not_leak_space() {
        let ctx = TestPool::single_disk();
        let before = ctx.free_space();
        let leaf = assert_ok!(ctx.vdev(0));

        // Both the first attempt and its retry fail, so the write is run
        // again from the top with a fresh allocation.
        leaf.faults().fail_next_writes(2);
        let data = pattern(BLOCK, 53);
        let bp = ctx.write_block(&data, WriteProps::default());

        assert_eq!(ctx.free_space(), before - BLOCK as u64);
        assert_eq!(leaf.stats().snapshot().write_errors, 2);
        assert_eq!(ctx.read_block(&bp), data);

        assert_ok!(ctx.free_sync(&bp));
        assert_eq!(ctx.free_space(), before);
    }

    #[test]
    fn can_fail_write_reports_the_device_error() {
        let ctx = TestPool::single_disk();
        let before = ctx.free_space();
        assert_ok!(ctx.vdev(0)).faults().fail_next_writes(2);

        let result = ctx.write_with(&pattern(BLOCK, 54), WriteProps::default(), IoOptions::new().can_fail());
        assert_eq!(result.err(), Some(ZioError::Io));
        assert_eq!(ctx.free_space(), before);
        assert!(!ctx.is_suspended());
    }

    #[test]
    fn held_completions_show_up_as_slow_io() {
        let config = PoolConfig {
            deadman: DeadmanConfig {
                enabled: false,
                synctime: Duration::ZERO,
                checktime: Duration::from_secs(60),
                failmode: DeadmanFailMode::Wait,
            },
            ..small_config()
        };
        let ctx = TestPool::new(config, vec![TopLevelSpec::memory_disk(DISK)]);
        let data = pattern(BLOCK, 55);
        let bp = ctx.write_block(&data, WriteProps::default());
        let leaf = assert_ok!(ctx.vdev(0));
        leaf.faults().hold_completions(true);

        let (tx, rx) = mpsc::channel();
        let buf = Abd::alloc(BLOCK);
        let opts = IoOptions::new().on_done(move |view| {
            let _ = tx.send(view.error().cloned());
        });
        let read = ctx.read(&bp, buf.clone(), opts);
        let id = read.id();
        read.nowait();

        assert!(wait_until(Duration::from_secs(5), || leaf.faults().held_count() == 1));
        assert_eq!(ctx.request_state(id), Some(RequestState::Ready));
        assert_ok!(ctx.change_priority(id, Priority::Now));

        let slow = ctx.check_deadman();
        assert_eq!(slow.len(), 1);
        assert_eq!(slow[0].vdev, 0);
        assert_eq!(slow[0].offset, bp.dvas[0].offset);
        assert_eq!(slow[0].stage, Stage::VdevIoStart);

        // Completing by id wins; the held completion then arrives late.
        assert!(ctx.complete_device_io(slow[0].id, Ok(())));
        assert!(!ctx.complete_device_io(slow[0].id, Ok(())));
        leaf.faults().hold_completions(false);
        assert_eq!(leaf.faults().release_held(), 1);

        let error = rx.recv_timeout(Duration::from_secs(5)).expect("read finishes");
        assert_eq!(error, None);
        assert_eq!(buf.to_vec(), data);
    }

    #[test]
    fn deadman_fails_hung_io_when_asked_to_continue() {
        let config = PoolConfig {
            deadman: DeadmanConfig {
                enabled: true,
                synctime: Duration::from_millis(20),
                checktime: Duration::from_millis(5),
                failmode: DeadmanFailMode::Continue,
            },
            ..small_config()
        };
        let ctx = TestPool::new(config, vec![TopLevelSpec::memory_disk(DISK)]);
        let bp = ctx.write_block(&pattern(BLOCK, 56), WriteProps::default());
        let leaf = assert_ok!(ctx.vdev(0));
        leaf.faults().hold_completions(true);

        // The waiter notices, and the deadman completes both the first
        // attempt and the retry with a timeout.
        let result = ctx.read_with(&bp, IoOptions::new().can_fail());
        assert_eq!(result.err(), Some(ZioError::TimedOut));

        leaf.faults().hold_completions(false);
        // The held completions arrive late and are ignored.
        assert_eq!(leaf.faults().release_held(), 2);
    }
}
