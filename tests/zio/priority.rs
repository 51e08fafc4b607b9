#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use zpipe::common::config::{PoolConfig, TaskqConfig};
    use zpipe::storage::abd::Abd;
    use zpipe::storage::blkptr::{BlockPointer, WriteProps};
    use zpipe::storage::pool::IoOptions;
    use zpipe::storage::vdev::TopLevelSpec;
    use zpipe::storage::zio::{Priority, RequestState};

    use crate::assert_ok;
    use crate::common::harness::{pattern, small_config, wait_until, TestPool, BLOCK, DISK};

    const PATIENCE: Duration = Duration::from_secs(10);

    /// One issue thread per queue, so a single stuck read blocks its queue.
    fn single_issuer() -> PoolConfig {
        let base = small_config();
        PoolConfig {
            taskq: TaskqConfig {
                issue_threads: 1,
                ..base.taskq.clone()
            },
            ..base
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn promoted_read_overtakes_a_blocked_queue() {
        let ctx = TestPool::new(single_issuer(), vec![TopLevelSpec::memory_disk(DISK)]);
        let bps: Vec<BlockPointer> = (0..3)
            .map(|i| ctx.write_block(&pattern(BLOCK, 140 + i), WriteProps::default()))
            .collect();

        // Occupy the only read issue thread.
        let (started_tx, started_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let opts = IoOptions::new().on_ready(move |_| {
            let _ = started_tx.send(());
            let _ = gate_rx.recv_timeout(PATIENCE);
        });
        let blocker = tokio::spawn(ctx.read(&bps[0], Abd::alloc(BLOCK), opts).wait_async());
        started_rx.recv_timeout(PATIENCE).expect("first read reaches READY");

        let behind = ctx.read(&bps[1], Abd::alloc(BLOCK), IoOptions::new());
        let behind_id = behind.id();
        let behind = tokio::spawn(behind.wait_async());

        let buf = Abd::alloc(BLOCK);
        let promoted = ctx.read(&bps[2], buf.clone(), IoOptions::new());
        let promoted_id = promoted.id();
        let promoted = tokio::spawn(promoted.wait_async());

        assert!(wait_until(PATIENCE, || {
            ctx.request_state(behind_id) == Some(RequestState::Running)
                && ctx.request_state(promoted_id) == Some(RequestState::Running)
        }));
        assert_ok!(ctx.change_priority(promoted_id, Priority::Now));

        let done = tokio::time::timeout(PATIENCE, promoted)
            .await
            .expect("promoted read finishes while the queue is blocked");
        assert_ok!(done.expect("read task"));
        assert_eq!(buf.to_vec(), pattern(BLOCK, 142));
        assert!(!behind.is_finished());
        assert_eq!(ctx.request_state(behind_id), Some(RequestState::Running));

        gate_tx.send(()).expect("first read is still waiting");
        assert_ok!(blocker.await.expect("read task"));
        assert_ok!(behind.await.expect("read task"));
    }
}
