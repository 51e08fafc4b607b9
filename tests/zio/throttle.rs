#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use zpipe::common::config::{PoolConfig, ThrottleConfig};
    use zpipe::storage::abd::Abd;
    use zpipe::storage::blkptr::{BlockPointer, Bookmark, WriteProps};
    use zpipe::storage::pool::IoOptions;
    use zpipe::storage::vdev::TopLevelSpec;
    use zpipe::storage::zio::Priority;

    use crate::assert_ok;
    use crate::common::harness::{pattern, shared, small_config, TestPool, BLOCK, DISK};

    fn throttled(slots_per_shard: u64) -> TestPool {
        let config = PoolConfig {
            throttle: ThrottleConfig {
                enabled: true,
                shards: 2,
                slots_per_shard,
            },
            ..small_config()
        };
        TestPool::new(config, vec![TopLevelSpec::memory_disk(4 * DISK)])
    }

    /// Issues `n` writes under one root and returns their pointers with
    /// the data each was written with.
    fn write_many(ctx: &TestPool, n: u64, prop: WriteProps, priority: Priority) -> Vec<(Vec<u8>, BlockPointer)> {
        let root = ctx.root();
        let results = shared(Vec::new());
        for i in 0..n {
            let data = pattern(BLOCK, 200 + i);
            let results = Arc::clone(&results);
            let expected = data.clone();
            let opts = IoOptions::new()
                .parent(root.id())
                .priority(priority)
                .bookmark(Bookmark::new(1, i % 3, 0, i))
                .on_done(move |view| {
                    if let Some(bp) = view.bp() {
                        results.lock().push((expected.clone(), bp.clone()));
                    }
                });
            ctx.write(Abd::from_vec(data), BLOCK as u64, prop.clone(), opts)
                .nowait();
        }
        assert_ok!(root.wait());
        results.lock().clone()
    }

    #[test]
    fn queued_writers_all_get_through() {
        let ctx = throttled(1);
        let written = write_many(&ctx, 32, WriteProps::default(), Priority::AsyncWrite);

        assert_eq!(written.len(), 32);
        assert_eq!(ctx.throttle_reserved(), 0);
        assert_eq!(ctx.throttle_queued(), 0);
        for (data, bp) in &written {
            assert_eq!(&ctx.read_block(bp), data);
        }
    }

    #[test]
    fn multi_copy_writes_reserve_a_slot_per_copy() {
        let ctx = throttled(2);
        let prop = WriteProps {
            copies: 2,
            ..WriteProps::default()
        };
        let written = write_many(&ctx, 12, prop, Priority::AsyncWrite);

        assert_eq!(written.len(), 12);
        assert!(written.iter().all(|(_, bp)| bp.ndvas() == 2));
        assert_eq!(ctx.throttle_reserved(), 0);
        assert_eq!(ctx.throttle_queued(), 0);
    }

    #[test]
    fn sync_writes_bypass_the_throttle() {
        let ctx = throttled(1);
        let written = write_many(&ctx, 8, WriteProps::default(), Priority::SyncWrite);
        assert_eq!(written.len(), 8);
        assert_eq!(ctx.throttle_reserved(), 0);
    }

    #[test]
    fn disabled_throttle_admits_everything() {
        let config = PoolConfig {
            throttle: ThrottleConfig {
                enabled: false,
                ..ThrottleConfig::default()
            },
            ..small_config()
        };
        let ctx = TestPool::new(config, vec![TopLevelSpec::memory_disk(4 * DISK)]);
        let written = write_many(&ctx, 16, WriteProps::default(), Priority::AsyncWrite);
        assert_eq!(written.len(), 16);
        assert_eq!(ctx.throttle_reserved(), 0);
    }
}
