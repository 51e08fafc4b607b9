#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use zpipe::common::config::PoolConfig;
    use zpipe::common::exception::{PoolError, ZioError};
    use zpipe::storage::abd::Abd;
    use zpipe::storage::blkptr::{BlockPointer, ChecksumKind, WriteProps};
    use zpipe::storage::pool::IoOptions;
    use zpipe::storage::vdev::TopLevelSpec;
    use zpipe::storage::zio::{Priority, Stage, ZioType};

    use crate::assert_ok;
    use crate::common::harness::{pattern, shared, small_config, wait_until, TestPool, BLOCK, DISK};

    #[test]
    fn write_then_read_round_trip() {
        let ctx = TestPool::single_disk();
        let before = ctx.free_space();
        let data = pattern(BLOCK, 1);

        let bp = ctx.write_block(&data, WriteProps::default());
        assert_eq!(bp.lsize, BLOCK as u64);
        assert_eq!(bp.psize, BLOCK as u64);
        assert_eq!(bp.ndvas(), 1);
        assert_eq!(bp.birth_txg, ctx.txg());
        assert_eq!(ctx.free_space(), before - BLOCK as u64);

        assert_eq!(ctx.read_block(&bp), data);

        assert_ok!(ctx.free_sync(&bp));
        assert_eq!(ctx.free_space(), before);
    }

    #[test]
    fn unaligned_block_is_padded_to_a_sector() {
        let ctx = TestPool::single_disk();
        let before = ctx.free_space();
        let data = pattern(1000, 2);

        let bp = ctx.write_block(&data, WriteProps::default());
        assert_eq!(bp.psize, 1000);
        assert_eq!(bp.dvas[0].asize, 1024);
        assert_eq!(ctx.free_space(), before - 1024);
        assert_eq!(ctx.read_block(&bp), data);
    }

    #[test]
    fn copies_are_clamped_and_spread_across_devices() {
        let config = PoolConfig {
            max_replication: 2,
            ..small_config()
        };
        let ctx = TestPool::new(
            config,
            vec![
                TopLevelSpec::memory_disk(DISK),
                TopLevelSpec::memory_disk(DISK),
            ],
        );
        let data = pattern(BLOCK, 3);
        let prop = WriteProps {
            copies: 3,
            ..WriteProps::default()
        };

        let bp = ctx.write_block(&data, prop);
        assert_eq!(bp.ndvas(), 2);
        assert_ne!(bp.dvas[0].vdev, bp.dvas[1].vdev);
        assert_eq!(ctx.read_block(&bp), data);

        // Either copy alone can serve the read.
        assert_ok!(ctx.vdev(bp.dvas[0].vdev)).faults().fail_next_reads(1);
        assert_eq!(ctx.read_block(&bp), data);
    }

    #[test]
    fn stage_trace_follows_pipeline_order() {
        let config = PoolConfig {
            trace_stages: true,
            ..small_config()
        };
        let ctx = TestPool::new(config, vec![TopLevelSpec::memory_disk(DISK)]);
        let data = pattern(BLOCK, 4);

        let done = assert_ok!(
            ctx.write(Abd::from_slice(&data), BLOCK as u64, WriteProps::default(), IoOptions::new())
                .wait()
        );
        for stage in [
            Stage::WriteBpInit,
            Stage::WriteCompress,
            Stage::ChecksumGenerate,
            Stage::DvaAllocate,
            Stage::Ready,
            Stage::VdevIoStart,
            Stage::VdevIoDone,
            Stage::VdevIoAssess,
            Stage::Done,
        ] {
            assert!(done.trace.contains(&stage), "write never ran {:?}", stage);
        }
        // A stage that stalled on its children runs again when they finish.
        let mut trace = done.trace.clone();
        trace.dedup();
        assert!(trace.windows(2).all(|w| w[0] < w[1]), "{:?}", done.trace);
        assert!(!trace.contains(&Stage::ChecksumVerify));

        let bp = done.bp.expect("write has a block pointer");
        let buf = Abd::alloc(BLOCK);
        let mut read = assert_ok!(ctx.read(&bp, buf, IoOptions::new()).wait());
        read.trace.dedup();
        assert_eq!(
            read.trace,
            vec![
                Stage::ReadBpInit,
                Stage::Ready,
                Stage::VdevIoStart,
                Stage::VdevIoDone,
                Stage::VdevIoAssess,
                Stage::Done,
            ]
        );
    }

    #[test]
    fn hole_read_zero_fills_the_buffer() {
        let ctx = TestPool::single_disk();
        let buf = Abd::from_vec(vec![0xff; BLOCK]);
        let mut hole = BlockPointer::hole();
        hole.lsize = BLOCK as u64;

        assert_ok!(ctx.read(&hole, buf.clone(), IoOptions::new()).wait());
        assert!(buf.is_zero());
    }

    #[test]
    fn callbacks_run_once_with_the_final_pointer() {
        let ctx = TestPool::single_disk();
        let ready = Arc::new(AtomicUsize::new(0));
        let seen = shared(None::<BlockPointer>);

        let r = Arc::clone(&ready);
        let s = Arc::clone(&seen);
        let opts = IoOptions::new()
            .on_ready(move |view| {
                assert!(view.bp().is_some_and(|bp| !bp.is_hole()));
                r.fetch_add(1, Ordering::SeqCst);
            })
            .on_done(move |view| {
                *s.lock() = view.bp().cloned();
            });

        let bp = assert_ok!(ctx.write_with(&pattern(BLOCK, 5), WriteProps::default(), opts));
        assert_eq!(ready.load(Ordering::SeqCst), 1);
        assert_eq!(seen.lock().as_ref(), Some(&bp));
    }

    #[test]
    fn null_parent_waits_for_every_child() {
        let ctx = TestPool::single_disk();
        let root = ctx.root();
        let bps = shared(Vec::new());

        let blocks: Vec<Vec<u8>> = (0..8).map(|i| pattern(BLOCK, 100 + i)).collect();
        for (i, data) in blocks.iter().enumerate() {
            let bps = Arc::clone(&bps);
            let opts = IoOptions::new().parent(root.id()).on_done(move |view| {
                if let Some(bp) = view.bp() {
                    bps.lock().push((i, bp.clone()));
                }
            });
            ctx.write(Abd::from_slice(data), BLOCK as u64, WriteProps::default(), opts)
                .nowait();
        }
        assert_ok!(root.wait());

        let mut bps = bps.lock().clone();
        assert_eq!(bps.len(), blocks.len());
        bps.sort_by_key(|(i, _)| *i);
        for (i, bp) in bps {
            assert_eq!(ctx.read_block(&bp), blocks[i]);
        }
    }

    #[test]
    fn waited_requests_are_destroyed() {
        let ctx = TestPool::single_disk();
        let baseline = ctx.live_requests();
        let zio = ctx.write(
            Abd::from_slice(&pattern(BLOCK, 6)),
            BLOCK as u64,
            WriteProps::default(),
            IoOptions::new(),
        );
        let id = zio.id();
        assert!(ctx.request_state(id).is_some());

        assert_ok!(zio.wait());
        assert_eq!(ctx.request_state(id), None);
        assert!(wait_until(Duration::from_secs(5), || ctx.live_requests() == baseline));
        assert!(matches!(
            ctx.change_priority(id, Priority::Now),
            Err(PoolError::RequestNotFound(_))
        ));
    }

    #[test]
    fn nopwrite_keeps_an_unchanged_block() {
        let ctx = TestPool::single_disk();
        let prop = WriteProps {
            nopwrite: true,
            ..WriteProps::default()
        };
        let data = pattern(BLOCK, 7);
        let bp = ctx.write_block(&data, prop.clone());
        let after_first = ctx.free_space();

        let same = assert_ok!(
            ctx.overwrite(&bp, Abd::from_slice(&data), BLOCK as u64, prop.clone(), IoOptions::new())
                .wait()
        );
        assert_eq!(same.bp.as_ref(), Some(&bp));
        assert_eq!(ctx.free_space(), after_first);

        let changed = pattern(BLOCK, 8);
        let new = assert_ok!(
            ctx.overwrite(&bp, Abd::from_slice(&changed), BLOCK as u64, prop, IoOptions::new())
                .wait()
        )
        .bp
        .expect("overwrite has a block pointer");
        assert_ne!(new.dvas, bp.dvas);
        assert_eq!(ctx.read_block(&new), changed);
        assert_eq!(ctx.read_block(&bp), data);
    }

    #[test]
    fn override_pointer_skips_allocation() {
        let ctx = TestPool::single_disk();
        let data = pattern(BLOCK, 9);
        let bp = ctx.write_block(&data, WriteProps::default());
        let free = ctx.free_space();

        let done = assert_ok!(
            ctx.write_override(
                Abd::from_slice(&data),
                BLOCK as u64,
                WriteProps::default(),
                bp.clone(),
                IoOptions::new(),
            )
            .wait()
        );
        assert_eq!(done.bp, Some(bp));
        assert_eq!(ctx.free_space(), free);
    }

    #[test]
    fn rewrite_replaces_contents_in_place() {
        let ctx = TestPool::single_disk();
        let bp = ctx.write_block(&pattern(BLOCK, 10), WriteProps::default());
        let free = ctx.free_space();
        let replacement = pattern(BLOCK, 11);

        let done = assert_ok!(ctx.rewrite(&bp, Abd::from_slice(&replacement), IoOptions::new()).wait());
        let rewritten = done.bp.expect("rewrite has a block pointer");
        assert_eq!(rewritten.dvas, bp.dvas);
        assert_ne!(rewritten.checksum, bp.checksum);
        assert_eq!(ctx.free_space(), free);
        assert_eq!(ctx.read_block(&rewritten), replacement);
    }

    #[test]
    fn claim_takes_back_freed_space_once() {
        let ctx = TestPool::single_disk();
        let before = ctx.free_space();
        let bp = ctx.write_block(&pattern(BLOCK, 12), WriteProps::default());
        assert_ok!(ctx.free_sync(&bp));
        assert_eq!(ctx.free_space(), before);

        assert_ok!(ctx.claim(&bp, IoOptions::new()).wait());
        assert_eq!(ctx.free_space(), before - BLOCK as u64);

        let again = ctx.claim(&bp, IoOptions::new().can_fail()).wait();
        assert_eq!(again.err(), Some(ZioError::NotFound));
    }

    #[test]
    fn flush_and_trim_reach_the_leaves() {
        let ctx = TestPool::single_disk();
        let bp = ctx.write_block(&pattern(BLOCK, 13), WriteProps::default());
        let dva = bp.dvas[0];

        assert_ok!(assert_ok!(ctx.flush(None, None)).wait());
        assert_ok!(assert_ok!(ctx.flush(Some(dva.vdev), None)).wait());
        assert!(matches!(ctx.flush(Some(42), None), Err(PoolError::VdevNotFound(42))));

        let trim = assert_ok!(ctx.trim(dva.vdev, dva.offset, dva.asize, IoOptions::new()));
        assert_ok!(trim.wait());
        let raw = Abd::alloc(BLOCK);
        let phys = assert_ok!(ctx.read_phys(
            dva.vdev,
            dva.offset,
            raw.clone(),
            ChecksumKind::Off,
            IoOptions::new(),
        ));
        assert_ok!(phys.wait());
        assert!(raw.is_zero());
    }

    #[test]
    fn delegated_io_bypasses_the_block_layer() {
        let ctx = TestPool::single_disk();
        let data = pattern(BLOCK, 14);

        let write = assert_ok!(ctx.vdev_delegated_io(0, ZioType::Write, 8192, Abd::from_slice(&data)));
        assert_ok!(write.wait());

        let buf = Abd::alloc(BLOCK);
        let read = assert_ok!(ctx.vdev_delegated_io(0, ZioType::Read, 8192, buf.clone()));
        assert_ok!(read.wait());
        assert_eq!(buf.to_vec(), data);

        assert!(matches!(
            ctx.vdev_delegated_io(0, ZioType::Free, 0, Abd::alloc(512)),
            Err(PoolError::InvalidRequest(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wait_async_resolves_on_completion() {
        let ctx = TestPool::single_disk();
        let data = pattern(BLOCK, 15);

        let done = ctx
            .write(Abd::from_slice(&data), BLOCK as u64, WriteProps::default(), IoOptions::new())
            .wait_async()
            .await;
        let bp = assert_ok!(done).bp.expect("write has a block pointer");

        let buf = Abd::alloc(BLOCK);
        assert_ok!(ctx.read(&bp, buf.clone(), IoOptions::new()).wait_async().await);
        assert_eq!(buf.to_vec(), data);
    }
}
