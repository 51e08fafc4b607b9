#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;

    use zpipe::storage::abd::Abd;
    use zpipe::storage::blkptr::WriteProps;
    use zpipe::storage::pool::IoOptions;

    use crate::assert_ok;
    use crate::common::harness::{pattern, shared, TestPool, BLOCK};

    fn dedup_props() -> WriteProps {
        WriteProps {
            dedup: true,
            ..WriteProps::default()
        }
    }

    #[test]
    fn identical_blocks_share_one_copy() {
        let ctx = TestPool::single_disk();
        let before = ctx.free_space();
        let data = pattern(BLOCK, 40);

        let first = ctx.write_block(&data, dedup_props());
        assert!(first.dedup);
        assert_eq!(ctx.dedup_entries(), 1);
        assert_eq!(ctx.free_space(), before - BLOCK as u64);

        let second = ctx.write_block(&data, dedup_props());
        assert_eq!(second.dvas, first.dvas);
        assert_eq!(ctx.dedup_refcount(&first), 2);
        assert_eq!(ctx.dedup_entries(), 1);
        assert_eq!(ctx.free_space(), before - BLOCK as u64);

        assert_eq!(ctx.read_block(&second), data);

        // Space comes back only with the last reference.
        assert_ok!(ctx.free_sync(&first));
        assert_eq!(ctx.free_space(), before - BLOCK as u64);
        assert_eq!(ctx.read_block(&second), data);
        assert_ok!(ctx.free_sync(&second));
        assert_eq!(ctx.free_space(), before);
        assert_eq!(ctx.dedup_entries(), 0);
    }

    #[test]
    fn different_blocks_get_their_own_entries() {
        let ctx = TestPool::single_disk();
        let a = ctx.write_block(&pattern(BLOCK, 41), dedup_props());
        let b = ctx.write_block(&pattern(BLOCK, 42), dedup_props());
        assert_ne!(a.dvas, b.dvas);
        assert_eq!(ctx.dedup_entries(), 2);
    }

    #[test]
    fn concurrent_writers_join_one_lead() {
        let ctx = TestPool::single_disk();
        let before = ctx.free_space();
        let data = pattern(BLOCK, 43);
        let root = ctx.root();
        let bps = shared(Vec::new());

        for _ in 0..6 {
            let bps = Arc::clone(&bps);
            let opts = IoOptions::new().parent(root.id()).on_done(move |view| {
                if let Some(bp) = view.bp() {
                    bps.lock().push(bp.clone());
                }
            });
            ctx.write(Abd::from_slice(&data), BLOCK as u64, dedup_props(), opts)
                .nowait();
        }
        assert_ok!(root.wait());

        let bps = bps.lock().clone();
        assert_eq!(bps.len(), 6);
        assert!(bps.iter().all(|bp| bp.dvas == bps[0].dvas));
        assert_eq!(ctx.dedup_entries(), 1);
        assert_eq!(ctx.dedup_refcount(&bps[0]), 6);
        assert_eq!(ctx.free_space(), before - BLOCK as u64);

        for bp in &bps {
            assert_ok!(ctx.free_sync(bp));
        }
        assert_eq!(ctx.free_space(), before);
        assert_eq!(ctx.dedup_entries(), 0);
    }

    #[test]
    fn writers_racing_the_lead_are_all_counted() {
        const WRITERS: usize = 8;
        let ctx = TestPool::single_disk();
        let before = ctx.free_space();

        for round in 0..20u64 {
            let data = pattern(BLOCK, 500 + round);
            let barrier = Barrier::new(WRITERS);
            let (ctx, data, barrier) = (&ctx, &data, &barrier);
            let bps: Vec<_> = thread::scope(|s| {
                let handles: Vec<_> = (0..WRITERS)
                    .map(|_| {
                        s.spawn(move || {
                            barrier.wait();
                            ctx.write_block(data, dedup_props())
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|h| h.join().expect("writer thread"))
                    .collect()
            });

            assert!(bps.iter().all(|bp| bp.dvas == bps[0].dvas));
            assert_eq!(ctx.dedup_refcount(&bps[0]), WRITERS as u64, "round {}", round);
            assert_eq!(ctx.free_space(), before - BLOCK as u64);

            // Every reference but the last keeps the copy alive.
            for bp in &bps[1..] {
                assert_ok!(ctx.free_sync(bp));
                assert_eq!(&ctx.read_block(&bps[0]), data);
            }
            assert_ok!(ctx.free_sync(&bps[0]));
            assert_eq!(ctx.free_space(), before);
            assert_eq!(ctx.dedup_entries(), 0);
        }
    }
}
