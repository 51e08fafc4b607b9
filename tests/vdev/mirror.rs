#[cfg(test)]
mod tests {
    use zpipe::storage::blkptr::WriteProps;
    use zpipe::storage::vdev::{TopLevelSpec, VdevKind};

    use crate::assert_ok;
    use crate::common::harness::{pattern, small_config, TestPool, BLOCK, DISK};

    fn two_way() -> TestPool {
        TestPool::new(small_config(), vec![TopLevelSpec::memory_mirror(DISK, 2)])
    }

    #[test]
    fn mirror_leaves_follow_the_top_level_ids() {
        let ctx = two_way();
        let top = assert_ok!(ctx.vdev(0));
        assert_eq!(top.kind(), VdevKind::Mirror);
        let ids: Vec<_> = top.children().iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(ctx.free_space(), DISK);
    }

    #[test]
    fn writes_land_on_every_leaf() {
        let ctx = two_way();
        let data = pattern(BLOCK, 70);
        let bp = ctx.write_block(&data, WriteProps::default());
        assert_eq!(bp.ndvas(), 1);

        for leaf in [1, 2] {
            assert_eq!(assert_ok!(ctx.vdev_stats(leaf)).writes, 1);
        }
        assert_eq!(ctx.read_block(&bp), data);
    }

    #[test]
    fn bad_copy_is_healed_from_a_good_one() {
        let ctx = two_way();
        let data = pattern(BLOCK, 71);
        let bp = ctx.write_block(&data, WriteProps::default());
        let first = assert_ok!(ctx.vdev(1));
        first.faults().corrupt_next_reads(1);

        assert_eq!(ctx.read_block(&bp), data);
        let stats = first.stats().snapshot();
        assert_eq!(stats.checksum_errors, 1);
        assert_eq!(stats.writes, 2);
        assert_eq!(assert_ok!(ctx.vdev_stats(2)).reads, 1);

        // The repaired copy now reads back clean on its own.
        let second = assert_ok!(ctx.vdev(2));
        second.faults().set_unavailable(true);
        assert_eq!(ctx.read_block(&bp), data);
        assert_eq!(first.stats().snapshot().checksum_errors, 1);
        second.faults().set_unavailable(false);
    }

    #[test]
    fn mirror_survives_one_missing_leaf() {
        let ctx = two_way();
        let first = assert_ok!(ctx.vdev(1));
        first.faults().set_unavailable(true);

        let data = pattern(BLOCK, 72);
        let bp = ctx.write_block(&data, WriteProps::default());
        assert_eq!(ctx.read_block(&bp), data);

        // The missing leaf is never read from.
        assert_eq!(first.stats().snapshot().reads, 0);
        assert_eq!(assert_ok!(ctx.vdev_stats(2)).reads, 1);
        assert!(assert_ok!(ctx.vdev(0)).is_accessible());
        first.faults().set_unavailable(false);
    }
}
