#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use zpipe::common::exception::ZioError;
    use zpipe::storage::allocator::ExtentAllocator;
    use zpipe::storage::blkptr::WriteProps;
    use zpipe::storage::pool::{IoOptions, Pool};
    use zpipe::storage::vdev::TopLevelSpec;

    use crate::assert_ok;
    use crate::common::harness::{pattern, small_config, TestPool, BLOCK, DISK};

    /// A pool whose allocator refuses any extent larger than `max_segment`.
    fn fragmented(max_segment: u64, disk: u64) -> (TestPool, Arc<ExtentAllocator>) {
        let allocator = Arc::new(ExtentAllocator::new());
        allocator.set_max_segment(Some(max_segment));
        let pool = Pool::builder("gangpool")
            .config(small_config())
            .vdev(TopLevelSpec::memory_disk(disk))
            .allocator(allocator.clone())
            .open();
        (TestPool::from_pool(assert_ok!(pool), None), allocator)
    }

    #[test]
    fn oversized_write_is_split_into_a_gang() {
        let (ctx, _allocator) = fragmented(BLOCK as u64, DISK);
        let before = ctx.free_space();
        let data = pattern(4 * BLOCK, 30);

        let bp = ctx.write_block(&data, WriteProps::default());
        assert!(bp.is_gang());
        assert_eq!(bp.lsize, data.len() as u64);
        assert!(ctx.free_space() < before - data.len() as u64);

        assert_eq!(ctx.read_block(&bp), data);

        assert_ok!(ctx.free_sync(&bp));
        assert_eq!(ctx.free_space(), before);
    }

    #[test]
    fn nested_gangs_round_trip() {
        // Members of a 64K block are still too big for 2K extents.
        let (ctx, _allocator) = fragmented(2048, DISK);
        let before = ctx.free_space();
        let data = pattern(16 * BLOCK, 31);

        let bp = ctx.write_block(&data, WriteProps::default());
        assert!(bp.is_gang());
        assert_eq!(ctx.read_block(&bp), data);

        assert_ok!(ctx.free_sync(&bp));
        assert_eq!(ctx.free_space(), before);
    }

    #[test]
    fn gang_blocks_can_be_claimed_after_free() {
        let (ctx, _allocator) = fragmented(BLOCK as u64, DISK);
        let before = ctx.free_space();
        let bp = ctx.write_block(&pattern(3 * BLOCK, 32), WriteProps::default());
        let allocated = before - ctx.free_space();

        assert_ok!(ctx.free_sync(&bp));
        assert_eq!(ctx.free_space(), before);

        assert_ok!(ctx.claim(&bp, IoOptions::new()).wait());
        assert_eq!(before - ctx.free_space(), allocated);
    }

    #[test]
    fn failed_gang_write_releases_everything() {
        let (ctx, _allocator) = fragmented(BLOCK as u64, 16 * 1024);
        let before = ctx.free_space();

        let result = ctx.write_with(&pattern(16 * BLOCK, 33), WriteProps::default(), IoOptions::new().can_fail());
        assert_eq!(result.err(), Some(ZioError::NoSpace));
        assert_eq!(ctx.free_space(), before);

        // The pool still works for blocks that fit.
        let data = pattern(BLOCK, 34);
        let bp = ctx.write_block(&data, WriteProps::default());
        assert_eq!(ctx.read_block(&bp), data);
    }
}
