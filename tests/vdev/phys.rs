#[cfg(test)]
mod tests {
    use zpipe::common::exception::{PoolError, ZioError};
    use zpipe::storage::abd::Abd;
    use zpipe::storage::blkptr::{ChecksumKind, GANG_TAIL_SIZE};
    use zpipe::storage::pool::IoOptions;
    use zpipe::storage::vdev::TopLevelSpec;

    use crate::assert_ok;
    use crate::common::harness::{pattern, small_config, TestPool, DISK};

    const LABEL: usize = 512;
    const LABEL_OFFSET: u64 = DISK - 4 * LABEL as u64;

    fn read_label(ctx: &TestPool, offset: u64, opts: IoOptions) -> Result<Vec<u8>, ZioError> {
        let buf = Abd::alloc(LABEL);
        let zio = assert_ok!(ctx.read_phys(0, offset, buf.clone(), ChecksumKind::Label, opts));
        zio.wait()?;
        Ok(buf.to_vec())
    }

    #[test]
    fn labels_carry_their_own_checksum() {
        let ctx = TestPool::single_disk();
        let label = pattern(LABEL, 80);
        let source = Abd::from_slice(&label);
        let write = assert_ok!(ctx.write_phys(0, LABEL_OFFSET, source.clone(), ChecksumKind::Label, IoOptions::new()));
        assert_ok!(write.wait());

        // The caller's buffer is left alone.
        assert_eq!(source.to_vec(), label);

        let back = assert_ok!(read_label(&ctx, LABEL_OFFSET, IoOptions::new()));
        let body = LABEL - GANG_TAIL_SIZE;
        assert_eq!(back[..body], label[..body]);
    }

    #[test]
    fn label_read_from_the_wrong_place_fails() {
        let ctx = TestPool::single_disk();
        let write = assert_ok!(ctx.write_phys(
            0,
            LABEL_OFFSET,
            Abd::from_slice(&pattern(LABEL, 81)),
            ChecksumKind::Label,
            IoOptions::new(),
        ));
        assert_ok!(write.wait());

        let at = LABEL_OFFSET + LABEL as u64;
        let copy = Abd::alloc(LABEL);
        let raw = assert_ok!(ctx.read_phys(0, LABEL_OFFSET, copy.clone(), ChecksumKind::Off, IoOptions::new()));
        assert_ok!(raw.wait());
        let moved = assert_ok!(ctx.write_phys(0, at, copy, ChecksumKind::Off, IoOptions::new()));
        assert_ok!(moved.wait());

        let result = read_label(&ctx, at, IoOptions::new().can_fail());
        assert_eq!(result.err(), Some(ZioError::ChecksumMismatch));
    }

    #[test]
    fn corrupted_label_is_detected() {
        let ctx = TestPool::single_disk();
        let write = assert_ok!(ctx.write_phys(
            0,
            LABEL_OFFSET,
            Abd::from_slice(&pattern(LABEL, 82)),
            ChecksumKind::Label,
            IoOptions::new(),
        ));
        assert_ok!(write.wait());

        let leaf = assert_ok!(ctx.vdev(0));
        leaf.faults().corrupt_next_reads(2);
        let result = read_label(&ctx, LABEL_OFFSET, IoOptions::new().can_fail());
        assert_eq!(result.err(), Some(ZioError::ChecksumMismatch));
        assert!(leaf.stats().snapshot().checksum_errors >= 1);
    }

    #[test]
    fn physical_io_needs_a_leaf() {
        let ctx = TestPool::new(small_config(), vec![TopLevelSpec::memory_mirror(DISK, 2)]);
        let result = ctx.read_phys(0, 0, Abd::alloc(LABEL), ChecksumKind::Off, IoOptions::new());
        assert!(matches!(result, Err(PoolError::InvalidRequest(_))));
        assert!(matches!(
            ctx.write_phys(9, 0, Abd::alloc(LABEL), ChecksumKind::Off, IoOptions::new()),
            Err(PoolError::VdevNotFound(9))
        ));

        // Leaves of the mirror take physical I/O directly.
        let write = assert_ok!(ctx.write_phys(1, 0, Abd::from_slice(&pattern(LABEL, 83)), ChecksumKind::Off, IoOptions::new()));
        assert_ok!(write.wait());
        assert_eq!(assert_ok!(ctx.vdev_stats(1)).writes, 1);
        assert_eq!(assert_ok!(ctx.vdev_stats(2)).writes, 0);
    }
}
