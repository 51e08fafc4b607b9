#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use zpipe::storage::allocator::AllocClass;
    use zpipe::storage::blkptr::WriteProps;
    use zpipe::storage::pool::Pool;
    use zpipe::storage::vdev::{DeviceSpec, TopLevelSpec};

    use crate::assert_ok;
    use crate::common::harness::{pattern, small_config, TestPool, BLOCK, DISK};

    fn file_vdev(dir: &TempDir, name: &str) -> TopLevelSpec {
        TopLevelSpec {
            class: AllocClass::Normal,
            ashift: 12,
            devices: vec![DeviceSpec::File {
                path: dir.path().join(name),
                size: DISK,
            }],
        }
    }

    #[test]
    fn blocks_survive_reopening_the_pool() {
        let dir = assert_ok!(TempDir::new());
        let data = pattern(3 * BLOCK, 90);

        let bp = {
            let pool = assert_ok!(Pool::open("filepool", small_config(), vec![file_vdev(&dir, "disk0")]));
            let ctx = TestPool::from_pool(pool, None);
            let bp = ctx.write_block(&data, WriteProps::default());
            assert_ok!(assert_ok!(ctx.flush(None, None)).wait());
            bp
        };
        assert_eq!(assert_ok!(std::fs::metadata(dir.path().join("disk0"))).len(), DISK);

        let pool = assert_ok!(Pool::open("filepool", small_config(), vec![file_vdev(&dir, "disk0")]));
        let ctx = TestPool::from_pool(pool, Some(dir));
        assert_eq!(ctx.read_block(&bp), data);
    }

    #[test]
    fn file_mirror_round_trip() {
        let dir = assert_ok!(TempDir::new());
        let spec = TopLevelSpec {
            devices: vec![
                DeviceSpec::File {
                    path: dir.path().join("a"),
                    size: DISK,
                },
                DeviceSpec::File {
                    path: dir.path().join("b"),
                    size: DISK,
                },
            ],
            ..file_vdev(&dir, "unused")
        };
        let pool = assert_ok!(Pool::open("filemirror", small_config(), vec![spec]));
        let ctx = TestPool::from_pool(pool, Some(dir));

        let data = pattern(BLOCK, 91);
        let bp = ctx.write_block(&data, WriteProps::default());
        assert_ok!(ctx.vdev(2)).faults().set_unavailable(true);
        assert_eq!(ctx.read_block(&bp), data);
    }
}
