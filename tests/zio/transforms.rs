#[cfg(test)]
mod tests {
    use zpipe::common::exception::ZioError;
    use zpipe::storage::abd::Abd;
    use zpipe::storage::blkptr::{ChecksumKind, CompressKind, CryptKind, WriteProps};
    use zpipe::storage::pool::IoOptions;

    use crate::assert_ok;
    use crate::common::harness::{pattern, TestPool, BLOCK};

    fn compressible(len: usize) -> Vec<u8> {
        (0..len).map(|i| if (i / 256) % 2 == 0 { 0xab } else { 0x00 }).collect()
    }

    #[test]
    fn compressed_block_reads_back_expanded() {
        let ctx = TestPool::single_disk();
        let before = ctx.free_space();
        let data = compressible(4 * BLOCK);
        let prop = WriteProps {
            compress: CompressKind::Rle,
            ..WriteProps::default()
        };

        let bp = ctx.write_block(&data, prop);
        assert_eq!(bp.compress, CompressKind::Rle);
        assert_eq!(bp.lsize, data.len() as u64);
        assert!(bp.psize < bp.lsize);
        assert_eq!(bp.psize % 512, 0);
        assert_eq!(ctx.free_space(), before - bp.psize);

        assert_eq!(ctx.read_block(&bp), data);
    }

    #[test]
    fn incompressible_block_is_stored_raw() {
        let ctx = TestPool::single_disk();
        let data = pattern(BLOCK, 20);
        let prop = WriteProps {
            compress: CompressKind::Rle,
            ..WriteProps::default()
        };

        let bp = ctx.write_block(&data, prop);
        assert_eq!(bp.compress, CompressKind::Off);
        assert_eq!(bp.psize, BLOCK as u64);
        assert_eq!(ctx.read_block(&bp), data);
    }

    #[test]
    fn all_zero_block_becomes_a_hole() {
        let ctx = TestPool::single_disk();
        let before = ctx.free_space();
        let prop = WriteProps {
            compress: CompressKind::Rle,
            ..WriteProps::default()
        };

        let bp = ctx.write_block(&vec![0u8; BLOCK], prop);
        assert!(bp.is_hole());
        assert_eq!(ctx.free_space(), before);

        // A hole that was never written has no birth either.
        assert_eq!(bp.birth_txg, 0);
    }

    #[test]
    fn encrypted_block_is_ciphertext_on_disk() {
        let ctx = TestPool::single_disk();
        ctx.load_key(7, b"test key material");
        let data = pattern(BLOCK, 21);
        let prop = WriteProps {
            crypt: CryptKind::Keystream,
            key_id: 7,
            ..WriteProps::default()
        };

        let bp = ctx.write_block(&data, prop);
        assert_eq!(bp.crypt, CryptKind::Keystream);
        let params = bp.crypt_params.expect("encrypted block carries parameters");
        assert_eq!(params.key_id, 7);
        assert_eq!(ctx.read_block(&bp), data);

        let dva = bp.dvas[0];
        let raw = Abd::alloc(BLOCK);
        let phys = assert_ok!(ctx.read_phys(dva.vdev, dva.offset, raw.clone(), ChecksumKind::Off, IoOptions::new()));
        assert_ok!(phys.wait());
        assert_ne!(raw.to_vec(), data);

        ctx.unload_key(7);
        let locked = ctx.read_with(&bp, IoOptions::new().can_fail());
        assert_eq!(locked.err(), Some(ZioError::Authentication));
    }

    #[test]
    fn encryption_without_a_key_fails() {
        let ctx = TestPool::single_disk();
        let before = ctx.free_space();
        let prop = WriteProps {
            crypt: CryptKind::Keystream,
            key_id: 99,
            ..WriteProps::default()
        };

        let result = ctx.write_with(&pattern(BLOCK, 22), prop, IoOptions::new().can_fail());
        assert_eq!(result.err(), Some(ZioError::Authentication));
        assert_eq!(ctx.free_space(), before);
    }

    #[test]
    fn compression_and_encryption_compose() {
        let ctx = TestPool::single_disk();
        ctx.load_key(3, b"another key");
        let data = compressible(2 * BLOCK);
        let prop = WriteProps {
            compress: CompressKind::Rle,
            crypt: CryptKind::Keystream,
            key_id: 3,
            ..WriteProps::default()
        };

        let bp = ctx.write_block(&data, prop);
        assert_eq!(bp.compress, CompressKind::Rle);
        assert_eq!(bp.crypt, CryptKind::Keystream);
        assert!(bp.psize < bp.lsize);
        assert_eq!(ctx.read_block(&bp), data);
    }
}
