#![forbid(unsafe_code)]

use pfs_block::{
    BlockDevice, BufferCache, ByteBlockDevice, ByteDevice, CacheConfig, FileByteDevice,
};
use pfs_error::PfsError;
use pfs_types::BlockNumber;

const BLOCK_SIZE: u32 = 4096;

#[test]
fn cached_writes_reach_the_image_only_after_sync() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("volume.img");
    let file = FileByteDevice::create(&path, 16 * u64::from(BLOCK_SIZE)).expect("create");
    let cache = BufferCache::new(
        ByteBlockDevice::new(file, BLOCK_SIZE).expect("block device"),
        CacheConfig { capacity: 4 },
    )
    .expect("cache");

    cache
        .write_block(BlockNumber(3), &[0xA5_u8; 4096])
        .expect("write");

    let reopened = FileByteDevice::open(&path).expect("reopen");
    let mut on_disk = vec![0_u8; 4096];
    reopened
        .read_exact_at(3 * 4096, &mut on_disk)
        .expect("read before sync");
    assert!(on_disk.iter().all(|b| *b == 0));

    cache.sync().expect("sync");
    reopened
        .read_exact_at(3 * 4096, &mut on_disk)
        .expect("read after sync");
    assert!(on_disk.iter().all(|b| *b == 0xA5));
}

#[test]
fn file_device_rejects_out_of_bounds_io() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("small.img");
    let file = FileByteDevice::create(&path, 8192).expect("create");

    let mut buf = [0_u8; 16];
    let err = file.read_exact_at(8190, &mut buf).unwrap_err();
    assert!(matches!(err, PfsError::Format(_)));
    assert!(file.write_all_at(8192, &buf).is_err());

    let dev = ByteBlockDevice::new(file, BLOCK_SIZE).expect("block device");
    assert_eq!(dev.block_count(), 2);
    assert!(dev.read_block(BlockNumber(2)).is_err());
}
