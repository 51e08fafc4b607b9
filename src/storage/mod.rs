pub mod abd;
pub mod allocator;
pub mod blkptr;
pub mod checksum;
pub mod compression;
pub mod crypt;
pub mod dedup;
pub mod pool;
pub mod vdev;
pub mod zio;
