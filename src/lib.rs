//! # zpipe
//!
//! The I/O execution core of a pooled, transactional storage engine. Every
//! read, write, free, claim, trim and ioctl issued against a [`Pool`] runs
//! through one asynchronous multi-stage pipeline (`storage::zio`) that tracks
//! parent/child dependencies, applies reversible data transforms, splits
//! unallocatable blocks into gang trees, throttles allocation, and retries,
//! reexecutes or suspends on failure.
//!
//! [`Pool`]: storage::pool::Pool

pub mod common;
pub mod storage;
