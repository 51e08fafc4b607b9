//! Shared data buffers.
//!
//! An [`Abd`] is a cheaply clonable handle onto a byte range of a shared
//! backing buffer. Offset views let gang member reads land directly in the
//! caller's buffer and let device children read into their parent's data
//! without copying.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Clone)]
pub struct Abd {
    buf: Arc<Mutex<Vec<u8>>>,
    offset: usize,
    len: usize,
}

impl Abd {
    /// Allocates a zero-filled buffer.
    pub fn alloc(len: usize) -> Self {
        Self::from_vec(vec![0u8; len])
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            buf: Arc::new(Mutex::new(data)),
            offset: 0,
            len,
        }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self::from_vec(data.to_vec())
    }

    /// A view of `len` bytes starting `offset` bytes into this buffer.
    pub fn get_offset(&self, offset: usize, len: usize) -> Self {
        debug_assert!(offset + len <= self.len, "view past end of buffer");
        Self {
            buf: Arc::clone(&self.buf),
            offset: self.offset + offset,
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True when both handles view the same backing allocation.
    pub fn shares_backing(&self, other: &Abd) -> bool {
        Arc::ptr_eq(&self.buf, &other.buf)
    }

    pub fn with_slice<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.buf.lock();
        f(&guard[self.offset..self.offset + self.len])
    }

    pub fn with_slice_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut guard = self.buf.lock();
        f(&mut guard[self.offset..self.offset + self.len])
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.with_slice(|s| s.to_vec())
    }

    /// Copies the first `len` bytes of `src` into the start of `self`.
    pub fn copy_from(&self, src: &Abd, len: usize) {
        let len = len.min(self.len).min(src.len);
        if self.shares_backing(src) {
            let mut guard = self.buf.lock();
            guard.copy_within(src.offset..src.offset + len, self.offset);
            return;
        }
        let data = src.with_slice(|s| s[..len].to_vec());
        self.with_slice_mut(|d| d[..len].copy_from_slice(&data));
    }

    pub fn copy_from_slice(&self, offset: usize, data: &[u8]) {
        self.with_slice_mut(|d| d[offset..offset + data.len()].copy_from_slice(data));
    }

    /// Zeroes `len` bytes starting at `offset`.
    pub fn zero_range(&self, offset: usize, len: usize) {
        self.with_slice_mut(|d| d[offset..offset + len].fill(0));
    }

    pub fn is_zero(&self) -> bool {
        self.with_slice(|s| s.iter().all(|&b| b == 0))
    }
}

impl fmt::Debug for Abd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Abd")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}
