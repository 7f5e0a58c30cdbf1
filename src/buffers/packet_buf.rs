use std::borrow::Borrow;
use std::fmt::{Debug, Formatter};

use bytes::buf::UninitSlice;

use crate::MTU_LIMIT;

/// A packet-sized buffer with a fixed, pre-allocated backing store.
///
/// The buffer tracks a `len` within its capacity; `as_ref`/`as_mut` expose only the
/// first `len` bytes. Contents beyond previous writes are unspecified after pool
/// reuse - callers must overwrite before reading.
#[derive(Eq)]
pub struct PacketBuf {
    buf: Box<[u8]>,
    len: usize,
}

impl PacketBuf {
    pub fn new() -> PacketBuf {
        PacketBuf {
            buf: vec![0; MTU_LIMIT].into_boxed_slice(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// make the entire backing store visible through `as_ref` / `as_mut`
    pub fn maximize_len(&mut self) {
        self.len = self.capacity();
    }

    /// set the visible length, e.g. after a socket read or to reserve header space
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.capacity());
        self.len = len;
    }

    pub fn truncate(&mut self, len: usize) {
        if len < self.len {
            self.len = len;
        }
    }

    pub fn put_slice(&mut self, data: &[u8]) {
        self.buf[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
    }

    /// convenience for test code: a buffer pre-filled from a slice
    #[cfg(test)]
    pub fn from_slice(data: &[u8]) -> PacketBuf {
        let mut result = PacketBuf::new();
        result.put_slice(data);
        result
    }
}

impl Default for PacketBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for PacketBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref().eq(other.as_ref())
    }
}

impl Debug for PacketBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_ref().fmt(f)
    }
}

impl Borrow<[u8]> for PacketBuf {
    fn borrow(&self) -> &[u8] {
        self.as_ref()
    }
}

impl AsRef<[u8]> for PacketBuf {
    fn as_ref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl AsMut<[u8]> for PacketBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

unsafe impl bytes::BufMut for PacketBuf {
    fn remaining_mut(&self) -> usize {
        self.capacity() - self.len
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(self.len + cnt <= self.capacity());
        self.len += cnt;
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        UninitSlice::new(&mut self.buf[self.len..])
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::empty(b"", 0)]
    #[case::data(b"abc", 3)]
    fn test_len(#[case] content: &[u8], #[case] expected: usize) {
        assert_eq!(PacketBuf::from_slice(content).len(), expected);
    }

    #[test]
    fn test_capacity_is_fixed() {
        let mut buf = PacketBuf::new();
        assert_eq!(buf.capacity(), MTU_LIMIT);
        buf.put_slice(b"hello");
        assert_eq!(buf.capacity(), MTU_LIMIT);
    }

    #[test]
    fn test_clear_and_maximize() {
        let mut buf = PacketBuf::from_slice(b"hello");
        buf.clear();
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.as_ref(), b"");

        buf.maximize_len();
        assert_eq!(buf.len(), MTU_LIMIT);
    }

    #[rstest]
    #[case::shrink(3, b"hel")]
    #[case::noop(5, b"hello")]
    #[case::beyond(9, b"hello")]
    fn test_truncate(#[case] len: usize, #[case] expected: &[u8]) {
        let mut buf = PacketBuf::from_slice(b"hello");
        buf.truncate(len);
        assert_eq!(buf.as_ref(), expected);
    }

    #[test]
    fn test_set_len_exposes_reserved_region() {
        let mut buf = PacketBuf::new();
        buf.set_len(4);
        buf.as_mut().copy_from_slice(b"abcd");
        assert_eq!(buf.as_ref(), b"abcd");
    }

    #[test]
    fn test_as_mut_modification() {
        let mut buf = PacketBuf::from_slice(b"abc");
        buf.as_mut()[0] = b'A';
        assert_eq!(buf.as_ref(), b"Abc");
    }

    #[test]
    fn test_buf_mut() {
        let mut buf = PacketBuf::new();
        buf.put_u8(1);
        buf.put_u32_le(7);
        assert_eq!(buf.as_ref(), &[1, 7, 0, 0, 0]);
        assert_eq!(buf.remaining_mut(), MTU_LIMIT - 5);
    }
}
