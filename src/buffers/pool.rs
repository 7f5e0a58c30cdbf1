use std::sync::Mutex;

use tracing::trace;

use crate::buffers::PacketBuf;

/// Number of idle buffers the pool retains; buffers returned beyond this are dropped.
const POOL_RETENTION: usize = 4096;

/// A thread-safe recycling pool of [`PacketBuf`]s.
///
/// Sending, receiving and FEC all draw from the same pool, so a buffer received from
/// the socket can be handed through the pipeline and recycled wherever it ends up.
pub struct BufferPool {
    buffers: Mutex<Vec<PacketBuf>>,
}

static POOL: BufferPool = BufferPool::new();

/// The process-wide packet buffer pool.
pub fn pool() -> &'static BufferPool {
    &POOL
}

impl BufferPool {
    const fn new() -> BufferPool {
        BufferPool {
            buffers: Mutex::new(Vec::new()),
        }
    }

    /// Get a buffer with `len == 0`. The backing store may contain stale bytes from a
    ///  previous use; callers must overwrite before reading.
    pub fn get(&self) -> PacketBuf {
        {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(buffer) = buffers.pop() {
                return buffer;
            }
        }
        trace!("pool empty: allocating packet buffer");
        PacketBuf::new()
    }

    pub fn put(&self, mut buffer: PacketBuf) {
        buffer.clear();

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.len() < POOL_RETENTION {
            buffers.push(buffer);
        }
        // else: pool is full, let the buffer drop
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_put_roundtrip() {
        let pool = BufferPool::new();

        let mut buf = pool.get();
        buf.put_slice(b"hello");
        pool.put(buf);

        let buf = pool.get();
        assert_eq!(buf.len(), 0, "recycled buffers start empty");
        assert_eq!(pool.buffers.lock().unwrap().len(), 0);
    }

    #[test]
    fn test_get_on_empty_pool_allocates() {
        let pool = BufferPool::new();
        assert_eq!(pool.get().capacity(), crate::MTU_LIMIT);
    }
}
