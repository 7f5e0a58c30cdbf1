//! Reusable fixed-capacity packet buffers.
//!
//! Every buffer that touches the wire has the same capacity ([`crate::MTU_LIMIT`])
//! and is recycled through a process-wide pool: allocating per packet at line rate is
//! the dominant allocation cost of the transport, reuse is not optional.

mod packet_buf;
mod pool;

pub use packet_buf::PacketBuf;
pub use pool::{pool, BufferPool};
