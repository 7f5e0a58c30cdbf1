//! Reliable, ordered, connection-oriented sessions over plain UDP.
//!
//! The transport stacks four independent mechanisms and this crate is the layer that
//! weaves them together over one shared datagram socket:
//!
//! * an ARQ protocol (sliding window, selective repeat, RTO estimation) providing
//!   reliable in-order delivery,
//! * optional forward error correction over Reed-Solomon shard groups, recovering
//!   lost packets without waiting for a retransmission round trip,
//! * per-packet integrity via CRC32 computed under the encryption layer,
//! * optional AES-128 packet encryption with a per-packet random nonce.
//!
//! ## Pipelines
//!
//! ```ascii
//! outgoing                                incoming
//!
//! write()          (application bytes)    socket          (datagram arrives)
//!   |                                       |
//!   v                                       v
//! ARQ send/flush   (segmentation, ack,    decrypt          (AES-128, optional)
//!   |               retransmission)         |
//!   v                                       v
//! post-processing  (per-session task)     CRC32 check      (drop on mismatch)
//!   |                                       |
//!   v                                       v
//! FEC encode       (parity shards)        FEC decode       (recover lost shards)
//!   |                                       |
//!   v                                       v
//! CRC32 + encrypt  (seal in place)        ARQ input        (reassembly, acks)
//!   |                                       |
//!   v                                       v
//! corked batch     (one burst per cork)   read()           (application bytes)
//! ```
//!
//! ## Packet layout
//!
//! With encryption and FEC enabled, an outbound packet looks like this (all numbers
//! little-endian):
//!
//! ```ascii
//!  0..15  nonce
//! 16..19  CRC32 over bytes [20..]
//! 20..23  FEC shard sequence id
//! 24..25  FEC shard type: 0x00F1 data, 0x00F2 parity
//! 26..    ARQ frame (data shards) or parity payload
//! ```
//!
//! Disabling encryption removes bytes [0..19]; disabling FEC removes the shard
//! header. The receive path tells the variants apart by the 16-bit word at offset 4
//! of the unsealed payload: ARQ command bytes (0x51..0x54) and FEC shard tags can
//! never collide there.
//!
//! ## Roles
//!
//! [`Session::connect`] opens a client session that owns its socket.
//! [`Listener::bind`] serves many sessions over one socket, keyed by remote address,
//! with a bounded accept queue. Both ends drive the same [`Session`] type; the only
//! differences are socket ownership and who dispatches inbound packets.
//!
//! Sessions deliver a reliable ordered byte stream with deadline-aware blocking
//! reads and writes, modelled after the standard networking deadline semantics:
//! a timed-out operation fails with a temporary error and the session stays usable.

pub mod arq;
pub mod buffers;
pub mod config;
pub mod crypto;
pub mod error;
pub mod fec;
pub mod listener;
pub mod session;
pub mod snmp;
mod tx;

pub use config::BraidConfig;
pub use error::BraidError;
pub use listener::Listener;
pub use session::Session;

/// Largest packet this transport will ever put on or accept from the wire; also the
/// unit size of the packet buffer pool.
pub const MTU_LIMIT: usize = 1500;

/// Capacity of a listener's queue of not-yet-accepted sessions, and of each
/// session's post-processing channel.
pub const ACCEPT_BACKLOG: usize = 128;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
