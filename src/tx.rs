//! The socket send seam.
//!
//! Outbound packets reach the wire as whole batches so the post-processing stage can
//! cork its transmit queue and hand it over in one call. Sending goes through the
//! [`SendSocket`] abstraction to keep the I/O mockable; the portable realization
//! transmits one datagram per call.
//!
//! TODO submit whole batches with sendmmsg where the platform offers it - the
//!  interface already takes the full batch, only the syscall strategy would change.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::net::UdpSocket;
use tracing::trace;

use crate::buffers::{pool, PacketBuf};
use crate::snmp::SNMP;

/// Abstraction for sending one packet on a datagram socket, introduced to facilitate
///  mocking the I/O part away for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn send_packet(&self, to: SocketAddr, packet: &[u8]) -> io::Result<()>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn send_packet(&self, to: SocketAddr, packet: &[u8]) -> io::Result<()> {
        trace!("sending {} byte packet to {:?}", packet.len(), to);
        self.send_to(packet, to).await.map(|_| ())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// One packet waiting in a transmit batch.
pub(crate) struct TxMessage {
    pub remote: SocketAddr,
    pub buf: PacketBuf,
}

/// Ordered batch transmission with per-packet accounting.
pub(crate) struct SendPipeline {
    socket: Arc<dyn SendSocket>,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn SendSocket>) -> SendPipeline {
        SendPipeline { socket }
    }

    /// Send every message of the batch in order, recycling each buffer afterwards.
    ///  Per-packet failures are counted; the first error is returned after the whole
    ///  batch was attempted, for the session to latch as its write error.
    pub async fn send_batch(&self, batch: &mut Vec<TxMessage>) -> io::Result<()> {
        let mut result = Ok(());
        for msg in batch.drain(..) {
            match self.socket.send_packet(msg.remote, msg.buf.as_ref()).await {
                Ok(()) => {
                    SNMP.out_pkts.fetch_add(1, Ordering::Relaxed);
                    SNMP.out_bytes.fetch_add(msg.buf.len() as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    SNMP.out_errs.fetch_add(1, Ordering::Relaxed);
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
            pool().put(msg.buf);
        }
        result
    }
}
