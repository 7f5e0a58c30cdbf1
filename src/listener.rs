//! The dispatcher: many sessions multiplexed over one listening socket.
//!
//! A listener owns the socket and a single receive task. Every inbound datagram is
//! unsealed once at the edge, classified by the 16-bit word at offset 4 (ARQ command
//! word vs FEC shard tag), and dispatched to at most one session, keyed by the
//! remote address. A datagram from an unknown remote whose conversation id can be
//! recovered opens a new session - unless the accept queue is full, in which case the
//! datagram is dropped and the remote's retransmissions keep knocking.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Instant;

use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::time::sleep_until;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::arq;
use crate::buffers::{pool, PacketBuf};
use crate::config::BraidConfig;
use crate::crypto::{self, BlockCrypt, CRYPT_HEADER_SIZE};
use crate::error::BraidError;
use crate::fec::{FEC_HEADER_SIZE_PLUS_2, TYPE_DATA, TYPE_PARITY};
use crate::session::{ErrorCell, Session};
use crate::snmp::SNMP;
use crate::ACCEPT_BACKLOG;

pub(crate) struct ListenerCore {
    conn: Arc<UdpSocket>,
    data_shards: usize,
    parity_shards: usize,
    block: Option<Arc<dyn BlockCrypt>>,

    /// sessions by remote address; written on create/close, read on every dispatch
    sessions: RwLock<FxHashMap<String, Session>>,

    accept_tx: mpsc::Sender<Session>,
    accept_deadline: StdMutex<Option<Instant>>,

    die: CancellationToken,
    closed: AtomicBool,
    read_error: ErrorCell,
}

/// Accepts sessions opened by remote endpoints over one shared socket.
pub struct Listener {
    core: Arc<ListenerCore>,
    accept_rx: TokioMutex<mpsc::Receiver<Session>>,
}

impl Listener {
    /// Bind a fresh socket on `local` and serve sessions from it.
    pub async fn bind(local: SocketAddr, config: &BraidConfig) -> anyhow::Result<Listener> {
        config.validate()?;
        let conn = Arc::new(UdpSocket::bind(local).await?);
        info!("listening on {:?}", conn.local_addr()?);
        Ok(Self::serve_socket(conn, config))
    }

    /// Serve sessions from a caller-provided socket.
    pub fn serve(socket: Arc<UdpSocket>, config: &BraidConfig) -> anyhow::Result<Listener> {
        config.validate()?;
        Ok(Self::serve_socket(socket, config))
    }

    fn serve_socket(conn: Arc<UdpSocket>, config: &BraidConfig) -> Listener {
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let core = Arc::new(ListenerCore {
            conn,
            data_shards: config.data_shards,
            parity_shards: config.parity_shards,
            block: config.block(),
            sessions: RwLock::new(FxHashMap::default()),
            accept_tx,
            accept_deadline: StdMutex::new(None),
            die: CancellationToken::new(),
            closed: AtomicBool::new(false),
            read_error: ErrorCell::new(),
        });

        tokio::spawn(monitor(core.clone()));
        Listener {
            core,
            accept_rx: TokioMutex::new(accept_rx),
        }
    }

    /// Wait for the next incoming session, subject to the accept deadline, socket
    ///  failure and close.
    pub async fn accept(&self) -> Result<Session, BraidError> {
        let deadline = *self.core.accept_deadline.lock().unwrap();
        let mut accept_rx = self.accept_rx.lock().await;

        tokio::select! {
            received = accept_rx.recv() => received.ok_or(BraidError::ClosedPipe),
            _ = sleep_until(crate::session::far_future_or(deadline)), if deadline.is_some() => {
                Err(BraidError::Timeout)
            }
            err = self.core.read_error.latched() => Err(BraidError::SocketRead(err)),
            _ = self.core.die.cancelled() => Err(BraidError::ClosedPipe),
        }
    }

    /// Set the accept deadline. `None` disables it. The listener has no write side,
    ///  so this is the only deadline it knows.
    pub fn set_deadline(&self, t: Option<Instant>) {
        *self.core.accept_deadline.lock().unwrap() = t;
    }

    pub fn set_read_deadline(&self, t: Option<Instant>) {
        self.set_deadline(t);
    }

    /// The listener has no write side.
    pub fn set_write_deadline(&self, _t: Option<Instant>) -> Result<(), BraidError> {
        Err(BraidError::InvalidOperation)
    }

    /// Stop accepting and receiving. Established sessions keep their state and fail
    ///  on their own once the shared socket is gone.
    pub fn close(&self) -> Result<(), BraidError> {
        if self.core.closed.swap(true, Ordering::SeqCst) {
            return Err(BraidError::ClosedPipe);
        }
        debug!("closing listener on {:?}", self.core.conn.local_addr());
        self.core.die.cancel();
        Ok(())
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.core.conn.local_addr()
    }

    pub fn set_dscp(&self, dscp: u32) -> Result<(), BraidError> {
        socket2::SockRef::from(self.core.conn.as_ref())
            .set_tos(dscp << 2)
            .map_err(|_| BraidError::InvalidOperation)
    }

    pub fn set_read_buffer(&self, bytes: usize) -> Result<(), BraidError> {
        socket2::SockRef::from(self.core.conn.as_ref())
            .set_recv_buffer_size(bytes)
            .map_err(|_| BraidError::InvalidOperation)
    }

    pub fn set_write_buffer(&self, bytes: usize) -> Result<(), BraidError> {
        socket2::SockRef::from(self.core.conn.as_ref())
            .set_send_buffer_size(bytes)
            .map_err(|_| BraidError::InvalidOperation)
    }

    /// Escape hatch: run `f` against the underlying socket. Misuse can break the
    ///  protocol.
    pub fn control<T>(&self, f: impl FnOnce(&UdpSocket) -> T) -> T {
        f(&self.core.conn)
    }

    /// number of currently registered sessions (diagnostics)
    pub fn session_count(&self) -> usize {
        self.core.sessions.read().unwrap().len()
    }
}

impl ListenerCore {
    /// Unseal, classify and dispatch one datagram.
    fn packet_input(self: &Arc<Self>, mut packet: PacketBuf, from: SocketAddr) {
        let payload_start = match &self.block {
            Some(block) => {
                let data = packet.as_mut();
                if data.len() < CRYPT_HEADER_SIZE {
                    pool().put(packet);
                    return;
                }
                if !crypto::open(block.as_ref(), data) {
                    SNMP.in_csum_errors.fetch_add(1, Ordering::Relaxed);
                    pool().put(packet);
                    return;
                }
                CRYPT_HEADER_SIZE
            }
            None => 0,
        };

        let data = &packet.as_ref()[payload_start..];
        if data.len() < arq::OVERHEAD {
            pool().put(packet);
            return;
        }

        let existing = self
            .sessions
            .read()
            .unwrap()
            .get(&from.to_string())
            .cloned();

        // recover the conversation id: directly from a bare ARQ frame, through the
        //  shard header of a FEC data packet, not at all from parity
        let mut conv = 0u32;
        let mut sn = 0u32;
        let mut conv_recovered = false;
        let fec_flag = u16::from_le_bytes(data[4..6].try_into().expect("length checked above"));
        if fec_flag == TYPE_DATA || fec_flag == TYPE_PARITY {
            if fec_flag == TYPE_DATA && data.len() >= FEC_HEADER_SIZE_PLUS_2 + arq::OVERHEAD {
                conv = arq::frame_conv(&data[FEC_HEADER_SIZE_PLUS_2..]);
                sn = arq::frame_sn(&data[FEC_HEADER_SIZE_PLUS_2..]);
                conv_recovered = true;
            }
        } else {
            conv = arq::frame_conv(data);
            sn = arq::frame_sn(data);
            conv_recovered = true;
        }

        let mut target = None;
        if let Some(session) = existing {
            if !conv_recovered || conv == session.conv() {
                target = Some(session);
            } else if sn == 0 {
                // the remote address restarted with a new conversation
                debug!(
                    "replacing session for {:?}: conversation {:08x} -> {:08x}",
                    from,
                    session.conv(),
                    conv
                );
                let _ = session.close();
            } else {
                // conversation mismatch mid-stream: neither deliver nor replace
                trace!("dropping packet with mismatched conversation from {:?}", from);
                pool().put(packet);
                return;
            }
        }

        match target {
            Some(session) => session.input_frame(data),
            None if conv_recovered => {
                // back-pressure on accept: new sessions only while the queue has slack
                if self.accept_tx.capacity() > 0 {
                    let session = Session::new_internal(
                        conv,
                        self.data_shards,
                        self.parity_shards,
                        Some(Arc::downgrade(self)),
                        self.conn.clone(),
                        false,
                        from,
                        self.block.clone(),
                    );
                    session.input_frame(data);
                    self.sessions
                        .write()
                        .unwrap()
                        .insert(from.to_string(), session.clone());
                    if self.accept_tx.try_send(session.clone()).is_err() {
                        // the queue closed underneath us (listener shutting down)
                        self.close_session(&from);
                        let _ = session.close();
                    }
                } else {
                    debug!("accept queue full, dropping new conversation from {:?}", from);
                }
            }
            None => {
                trace!("dropping parity packet from unknown remote {:?}", from);
            }
        }
        pool().put(packet);
    }

    /// Latch the socket read error and fan it out to every registered session.
    fn notify_read_error(&self, err: io::Error) {
        let err = Arc::new(err);
        if self.read_error.set(err.clone()) {
            for session in self.sessions.read().unwrap().values() {
                session.notify_read_error(err.clone());
            }
        }
    }

    /// deregistration entry point for closing sessions
    pub(crate) fn close_session(&self, remote: &SocketAddr) -> bool {
        self.sessions
            .write()
            .unwrap()
            .remove(&remote.to_string())
            .is_some()
    }
}

/// The listener's receive task: one datagram at a time into pool buffers.
async fn monitor(core: Arc<ListenerCore>) {
    loop {
        let mut buf = pool().get();
        buf.maximize_len();

        tokio::select! {
            _ = core.die.cancelled() => {
                pool().put(buf);
                return;
            }
            received = core.conn.recv_from(buf.as_mut()) => match received {
                Ok((n, from)) => {
                    buf.truncate(n);
                    core.packet_input(buf, from);
                }
                Err(e) => {
                    pool().put(buf);
                    core.notify_read_error(e);
                    return;
                }
            }
        }
    }
}
