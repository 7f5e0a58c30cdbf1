//! A session: one reliable, ordered byte channel to one remote endpoint.
//!
//! Each session owns three cooperating tasks besides the caller's reads and writes:
//!
//! * the *post-processor*, which takes raw ARQ frames off a bounded channel and runs
//!   them through FEC framing, sealing and the corked transmit batch,
//! * the *update tick*, which pumps the ARQ's retransmission machinery on the cadence
//!   the protocol requests, riding the runtime's shared timer wheel,
//! * for client sessions, the *receive loop* on the owned socket.
//!
//! All of them observe the close signal and exit on their own; the ARQ state is only
//! ever touched under the session mutex, which is synchronous and never held across
//! an await point.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Duration, Instant as TokioInstant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::arq::{self, Arq};
use crate::buffers::{pool, PacketBuf};
use crate::config::BraidConfig;
use crate::crypto::{self, BlockCrypt, NonceAes128, CRYPT_HEADER_SIZE};
use crate::error::BraidError;
use crate::fec::{FecDecoder, FecEncoder, FEC_HEADER_SIZE_PLUS_2, TYPE_DATA, TYPE_PARITY};
use crate::listener::ListenerCore;
use crate::snmp::SNMP;
use crate::tx::{SendPipeline, TxMessage};
use crate::{ACCEPT_BACKLOG, MTU_LIMIT};

/// A latched error slot: stores the first error, wakes every waiter, and keeps
/// serving the same error forever after.
pub(crate) struct ErrorCell {
    fired: CancellationToken,
    slot: OnceLock<Arc<io::Error>>,
}

impl ErrorCell {
    pub fn new() -> ErrorCell {
        ErrorCell {
            fired: CancellationToken::new(),
            slot: OnceLock::new(),
        }
    }

    /// Latch the error. Only the first call wins; returns whether it did.
    pub fn set(&self, err: Arc<io::Error>) -> bool {
        let won = self.slot.set(err).is_ok();
        if won {
            self.fired.cancel();
        }
        won
    }

    pub fn get(&self) -> Option<Arc<io::Error>> {
        self.slot.get().cloned()
    }

    /// resolves once the cell is latched
    pub async fn latched(&self) -> Arc<io::Error> {
        self.fired.cancelled().await;
        self.slot.get().cloned().expect("cell fired with the error stored")
    }
}

struct SessionState {
    arq: Arq,
    fec_decoder: Option<FecDecoder>,

    /// reassembly stash: a message too large for the caller's buffer is delivered
    ///  here and handed out in pieces
    recvbuf: Vec<u8>,
    stash_start: usize,
    stash_end: usize,

    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
    ack_no_delay: bool,
    write_delay: bool,
}

impl SessionState {
    fn window_has_slack(&self) -> bool {
        self.arq.wait_snd() < self.arq.snd_wnd().min(self.arq.rmt_wnd()) as usize
    }
}

pub(crate) struct SessionCore {
    conv: u32,
    remote: SocketAddr,
    conn: Arc<UdpSocket>,
    own_conn: bool,
    listener: Option<Weak<ListenerCore>>,
    block: Option<Arc<dyn BlockCrypt>>,

    /// space reserved in front of every outbound ARQ frame for the sealing and FEC
    ///  headers; fixed at construction
    header_size: usize,

    pipeline: SendPipeline,

    die: CancellationToken,
    closed: AtomicBool,
    read_ready: Notify,
    write_ready: Notify,
    read_error: ErrorCell,
    write_error: ErrorCell,

    /// extra transmissions of every data packet (testing aid)
    dup: AtomicU32,

    state: Mutex<SessionState>,
}

/// One reliable, ordered session over a datagram socket. Cheap to clone; all clones
/// are handles to the same session.
#[derive(Clone)]
pub struct Session {
    core: Arc<SessionCore>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

impl Session {
    /// Open a client session to `remote` on a freshly bound socket with a random
    ///  conversation id.
    pub async fn connect(remote: SocketAddr, config: &BraidConfig) -> anyhow::Result<Session> {
        let bind_addr: SocketAddr = if remote.is_ipv4() {
            "0.0.0.0:0".parse()?
        } else {
            "[::]:0".parse()?
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        Self::connect_with_socket(rand::random(), socket, true, remote, config).await
    }

    /// Open a client session over a caller-provided socket. With `owns_socket` the
    ///  session considers the socket its own: the receive loop and the socket-level
    ///  setters are available, and the socket is released on close.
    pub async fn connect_with_socket(
        conv: u32,
        socket: Arc<UdpSocket>,
        owns_socket: bool,
        remote: SocketAddr,
        config: &BraidConfig,
    ) -> anyhow::Result<Session> {
        config.validate()?;
        Ok(Session::new_internal(
            conv,
            config.data_shards,
            config.parity_shards,
            None,
            socket,
            owns_socket,
            remote,
            config.block(),
        ))
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new_internal(
        conv: u32,
        data_shards: usize,
        parity_shards: usize,
        listener: Option<Weak<ListenerCore>>,
        conn: Arc<UdpSocket>,
        own_conn: bool,
        remote: SocketAddr,
        block: Option<Arc<dyn BlockCrypt>>,
    ) -> Session {
        let fec = data_shards > 0 && parity_shards > 0;
        let crypt_header = if block.is_some() { CRYPT_HEADER_SIZE } else { 0 };
        let header_size = crypt_header + if fec { FEC_HEADER_SIZE_PLUS_2 } else { 0 };

        let (post_tx, post_rx) = mpsc::channel::<PacketBuf>(ACCEPT_BACKLOG);

        // the ARQ emits wire frames into the post-processing channel; the enqueue
        //  must not block under the session mutex, so overflow falls back to
        //  datagram semantics and the retransmission machinery
        let output = {
            let post_tx = post_tx.clone();
            Box::new(move |frame: &[u8]| {
                if frame.len() < arq::OVERHEAD {
                    return;
                }
                let mut buf = pool().get();
                buf.set_len(header_size);
                buf.put_slice(frame);
                if let Err(TrySendError::Full(buf) | TrySendError::Closed(buf)) =
                    post_tx.try_send(buf)
                {
                    trace!("post-processing queue unavailable, dropping frame");
                    pool().put(buf);
                }
            })
        };

        let state = SessionState {
            arq: Arq::new(conv, output),
            fec_decoder: fec.then(|| FecDecoder::new(data_shards, parity_shards)),
            recvbuf: vec![0; MTU_LIMIT],
            stash_start: 0,
            stash_end: 0,
            read_deadline: None,
            write_deadline: None,
            ack_no_delay: false,
            write_delay: false,
        };

        let core = Arc::new(SessionCore {
            conv,
            remote,
            conn: conn.clone(),
            own_conn,
            listener,
            block,
            header_size,
            pipeline: SendPipeline::new(Arc::new(conn)),
            die: CancellationToken::new(),
            closed: AtomicBool::new(false),
            read_ready: Notify::new(),
            write_ready: Notify::new(),
            read_error: ErrorCell::new(),
            write_error: ErrorCell::new(),
            dup: AtomicU32::new(0),
            state: Mutex::new(state),
        });

        let fec_encoder = fec.then(|| FecEncoder::new(data_shards, parity_shards, crypt_header));
        tokio::spawn(post_process(core.clone(), post_rx, fec_encoder));
        tokio::spawn(update_loop(core.clone()));

        if core.listener.is_none() {
            tokio::spawn(read_loop(core.clone()));
            SNMP.active_opens.fetch_add(1, Ordering::Relaxed);
        } else {
            SNMP.passive_opens.fetch_add(1, Ordering::Relaxed);
        }
        SNMP.session_established();

        debug!("session {:08x} established with {:?}", conv, remote);
        Session { core }
    }

    /// Read the next available bytes, blocking until data arrives, the read deadline
    ///  elapses, the socket fails or the session closes.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, BraidError> {
        let core = &self.core;
        loop {
            let deadline = {
                let mut state = core.state.lock().unwrap();
                let state = &mut *state;

                // leftovers from a message larger than an earlier read buffer
                if state.stash_start < state.stash_end {
                    let n = (state.stash_end - state.stash_start).min(buf.len());
                    let start = state.stash_start;
                    buf[..n].copy_from_slice(&state.recvbuf[start..start + n]);
                    state.stash_start += n;
                    SNMP.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                    return Ok(n);
                }

                if let Some(size) = state.arq.peek_size() {
                    if buf.len() >= size {
                        // deliver straight into the caller's buffer
                        let n = state
                            .arq
                            .recv(buf)
                            .expect("a complete message was peeked");
                        SNMP.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                        return Ok(n);
                    }

                    // deliver into the stash and hand out a prefix
                    if state.recvbuf.len() < size {
                        state.recvbuf = vec![0; size];
                    }
                    state
                        .arq
                        .recv(&mut state.recvbuf)
                        .expect("a complete message was peeked");
                    let n = buf.len();
                    buf.copy_from_slice(&state.recvbuf[..n]);
                    state.stash_start = n;
                    state.stash_end = size;
                    SNMP.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                    return Ok(n);
                }

                state.read_deadline
            };

            tokio::select! {
                _ = core.read_ready.notified() => {}
                _ = sleep_until(far_future_or(deadline)), if deadline.is_some() => {
                    return Err(BraidError::Timeout);
                }
                err = core.read_error.latched() => return Err(BraidError::SocketRead(err)),
                _ = core.die.cancelled() => return Err(BraidError::ClosedPipe),
            }
        }
    }

    /// Write a byte slice, blocking while the transmit window is full. Returns the
    ///  number of bytes accepted (always the full slice on success).
    pub async fn write(&self, buf: &[u8]) -> Result<usize, BraidError> {
        self.write_buffers(&[buf]).await
    }

    /// Write a vector of byte slices as consecutive stream data.
    pub async fn write_buffers(&self, bufs: &[&[u8]]) -> Result<usize, BraidError> {
        let core = &self.core;
        loop {
            if let Some(err) = core.write_error.get() {
                return Err(BraidError::SocketWrite(err));
            }
            if core.die.is_cancelled() {
                return Err(BraidError::ClosedPipe);
            }

            let deadline = {
                let mut state = core.state.lock().unwrap();

                if state.window_has_slack() {
                    let mss = state.arq.mss();
                    let mut n = 0;
                    for buf in bufs {
                        n += buf.len();
                        let mut rest = *buf;
                        while rest.len() > mss {
                            state.arq.send(&rest[..mss]);
                            rest = &rest[mss..];
                        }
                        state.arq.send(rest);
                    }

                    // pump immediately when the window just filled up or the
                    //  session is not configured to collect bytes for bulk transfer
                    if !state.window_has_slack() || !state.write_delay {
                        state.arq.flush(false);
                    }
                    SNMP.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                    return Ok(n);
                }

                state.write_deadline
            };

            tokio::select! {
                _ = core.write_ready.notified() => {}
                _ = sleep_until(far_future_or(deadline)), if deadline.is_some() => {
                    return Err(BraidError::Timeout);
                }
                err = core.write_error.latched() => return Err(BraidError::SocketWrite(err)),
                _ = core.die.cancelled() => return Err(BraidError::ClosedPipe),
            }
        }
    }

    /// Close the session. The first call tears the session down: pending transmit
    ///  data is flushed best-effort, the session deregisters from its listener or
    ///  releases its own socket, and every blocked operation wakes with an error.
    ///  Subsequent calls report [`BraidError::ClosedPipe`].
    pub fn close(&self) -> Result<(), BraidError> {
        let core = &self.core;
        if core.closed.swap(true, Ordering::SeqCst) {
            return Err(BraidError::ClosedPipe);
        }

        debug!("closing session {:08x} with {:?}", core.conv, core.remote);
        SNMP.session_closed();
        core.die.cancel();

        // pump last-chance segments into the post-processing pipeline, which drains
        //  before its task exits
        {
            let mut state = core.state.lock().unwrap();
            state.arq.flush(false);
        }

        if let Some(listener) = core.listener.as_ref().and_then(Weak::upgrade) {
            listener.close_session(&core.remote);
        }
        // an owned socket is released when the receive loop observes the close
        //  signal and the last Arc drops
        Ok(())
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.core.conn.local_addr()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.core.remote
    }

    /// the conversation id shared with the peer
    pub fn conv(&self) -> u32 {
        self.core.conv
    }

    /// current retransmission timeout of the ARQ, in milliseconds
    pub fn rto(&self) -> u32 {
        self.core.state.lock().unwrap().arq.rto()
    }

    /// smoothed round-trip time estimate, in milliseconds
    pub fn srtt(&self) -> i32 {
        self.core.state.lock().unwrap().arq.srtt()
    }

    /// round-trip time variance, in milliseconds
    pub fn srtt_var(&self) -> i32 {
        self.core.state.lock().unwrap().arq.srtt_var()
    }

    /// Set both deadlines. `None` disables them.
    pub fn set_deadline(&self, t: Option<Instant>) {
        {
            let mut state = self.core.state.lock().unwrap();
            state.read_deadline = t;
            state.write_deadline = t;
        }
        self.core.read_ready.notify_one();
        self.core.write_ready.notify_one();
    }

    pub fn set_read_deadline(&self, t: Option<Instant>) {
        self.core.state.lock().unwrap().read_deadline = t;
        self.core.read_ready.notify_one();
    }

    pub fn set_write_deadline(&self, t: Option<Instant>) {
        self.core.state.lock().unwrap().write_deadline = t;
        self.core.write_ready.notify_one();
    }

    /// With write delay, writes leave flushing to the periodic tick, trading latency
    ///  for fuller packets during bulk transfer.
    pub fn set_write_delay(&self, delay: bool) {
        self.core.state.lock().unwrap().write_delay = delay;
    }

    /// Set the maximum send and receive window sizes, in segments.
    pub fn set_window_size(&self, snd_wnd: u16, rcv_wnd: u16) {
        self.core.state.lock().unwrap().arq.set_wnd_size(snd_wnd, rcv_wnd);
    }

    /// Set the maximum transmission unit including this transport's own headers.
    ///  Returns false when the value cannot be honored.
    pub fn set_mtu(&self, mtu: usize) -> bool {
        if mtu > MTU_LIMIT || mtu <= self.core.header_size + arq::OVERHEAD {
            return false;
        }
        self.core
            .state
            .lock()
            .unwrap()
            .arq
            .set_mtu(mtu - self.core.header_size)
    }

    /// Stream mode coalesces consecutive writes instead of preserving their
    ///  boundaries, like a TCP byte stream.
    pub fn set_stream_mode(&self, enable: bool) {
        self.core.state.lock().unwrap().arq.set_stream(enable);
    }

    /// Flush acks immediately for every incoming packet instead of batching them
    ///  onto the next tick (testing aid).
    pub fn set_ack_no_delay(&self, nodelay: bool) {
        self.core.state.lock().unwrap().ack_no_delay = nodelay;
    }

    /// Transmit every data packet `dup` extra times (testing aid).
    pub fn set_dup(&self, dup: u32) {
        self.core.dup.store(dup, Ordering::Relaxed);
    }

    /// ARQ tuning profile, see [`Arq::set_nodelay`].
    pub fn set_nodelay(&self, nodelay: bool, interval: u32, resend: u32, nc: bool) {
        self.core
            .state
            .lock()
            .unwrap()
            .arq
            .set_nodelay(nodelay, interval, resend, nc);
    }

    /// Set the DSCP bits of outbound packets. Fails on sessions accepted from a
    ///  listener - the socket is shared.
    pub fn set_dscp(&self, dscp: u32) -> Result<(), BraidError> {
        if self.core.listener.is_some() {
            return Err(BraidError::InvalidOperation);
        }
        socket2::SockRef::from(self.core.conn.as_ref())
            .set_tos(dscp << 2)
            .map_err(|_| BraidError::InvalidOperation)
    }

    /// Set the socket receive buffer size. Fails on sessions accepted from a
    ///  listener - the socket is shared.
    pub fn set_read_buffer(&self, bytes: usize) -> Result<(), BraidError> {
        if self.core.listener.is_some() {
            return Err(BraidError::InvalidOperation);
        }
        socket2::SockRef::from(self.core.conn.as_ref())
            .set_recv_buffer_size(bytes)
            .map_err(|_| BraidError::InvalidOperation)
    }

    /// Set the socket send buffer size. Fails on sessions accepted from a listener -
    ///  the socket is shared.
    pub fn set_write_buffer(&self, bytes: usize) -> Result<(), BraidError> {
        if self.core.listener.is_some() {
            return Err(BraidError::InvalidOperation);
        }
        socket2::SockRef::from(self.core.conn.as_ref())
            .set_send_buffer_size(bytes)
            .map_err(|_| BraidError::InvalidOperation)
    }

    /// Escape hatch: run `f` against the underlying socket. Only permitted on
    ///  sessions that own their socket; misuse can break the protocol.
    pub fn control<T>(&self, f: impl FnOnce(&UdpSocket) -> T) -> Result<T, BraidError> {
        if !self.core.own_conn {
            return Err(BraidError::NotOwner);
        }
        Ok(f(&self.core.conn))
    }

    /// feed one decrypted, checksum-verified packet (dispatcher entry point)
    pub(crate) fn input_frame(&self, data: &[u8]) {
        self.core.arq_input(data);
    }

    pub(crate) fn notify_read_error(&self, err: Arc<io::Error>) {
        self.core.read_error.set(err);
    }
}

impl SessionCore {
    /// Inbound pipeline for packets fresh off the socket: unseal, then hand the
    ///  frame to the ARQ stage.
    fn packet_input(&self, packet: &mut PacketBuf) {
        match &self.block {
            Some(block) => {
                let data = packet.as_mut();
                if data.len() < CRYPT_HEADER_SIZE {
                    return;
                }
                if crypto::open(block.as_ref(), data) {
                    self.arq_input(&packet.as_ref()[CRYPT_HEADER_SIZE..]);
                } else {
                    SNMP.in_csum_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
            None => self.arq_input(packet.as_ref()),
        }
    }

    /// FEC classification and ARQ input, with readiness signalling.
    fn arq_input(&self, data: &[u8]) {
        if data.len() < arq::OVERHEAD {
            return;
        }

        let mut arq_errors = 0u64;
        let fec_flag = u16::from_le_bytes(data[4..6].try_into().expect("length checked above"));

        if fec_flag == TYPE_DATA || fec_flag == TYPE_PARITY {
            if data.len() >= FEC_HEADER_SIZE_PLUS_2 {
                let mut state = self.state.lock().unwrap();
                let ack_no_delay = state.ack_no_delay;

                // sessions set up without FEC parameters can still meet FEC-framed
                //  traffic; fall back to the smallest group layout
                let decoder = state
                    .fec_decoder
                    .get_or_insert_with(|| FecDecoder::new(1, 1));
                let recovered = decoder.decode(data);

                if fec_flag == TYPE_DATA
                    && state
                        .arq
                        .input(&data[FEC_HEADER_SIZE_PLUS_2..], true, ack_no_delay)
                        .is_err()
                {
                    arq_errors += 1;
                }

                for shard in recovered {
                    let region = shard.as_ref();
                    if region.len() >= 2 {
                        let sz = u16::from_le_bytes(
                            region[..2].try_into().expect("length checked above"),
                        ) as usize;
                        if (2..=region.len()).contains(&sz)
                            && state.arq.input(&region[2..sz], false, ack_no_delay).is_err()
                        {
                            arq_errors += 1;
                        }
                    }
                    pool().put(shard);
                }

                self.post_input_signals(&mut state);
            } else {
                SNMP.in_errs.fetch_add(1, Ordering::Relaxed);
            }
        } else {
            let mut state = self.state.lock().unwrap();
            let ack_no_delay = state.ack_no_delay;
            if state.arq.input(data, true, ack_no_delay).is_err() {
                arq_errors += 1;
            }
            self.post_input_signals(&mut state);
        }

        SNMP.in_pkts.fetch_add(1, Ordering::Relaxed);
        SNMP.in_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
        if arq_errors > 0 {
            SNMP.arq_in_errors.fetch_add(arq_errors, Ordering::Relaxed);
        }
    }

    fn post_input_signals(&self, state: &mut SessionState) {
        if state.arq.peek_size().is_some() {
            self.read_ready.notify_one();
        }
        if state.window_has_slack() {
            self.write_ready.notify_one();
        }
    }

    /// One buffer through the outbound pipeline: FEC framing, sealing, batching.
    fn process_outbound(
        &self,
        mut buf: PacketBuf,
        fec_encoder: &mut Option<FecEncoder>,
        nonce: &mut NonceAes128,
        txqueue: &mut Vec<TxMessage>,
    ) {
        let mut parity = match fec_encoder {
            Some(encoder) => encoder.encode(&mut buf),
            None => Vec::new(),
        };

        if let Some(block) = &self.block {
            crypto::seal(block.as_ref(), nonce, buf.as_mut());
            for p in &mut parity {
                crypto::seal(block.as_ref(), nonce, p.as_mut());
            }
        }

        let mut duplicates = Vec::new();
        for _ in 0..self.dup.load(Ordering::Relaxed) {
            let mut copy = pool().get();
            copy.put_slice(buf.as_ref());
            duplicates.push(copy);
        }

        txqueue.push(TxMessage {
            remote: self.remote,
            buf,
        });
        for buf in duplicates {
            txqueue.push(TxMessage {
                remote: self.remote,
                buf,
            });
        }
        for buf in parity {
            txqueue.push(TxMessage {
                remote: self.remote,
                buf,
            });
        }
    }

    async fn transmit(&self, txqueue: &mut Vec<TxMessage>) {
        if txqueue.is_empty() {
            return;
        }
        if let Err(e) = self.pipeline.send_batch(txqueue).await {
            self.write_error.set(Arc::new(e));
        }
    }
}

/// Per-session pipeline task: FEC framing, sealing, corked batch transmission.
async fn post_process(
    core: Arc<SessionCore>,
    mut rx: mpsc::Receiver<PacketBuf>,
    mut fec_encoder: Option<FecEncoder>,
) {
    let mut nonce = NonceAes128::new();
    let mut txqueue: Vec<TxMessage> = Vec::with_capacity(ACCEPT_BACKLOG);

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(buf) => {
                    core.process_outbound(buf, &mut fec_encoder, &mut nonce, &mut txqueue);
                    // drain whatever queued up behind, then cork the batch out
                    while let Ok(buf) = rx.try_recv() {
                        core.process_outbound(buf, &mut fec_encoder, &mut nonce, &mut txqueue);
                    }
                    core.transmit(&mut txqueue).await;
                }
                None => {
                    core.transmit(&mut txqueue).await;
                    return;
                }
            },
            _ = core.die.cancelled() => {
                // best-effort flush of what the final ARQ flush queued
                while let Ok(buf) = rx.try_recv() {
                    core.process_outbound(buf, &mut fec_encoder, &mut nonce, &mut txqueue);
                }
                core.transmit(&mut txqueue).await;
                return;
            }
        }
    }
}

/// Per-session tick: pump the ARQ on the cadence it requests, until close.
async fn update_loop(core: Arc<SessionCore>) {
    let mut next = TokioInstant::now();
    loop {
        tokio::select! {
            _ = core.die.cancelled() => return,
            _ = sleep_until(next) => {}
        }

        let interval = {
            let mut state = core.state.lock().unwrap();
            let interval = state.arq.flush(false);
            if state.window_has_slack() {
                core.write_ready.notify_one();
            }
            interval
        };
        next = TokioInstant::now() + Duration::from_millis(interval as u64);
    }
}

/// Receive loop of a client session on its own socket.
async fn read_loop(core: Arc<SessionCore>) {
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
                    if from == core.remote {
                        buf.truncate(n);
                        core.packet_input(&mut buf);
                    } else {
                        trace!("dropping packet from unrelated source {:?}", from);
                        SNMP.in_errs.fetch_add(1, Ordering::Relaxed);
                    }
                    pool().put(buf);
                }
                Err(e) => {
                    pool().put(buf);
                    core.read_error.set(Arc::new(e));
                    return;
                }
            }
        }
    }
}

pub(crate) fn far_future_or(deadline: Option<Instant>) -> TokioInstant {
    match deadline {
        Some(t) => TokioInstant::from_std(t),
        None => TokioInstant::now() + Duration::from_secs(86_400 * 365),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_error_cell_latches_once() {
        let cell = ErrorCell::new();
        assert!(cell.get().is_none());

        assert!(cell.set(Arc::new(io::Error::new(io::ErrorKind::Other, "first"))));
        assert!(!cell.set(Arc::new(io::Error::new(io::ErrorKind::Other, "second"))));

        assert_eq!(cell.get().unwrap().to_string(), "first");
        assert_eq!(cell.latched().await.to_string(), "first");
    }

    async fn lone_client() -> Session {
        // no peer needed: UDP lets a session exist without anyone answering
        Session::connect("127.0.0.1:9".parse().unwrap(), &BraidConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_close_is_idempotent_with_report() {
        let session = lone_client().await;
        assert!(session.close().is_ok());
        for _ in 0..3 {
            assert!(matches!(session.close(), Err(BraidError::ClosedPipe)));
        }
    }

    #[tokio::test]
    async fn test_read_after_close_fails() {
        let session = lone_client().await;
        session.close().unwrap();

        let mut buf = [0u8; 16];
        assert!(matches!(
            session.read(&mut buf).await,
            Err(BraidError::ClosedPipe)
        ));
        assert!(matches!(
            session.write(b"x").await,
            Err(BraidError::ClosedPipe)
        ));
    }

    #[tokio::test]
    async fn test_expired_read_deadline_times_out() {
        let session = lone_client().await;
        session.set_read_deadline(Some(Instant::now() - std::time::Duration::from_millis(5)));

        let mut buf = [0u8; 16];
        let err = session.read(&mut buf).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(err.is_temporary());
        session.close().unwrap();
    }

    #[tokio::test]
    async fn test_owning_session_may_touch_socket() {
        let session = lone_client().await;

        assert!(session.set_read_buffer(64 * 1024).is_ok());
        assert!(session.set_write_buffer(64 * 1024).is_ok());
        assert!(session.control(|socket| socket.local_addr()).is_ok());
        session.close().unwrap();
    }

    #[tokio::test]
    async fn test_mtu_bounds() {
        let session = lone_client().await;
        assert!(!session.set_mtu(MTU_LIMIT + 1));
        assert!(!session.set_mtu(10));
        assert!(session.set_mtu(MTU_LIMIT));
        assert!(session.set_mtu(600));
        session.close().unwrap();
    }

    #[tokio::test]
    async fn test_accessors() {
        let session = lone_client().await;
        assert_eq!(session.remote_addr(), "127.0.0.1:9".parse().unwrap());
        assert!(session.local_addr().is_ok());
        assert!(session.rto() > 0);
        assert_eq!(session.srtt(), 0);
        assert_eq!(session.srtt_var(), 0);
        session.close().unwrap();
    }
}
