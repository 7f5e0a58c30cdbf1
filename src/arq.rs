//! The ARQ protocol: reliable, ordered segment delivery over lossy datagrams.
//!
//! This is a pure state machine - no I/O, no clocks other than a monotonic
//! millisecond counter, no locking. It is driven from the outside: the session layer
//! feeds received frames through [`Arq::input`], queues application data with
//! [`Arq::send`], drains ordered messages with [`Arq::recv`], and pumps the wire side
//! by calling [`Arq::flush`] periodically and on demand. Outbound frames leave
//! through the injected output sink.
//!
//! Segment header (little-endian):
//!
//! ```ascii
//!  0: conversation id (u32)
//!  4: command (u8): 0x51 push, 0x52 ack, 0x53 window probe, 0x54 window tell
//!  5: fragment count-down (u8)
//!  6: advertised receive window (u16)
//!  8: timestamp echo (u32)
//! 12: sequence number (u32)
//! 16: cumulative ack (u32)
//! 20: payload length (u32)
//! ```
//!
//! The command byte range 0x51..0x54 is deliberate: together with the fragment byte
//! it forms a 16-bit word that can never equal a FEC shard type tag, which is what
//! lets the receive path classify packets by looking at one word.
//!
//! Reliability machinery: sliding send/receive windows, cumulative plus selective
//! acks, RFC 6298-style RTO estimation, fast retransmit after configurable duplicate
//! ack spans, optional congestion window with slow start and a rate-halving response
//! to loss, and zero-window probing.

use std::collections::VecDeque;
use std::time::Instant;

use thiserror::Error;

/// segment header size on the wire
pub const OVERHEAD: usize = 24;

/// byte offset of the sequence number within a segment header
pub const SN_OFFSET: usize = 12;

pub const CMD_PUSH: u8 = 0x51;
pub const CMD_ACK: u8 = 0x52;
pub const CMD_WASK: u8 = 0x53;
pub const CMD_WINS: u8 = 0x54;

const ASK_SEND: u32 = 1;
const ASK_TELL: u32 = 2;

const RTO_NDL: u32 = 30;
const RTO_MIN: u32 = 100;
const RTO_DEF: u32 = 200;
const RTO_MAX: u32 = 60_000;

const WND_SND: u16 = 32;
const WND_RCV: u16 = 128;

const MTU_DEF: usize = 1400;
const INTERVAL_DEF: u32 = 100;

const THRESH_INIT: u16 = 2;
const THRESH_MIN: u16 = 2;

const DEAD_LINK: u32 = 20;

const PROBE_INIT: u32 = 7_000;
const PROBE_LIMIT: u32 = 120_000;

/// Reasons a received frame is rejected before reaching the window machinery.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame belongs to a different conversation")]
    ConvMismatch,
    #[error("frame shorter than its header demands")]
    Truncated,
    #[error("unknown command byte")]
    BadCommand,
}

/// wrapping sequence-number comparison: > 0 iff `later` is ahead of `earlier`
#[inline]
fn diff(later: u32, earlier: u32) -> i32 {
    later.wrapping_sub(earlier) as i32
}

/// read the conversation id of a raw segment header
pub fn frame_conv(frame: &[u8]) -> u32 {
    u32::from_le_bytes(frame[..4].try_into().expect("frame checked for length"))
}

/// read the sequence number of a raw segment header
pub fn frame_sn(frame: &[u8]) -> u32 {
    u32::from_le_bytes(
        frame[SN_OFFSET..SN_OFFSET + 4]
            .try_into()
            .expect("frame checked for length"),
    )
}

#[derive(Default)]
struct Segment {
    cmd: u8,
    frg: u8,
    wnd: u16,
    ts: u32,
    sn: u32,
    una: u32,
    resend_ts: u32,
    rto: u32,
    fast_ack: u32,
    xmit: u32,
    data: Vec<u8>,
}

#[allow(clippy::too_many_arguments)]
fn encode_header(
    buf: &mut Vec<u8>,
    conv: u32,
    cmd: u8,
    frg: u8,
    wnd: u16,
    ts: u32,
    sn: u32,
    una: u32,
    len: u32,
) {
    buf.extend_from_slice(&conv.to_le_bytes());
    buf.push(cmd);
    buf.push(frg);
    buf.extend_from_slice(&wnd.to_le_bytes());
    buf.extend_from_slice(&ts.to_le_bytes());
    buf.extend_from_slice(&sn.to_le_bytes());
    buf.extend_from_slice(&una.to_le_bytes());
    buf.extend_from_slice(&len.to_le_bytes());
}

/// The ARQ instance of one session.
pub struct Arq {
    conv: u32,
    mtu: usize,
    mss: usize,

    snd_una: u32,
    snd_nxt: u32,
    rcv_nxt: u32,

    ssthresh: u16,
    rx_rttvar: i32,
    rx_srtt: i32,
    rx_rto: u32,
    rx_minrto: u32,

    snd_wnd: u16,
    rcv_wnd: u16,
    rmt_wnd: u16,
    cwnd: u16,
    incr: u32,
    probe: u32,
    ts_probe: u32,
    probe_wait: u32,

    interval: u32,
    nodelay: bool,
    fast_resend: u32,
    nocwnd: bool,
    stream: bool,
    dead_link: bool,

    snd_queue: VecDeque<Segment>,
    snd_buf: VecDeque<Segment>,
    rcv_queue: VecDeque<Segment>,
    rcv_buf: VecDeque<Segment>,
    acklist: Vec<(u32, u32)>,

    buffer: Vec<u8>,
    start: Instant,
    output: Box<dyn FnMut(&[u8]) + Send>,
}

impl Arq {
    /// `output` receives every outbound frame, already batched up to the MTU.
    pub fn new(conv: u32, output: Box<dyn FnMut(&[u8]) + Send>) -> Arq {
        Arq {
            conv,
            mtu: MTU_DEF,
            mss: MTU_DEF - OVERHEAD,
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            ssthresh: THRESH_INIT,
            rx_rttvar: 0,
            rx_srtt: 0,
            rx_rto: RTO_DEF,
            rx_minrto: RTO_MIN,
            snd_wnd: WND_SND,
            rcv_wnd: WND_RCV,
            rmt_wnd: WND_RCV,
            cwnd: 0,
            incr: 0,
            probe: 0,
            ts_probe: 0,
            probe_wait: 0,
            interval: INTERVAL_DEF,
            nodelay: false,
            fast_resend: 0,
            nocwnd: false,
            stream: false,
            dead_link: false,
            snd_queue: VecDeque::new(),
            snd_buf: VecDeque::new(),
            rcv_queue: VecDeque::new(),
            rcv_buf: VecDeque::new(),
            acklist: Vec::new(),
            buffer: Vec::with_capacity(MTU_DEF),
            start: Instant::now(),
            output,
        }
    }

    pub fn conv(&self) -> u32 {
        self.conv
    }

    /// maximum payload of a single segment
    pub fn mss(&self) -> usize {
        self.mss
    }

    pub fn snd_wnd(&self) -> u16 {
        self.snd_wnd
    }

    /// the window the peer last advertised
    pub fn rmt_wnd(&self) -> u16 {
        self.rmt_wnd
    }

    pub fn rto(&self) -> u32 {
        self.rx_rto
    }

    pub fn srtt(&self) -> i32 {
        self.rx_srtt
    }

    pub fn srtt_var(&self) -> i32 {
        self.rx_rttvar
    }

    /// true once any segment has been retransmitted past the dead-link threshold
    pub fn is_dead_link(&self) -> bool {
        self.dead_link
    }

    /// segments queued or in flight, i.e. not yet acknowledged
    pub fn wait_snd(&self) -> usize {
        self.snd_buf.len() + self.snd_queue.len()
    }

    /// stream mode coalesces consecutive sends into full segments instead of
    ///  preserving message boundaries
    pub fn set_stream(&mut self, stream: bool) {
        self.stream = stream;
    }

    pub fn set_mtu(&mut self, mtu: usize) -> bool {
        if mtu <= OVERHEAD {
            return false;
        }
        self.mtu = mtu;
        self.mss = mtu - OVERHEAD;
        true
    }

    pub fn set_wnd_size(&mut self, snd_wnd: u16, rcv_wnd: u16) {
        if snd_wnd > 0 {
            self.snd_wnd = snd_wnd;
        }
        if rcv_wnd > 0 {
            self.rcv_wnd = rcv_wnd;
        }
    }

    /// Tuning profile: `nodelay` shrinks the minimum RTO and the RTO backoff,
    ///  `interval` is the flush cadence in ms, `resend` enables fast retransmit after
    ///  that many duplicate-ack spans (0 disables), `nc` disables the congestion
    ///  window.
    pub fn set_nodelay(&mut self, nodelay: bool, interval: u32, resend: u32, nc: bool) {
        self.nodelay = nodelay;
        self.rx_minrto = if nodelay { RTO_NDL } else { RTO_MIN };
        self.interval = interval.clamp(10, 5_000);
        self.fast_resend = resend;
        self.nocwnd = nc;
    }

    fn current(&self) -> u32 {
        self.start.elapsed().as_millis() as u32
    }

    fn wnd_unused(&self) -> u16 {
        (self.rcv_wnd as usize).saturating_sub(self.rcv_queue.len()) as u16
    }

    /// Size of the next complete message in the receive queue, if any.
    pub fn peek_size(&self) -> Option<usize> {
        let seg = self.rcv_queue.front()?;
        if seg.frg == 0 {
            return Some(seg.data.len());
        }
        if self.rcv_queue.len() < seg.frg as usize + 1 {
            return None;
        }

        let mut length = 0;
        for seg in &self.rcv_queue {
            length += seg.data.len();
            if seg.frg == 0 {
                break;
            }
        }
        Some(length)
    }

    /// Move the next complete message into `buffer`. Returns `None` when no message
    ///  is ready or `buffer` cannot hold it.
    pub fn recv(&mut self, buffer: &mut [u8]) -> Option<usize> {
        let peek = self.peek_size()?;
        if peek > buffer.len() {
            return None;
        }

        let fast_recover = self.rcv_queue.len() >= self.rcv_wnd as usize;

        let mut n = 0;
        while let Some(seg) = self.rcv_queue.pop_front() {
            buffer[n..n + seg.data.len()].copy_from_slice(&seg.data);
            n += seg.data.len();
            if seg.frg == 0 {
                break;
            }
        }

        self.shift_rcv_buf();

        // the window reopened: tell the peer without waiting to be asked
        if self.rcv_queue.len() < self.rcv_wnd as usize && fast_recover {
            self.probe |= ASK_TELL;
        }
        Some(n)
    }

    /// Queue application data for transmission, fragmenting at the MSS.
    pub fn send(&mut self, data: &[u8]) {
        let mut data = data;
        if data.is_empty() {
            return;
        }

        if self.stream {
            if let Some(last) = self.snd_queue.back_mut() {
                if last.data.len() < self.mss {
                    let room = self.mss - last.data.len();
                    let n = room.min(data.len());
                    last.data.extend_from_slice(&data[..n]);
                    last.frg = 0;
                    data = &data[n..];
                }
            }
            if data.is_empty() {
                return;
            }
        }

        let count = data.len().div_ceil(self.mss);
        if count > 255 {
            // cannot be expressed in the fragment count-down byte
            return;
        }

        for i in 0..count {
            let size = data.len().min(self.mss);
            let seg = Segment {
                frg: if self.stream {
                    0
                } else {
                    (count - i - 1) as u8
                },
                data: data[..size].to_vec(),
                ..Segment::default()
            };
            self.snd_queue.push_back(seg);
            data = &data[size..];
        }
    }

    /// Feed one received frame (possibly containing several segments).
    ///
    /// `regular` is false for frames resurrected by FEC - those must not feed the
    /// RTT filter or the remote window, both of which they would skew. `ack_nodelay`
    /// flushes pending acks immediately instead of on the next tick.
    pub fn input(&mut self, data: &[u8], regular: bool, ack_nodelay: bool) -> Result<(), FrameError> {
        if data.len() < OVERHEAD {
            return Err(FrameError::Truncated);
        }

        let prev_una = self.snd_una;
        let mut max_ack = 0u32;
        let mut latest_ts = 0u32;
        let mut saw_ack = false;

        let mut ptr = data;
        while ptr.len() >= OVERHEAD {
            if frame_conv(ptr) != self.conv {
                return Err(FrameError::ConvMismatch);
            }
            let cmd = ptr[4];
            let frg = ptr[5];
            let wnd = u16::from_le_bytes(ptr[6..8].try_into().expect("header is 24 bytes"));
            let ts = u32::from_le_bytes(ptr[8..12].try_into().expect("header is 24 bytes"));
            let sn = frame_sn(ptr);
            let una = u32::from_le_bytes(ptr[16..20].try_into().expect("header is 24 bytes"));
            let len = u32::from_le_bytes(ptr[20..24].try_into().expect("header is 24 bytes")) as usize;

            if ptr.len() < OVERHEAD + len {
                return Err(FrameError::Truncated);
            }
            if !(CMD_PUSH..=CMD_WINS).contains(&cmd) {
                return Err(FrameError::BadCommand);
            }

            if regular {
                self.rmt_wnd = wnd;
            }
            self.parse_una(una);
            self.shrink_buf();

            match cmd {
                CMD_ACK => {
                    self.parse_ack(sn);
                    self.shrink_buf();
                    if !saw_ack || diff(sn, max_ack) > 0 {
                        saw_ack = true;
                        max_ack = sn;
                        latest_ts = ts;
                    }
                    if regular {
                        let rtt = diff(self.current(), ts);
                        if rtt >= 0 {
                            self.update_ack(rtt);
                        }
                    }
                }
                CMD_PUSH => {
                    if diff(sn, self.rcv_nxt.wrapping_add(self.rcv_wnd as u32)) < 0 {
                        self.acklist.push((sn, ts));
                        if diff(sn, self.rcv_nxt) >= 0 {
                            self.parse_data(Segment {
                                cmd,
                                frg,
                                wnd,
                                ts,
                                sn,
                                una,
                                data: ptr[OVERHEAD..OVERHEAD + len].to_vec(),
                                ..Segment::default()
                            });
                        }
                    }
                }
                CMD_WASK => {
                    self.probe |= ASK_TELL;
                }
                _ => {
                    // CMD_WINS: the window update itself happened above
                }
            }

            ptr = &ptr[OVERHEAD + len..];
        }

        if saw_ack && regular {
            self.parse_fastack(max_ack, latest_ts);
        }

        // acked data opens the congestion window
        if diff(self.snd_una, prev_una) > 0 && self.cwnd < self.rmt_wnd {
            let mss = self.mss as u32;
            if self.cwnd < self.ssthresh {
                self.cwnd += 1;
                self.incr += mss;
            } else {
                if self.incr < mss {
                    self.incr = mss;
                }
                self.incr += (mss * mss) / self.incr + (mss / 16);
                if (self.cwnd as u32 + 1) * mss <= self.incr {
                    self.cwnd = ((self.incr + mss - 1) / mss.max(1)) as u16;
                }
            }
            if self.cwnd > self.rmt_wnd {
                self.cwnd = self.rmt_wnd;
                self.incr = self.rmt_wnd as u32 * mss;
            }
        }

        if ack_nodelay && !self.acklist.is_empty() {
            self.flush(true);
        }
        Ok(())
    }

    fn parse_una(&mut self, una: u32) {
        while let Some(seg) = self.snd_buf.front() {
            if diff(seg.sn, una) < 0 {
                self.snd_buf.pop_front();
            } else {
                break;
            }
        }
    }

    fn shrink_buf(&mut self) {
        self.snd_una = self.snd_buf.front().map(|s| s.sn).unwrap_or(self.snd_nxt);
    }

    fn parse_ack(&mut self, sn: u32) {
        if diff(sn, self.snd_una) < 0 || diff(sn, self.snd_nxt) >= 0 {
            return;
        }
        for i in 0..self.snd_buf.len() {
            match diff(sn, self.snd_buf[i].sn) {
                0 => {
                    self.snd_buf.remove(i);
                    break;
                }
                d if d < 0 => break,
                _ => {}
            }
        }
    }

    fn parse_fastack(&mut self, sn: u32, ts: u32) {
        if diff(sn, self.snd_una) < 0 || diff(sn, self.snd_nxt) >= 0 {
            return;
        }
        for seg in &mut self.snd_buf {
            if diff(sn, seg.sn) < 0 {
                break;
            }
            if sn != seg.sn && diff(seg.ts, ts) <= 0 {
                seg.fast_ack += 1;
            }
        }
    }

    fn update_ack(&mut self, rtt: i32) {
        if self.rx_srtt == 0 {
            self.rx_srtt = rtt;
            self.rx_rttvar = rtt / 2;
        } else {
            let delta = (rtt - self.rx_srtt).abs();
            self.rx_rttvar = (3 * self.rx_rttvar + delta) / 4;
            self.rx_srtt = (7 * self.rx_srtt + rtt) / 8;
            if self.rx_srtt < 1 {
                self.rx_srtt = 1;
            }
        }
        let rto = self.rx_srtt as u32 + self.interval.max(4 * self.rx_rttvar as u32);
        self.rx_rto = rto.clamp(self.rx_minrto, RTO_MAX);
    }

    fn parse_data(&mut self, new_seg: Segment) {
        let sn = new_seg.sn;
        if diff(sn, self.rcv_nxt.wrapping_add(self.rcv_wnd as u32)) >= 0
            || diff(sn, self.rcv_nxt) < 0
        {
            return;
        }

        // insertion point from the back; duplicates are dropped
        let mut insert_idx = 0;
        let mut repeat = false;
        for i in (0..self.rcv_buf.len()).rev() {
            let seg_sn = self.rcv_buf[i].sn;
            if seg_sn == sn {
                repeat = true;
                break;
            }
            if diff(sn, seg_sn) > 0 {
                insert_idx = i + 1;
                break;
            }
        }
        if !repeat {
            self.rcv_buf.insert(insert_idx, new_seg);
        }

        self.shift_rcv_buf();
    }

    /// move contiguous segments from the receive buffer into the ordered queue
    fn shift_rcv_buf(&mut self) {
        while let Some(seg) = self.rcv_buf.front() {
            if seg.sn == self.rcv_nxt && self.rcv_queue.len() < self.rcv_wnd as usize {
                let seg = self.rcv_buf.pop_front().expect("front was just probed");
                self.rcv_queue.push_back(seg);
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            } else {
                break;
            }
        }
    }

    fn make_space(&mut self, space: usize) {
        if self.buffer.len() + space > self.mtu && !self.buffer.is_empty() {
            (self.output)(&self.buffer);
            self.buffer.clear();
        }
    }

    fn flush_buffer(&mut self) {
        if !self.buffer.is_empty() {
            (self.output)(&self.buffer);
            self.buffer.clear();
        }
    }

    /// Pump the wire side: acks, window probes, new transmissions and
    ///  retransmissions. With `ack_only` nothing but pending acks leaves. Returns the
    ///  current flush cadence in milliseconds, for the caller to schedule the next
    ///  tick.
    pub fn flush(&mut self, ack_only: bool) -> u32 {
        let current = self.current();
        let wnd_unused = self.wnd_unused();

        let acks = std::mem::take(&mut self.acklist);
        for (sn, ts) in acks {
            self.make_space(OVERHEAD);
            encode_header(
                &mut self.buffer,
                self.conv,
                CMD_ACK,
                0,
                wnd_unused,
                ts,
                sn,
                self.rcv_nxt,
                0,
            );
        }

        if ack_only {
            self.flush_buffer();
            return self.interval;
        }

        // a zero remote window is probed with exponential backoff until it reopens
        if self.rmt_wnd == 0 {
            if self.probe_wait == 0 {
                self.probe_wait = PROBE_INIT;
                self.ts_probe = current.wrapping_add(self.probe_wait);
            } else if diff(current, self.ts_probe) >= 0 {
                if self.probe_wait < PROBE_INIT {
                    self.probe_wait = PROBE_INIT;
                }
                self.probe_wait += self.probe_wait / 2;
                if self.probe_wait > PROBE_LIMIT {
                    self.probe_wait = PROBE_LIMIT;
                }
                self.ts_probe = current.wrapping_add(self.probe_wait);
                self.probe |= ASK_SEND;
            }
        } else {
            self.ts_probe = 0;
            self.probe_wait = 0;
        }

        if self.probe & ASK_SEND != 0 {
            self.make_space(OVERHEAD);
            encode_header(
                &mut self.buffer,
                self.conv,
                CMD_WASK,
                0,
                wnd_unused,
                0,
                0,
                self.rcv_nxt,
                0,
            );
        }
        if self.probe & ASK_TELL != 0 {
            self.make_space(OVERHEAD);
            encode_header(
                &mut self.buffer,
                self.conv,
                CMD_WINS,
                0,
                wnd_unused,
                0,
                0,
                self.rcv_nxt,
                0,
            );
        }
        self.probe = 0;

        let mut cwnd = self.snd_wnd.min(self.rmt_wnd);
        if !self.nocwnd {
            cwnd = cwnd.min(self.cwnd);
        }

        while diff(self.snd_nxt, self.snd_una.wrapping_add(cwnd as u32)) < 0 {
            let Some(mut seg) = self.snd_queue.pop_front() else {
                break;
            };
            seg.cmd = CMD_PUSH;
            seg.sn = self.snd_nxt;
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            self.snd_buf.push_back(seg);
        }

        let resent = if self.fast_resend > 0 {
            self.fast_resend
        } else {
            u32::MAX
        };
        let rto_min = if self.nodelay { 0 } else { self.rx_rto >> 3 };

        let mut lost = false;
        let mut change = false;

        let mut snd_buf = std::mem::take(&mut self.snd_buf);
        for seg in &mut snd_buf {
            let mut needsend = false;

            if seg.xmit == 0 {
                needsend = true;
                seg.xmit = 1;
                seg.rto = self.rx_rto;
                seg.resend_ts = current.wrapping_add(seg.rto).wrapping_add(rto_min);
            } else if seg.fast_ack >= resent {
                needsend = true;
                seg.xmit += 1;
                seg.fast_ack = 0;
                seg.resend_ts = current.wrapping_add(seg.rto);
                change = true;
            } else if diff(current, seg.resend_ts) >= 0 {
                needsend = true;
                seg.xmit += 1;
                seg.rto += if self.nodelay {
                    self.rx_rto / 2
                } else {
                    self.rx_rto.max(seg.rto)
                };
                seg.resend_ts = current.wrapping_add(seg.rto);
                lost = true;
            }

            if needsend {
                seg.ts = current;
                seg.wnd = wnd_unused;
                seg.una = self.rcv_nxt;

                self.make_space(OVERHEAD + seg.data.len());
                encode_header(
                    &mut self.buffer,
                    self.conv,
                    seg.cmd,
                    seg.frg,
                    seg.wnd,
                    seg.ts,
                    seg.sn,
                    seg.una,
                    seg.data.len() as u32,
                );
                self.buffer.extend_from_slice(&seg.data);

                if seg.xmit >= DEAD_LINK {
                    self.dead_link = true;
                }
            }
        }
        self.snd_buf = snd_buf;

        self.flush_buffer();

        // rate halving after fast retransmit, multiplicative decrease after loss
        if change {
            let inflight = self.snd_nxt.wrapping_sub(self.snd_una);
            self.ssthresh = ((inflight / 2) as u16).max(THRESH_MIN);
            self.cwnd = self.ssthresh + self.fast_resend as u16;
            self.incr = self.cwnd as u32 * self.mss as u32;
        }
        if lost {
            self.ssthresh = (cwnd / 2).max(THRESH_MIN);
            self.cwnd = 1;
            self.incr = self.mss as u32;
        }
        if self.cwnd < 1 {
            self.cwnd = 1;
            self.incr = self.mss as u32;
        }

        self.interval
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use rstest::rstest;

    use super::*;

    type Captured = Arc<Mutex<Vec<Vec<u8>>>>;

    fn arq_with_capture(conv: u32) -> (Arq, Captured) {
        let captured: Captured = Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();
        let arq = Arq::new(
            conv,
            Box::new(move |frame: &[u8]| sink.lock().unwrap().push(frame.to_vec())),
        );
        (arq, captured)
    }

    fn drain(captured: &Captured) -> Vec<Vec<u8>> {
        std::mem::take(&mut captured.lock().unwrap())
    }

    /// flush both sides until neither produces frames, delivering everything
    fn pump(a: &mut Arq, a_out: &Captured, b: &mut Arq, b_out: &Captured) {
        for _ in 0..8 {
            a.flush(false);
            b.flush(false);
            let mut quiet = true;
            for frame in drain(a_out) {
                quiet = false;
                b.input(&frame, true, false).unwrap();
            }
            for frame in drain(b_out) {
                quiet = false;
                a.input(&frame, true, false).unwrap();
            }
            if quiet {
                break;
            }
        }
    }

    #[test]
    fn test_send_recv_roundtrip() {
        let (mut a, a_out) = arq_with_capture(7);
        let (mut b, b_out) = arq_with_capture(7);
        a.set_nodelay(true, 10, 2, true);
        b.set_nodelay(true, 10, 2, true);

        a.send(b"hello across the void");
        pump(&mut a, &a_out, &mut b, &b_out);

        assert_eq!(b.peek_size(), Some(21));
        let mut buf = [0u8; 64];
        let n = b.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello across the void");

        // acks flowed back and cleared the send side
        assert_eq!(a.wait_snd(), 0);
    }

    #[test]
    fn test_message_boundaries_preserved() {
        let (mut a, a_out) = arq_with_capture(1);
        let (mut b, b_out) = arq_with_capture(1);
        a.set_nodelay(true, 10, 2, true);
        b.set_nodelay(true, 10, 2, true);

        a.send(b"first");
        a.send(b"second message");
        pump(&mut a, &a_out, &mut b, &b_out);

        let mut buf = [0u8; 64];
        assert_eq!(b.recv(&mut buf), Some(5));
        assert_eq!(&buf[..5], b"first");
        assert_eq!(b.recv(&mut buf), Some(14));
        assert_eq!(&buf[..14], b"second message");
        assert_eq!(b.recv(&mut buf), None);
    }

    #[test]
    fn test_stream_mode_coalesces() {
        let (mut a, _) = arq_with_capture(1);
        a.set_stream(true);

        a.send(b"abc");
        a.send(b"def");
        assert_eq!(a.snd_queue.len(), 1);
        assert_eq!(a.snd_queue[0].data, b"abcdef");
    }

    #[test]
    fn test_fragmentation_and_reassembly() {
        let (mut a, a_out) = arq_with_capture(9);
        let (mut b, b_out) = arq_with_capture(9);
        a.set_nodelay(true, 10, 2, true);
        b.set_nodelay(true, 10, 2, true);

        let message: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        a.send(&message);
        assert!(a.wait_snd() > 1, "message must span several segments");

        pump(&mut a, &a_out, &mut b, &b_out);

        assert_eq!(b.peek_size(), Some(message.len()));
        let mut buf = vec![0u8; 8192];
        let n = b.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], &message[..]);
    }

    #[test]
    fn test_out_of_order_delivery_restored() {
        let (mut a, a_out) = arq_with_capture(3);
        let (mut b, b_out) = arq_with_capture(3);
        a.set_nodelay(true, 10, 2, true);

        a.send(b"one");
        a.flush(false);
        a.send(b"two");
        a.flush(false);
        let frames = drain(&a_out);
        assert_eq!(frames.len(), 2);

        // deliver in reverse order
        b.input(&frames[1], true, false).unwrap();
        assert_eq!(b.peek_size(), None, "gap must hold back delivery");
        b.input(&frames[0], true, false).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(b.recv(&mut buf), Some(3));
        assert_eq!(&buf[..3], b"one");
        assert_eq!(b.recv(&mut buf), Some(3));
        assert_eq!(&buf[..3], b"two");
        drain(&b_out);
    }

    #[test]
    fn test_duplicate_segments_delivered_once() {
        let (mut a, a_out) = arq_with_capture(4);
        let (mut b, _b_out) = arq_with_capture(4);
        a.set_nodelay(true, 10, 2, true);

        a.send(b"solo");
        a.flush(false);
        let frames = drain(&a_out);

        b.input(&frames[0], true, false).unwrap();
        b.input(&frames[0], true, false).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(b.recv(&mut buf), Some(4));
        assert_eq!(b.recv(&mut buf), None);
    }

    #[rstest]
    #[case::conv_mismatch(
        {
            let mut frame = vec![0u8; OVERHEAD];
            frame[..4].copy_from_slice(&99u32.to_le_bytes());
            frame[4] = CMD_PUSH;
            frame
        },
        FrameError::ConvMismatch
    )]
    #[case::truncated(vec![0u8; OVERHEAD - 1], FrameError::Truncated)]
    #[case::bad_command(
        {
            let mut frame = vec![0u8; OVERHEAD];
            frame[..4].copy_from_slice(&5u32.to_le_bytes());
            frame[4] = 0x11;
            frame
        },
        FrameError::BadCommand
    )]
    #[case::length_overrun(
        {
            let mut frame = vec![0u8; OVERHEAD];
            frame[..4].copy_from_slice(&5u32.to_le_bytes());
            frame[4] = CMD_PUSH;
            frame[20..24].copy_from_slice(&10u32.to_le_bytes());
            frame
        },
        FrameError::Truncated
    )]
    fn test_input_rejects_malformed(#[case] frame: Vec<u8>, #[case] expected: FrameError) {
        let (mut b, _) = arq_with_capture(5);
        assert_eq!(b.input(&frame, true, false), Err(expected));
    }

    #[test]
    fn test_wait_snd_counts_queued_and_inflight() {
        let (mut a, a_out) = arq_with_capture(2);

        a.send(b"x");
        a.send(b"y");
        assert_eq!(a.wait_snd(), 2);

        a.flush(false); // opens cwnd
        a.flush(false); // transmits
        drain(&a_out);
        assert_eq!(a.wait_snd(), 2, "unacknowledged segments still count");
    }

    #[test]
    fn test_ack_nodelay_flushes_immediately() {
        let (mut a, a_out) = arq_with_capture(6);
        let (mut b, b_out) = arq_with_capture(6);
        a.set_nodelay(true, 10, 2, true);

        a.send(b"ping");
        a.flush(false);
        for frame in drain(&a_out) {
            b.input(&frame, true, true).unwrap();
        }
        assert!(
            !b_out.lock().unwrap().is_empty(),
            "ack must leave without a flush call"
        );
    }

    #[test]
    fn test_frame_accessors() {
        let mut buf = Vec::new();
        encode_header(&mut buf, 0xDEADBEEF, CMD_PUSH, 0, 128, 0, 0x01020304, 0, 0);
        assert_eq!(frame_conv(&buf), 0xDEADBEEF);
        assert_eq!(frame_sn(&buf), 0x01020304);
    }

    #[test]
    fn test_window_limits_inflight() {
        let (mut a, a_out) = arq_with_capture(8);
        a.set_nodelay(true, 10, 0, true); // no congestion window
        a.set_wnd_size(4, 128);

        for _ in 0..16 {
            a.send(b"chunk");
        }
        a.flush(false);
        drain(&a_out);
        assert_eq!(a.snd_buf.len(), 4, "in-flight bounded by the send window");
        assert_eq!(a.wait_snd(), 16);
    }

    #[test]
    fn test_mtu_bounds_output_frames() {
        let (mut a, a_out) = arq_with_capture(11);
        a.set_nodelay(true, 10, 0, true);

        let message = vec![7u8; 10_000];
        a.send(&message);
        a.flush(false);

        for frame in drain(&a_out) {
            assert!(frame.len() <= 1400);
        }
    }
}
