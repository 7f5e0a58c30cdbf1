//! Process-wide protocol counters.
//!
//! All counters are monotonic except `curr_estab` which tracks the number of
//! currently established sessions (with its all-time high water mark in `max_conn`).
//! The block is a `static` so every session and listener in the process feeds the
//! same numbers; there is nothing to initialize or tear down.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counter block for the transport, in the spirit of the classic SNMP MIBs.
#[derive(Debug)]
pub struct Snmp {
    /// sessions opened actively (client side)
    pub active_opens: AtomicU64,
    /// sessions opened passively (accepted by a listener)
    pub passive_opens: AtomicU64,
    /// sessions currently established
    pub curr_estab: AtomicU64,
    /// high water mark of `curr_estab`
    pub max_conn: AtomicU64,
    /// application payload bytes handed to `write`
    pub bytes_sent: AtomicU64,
    /// application payload bytes handed out by `read`
    pub bytes_received: AtomicU64,
    /// packets that reached a session's input stage
    pub in_pkts: AtomicU64,
    /// bytes that reached a session's input stage
    pub in_bytes: AtomicU64,
    /// packets handed to the socket
    pub out_pkts: AtomicU64,
    /// bytes handed to the socket
    pub out_bytes: AtomicU64,
    /// packets dropped for a failed checksum
    pub in_csum_errors: AtomicU64,
    /// packets dropped for being malformed before reaching the ARQ
    pub in_errs: AtomicU64,
    /// frames the ARQ rejected
    pub arq_in_errors: AtomicU64,
    /// packets the socket failed to send
    pub out_errs: AtomicU64,
}

/// The process-wide counter instance.
pub static SNMP: Snmp = Snmp::new();

impl Snmp {
    const fn new() -> Snmp {
        Snmp {
            active_opens: AtomicU64::new(0),
            passive_opens: AtomicU64::new(0),
            curr_estab: AtomicU64::new(0),
            max_conn: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            in_pkts: AtomicU64::new(0),
            in_bytes: AtomicU64::new(0),
            out_pkts: AtomicU64::new(0),
            out_bytes: AtomicU64::new(0),
            in_csum_errors: AtomicU64::new(0),
            in_errs: AtomicU64::new(0),
            arq_in_errors: AtomicU64::new(0),
            out_errs: AtomicU64::new(0),
        }
    }

    /// Register a newly established session, maintaining the high water mark.
    pub(crate) fn session_established(&self) {
        let estab = self.curr_estab.fetch_add(1, Ordering::Relaxed) + 1;
        let mut max = self.max_conn.load(Ordering::Relaxed);
        while estab > max {
            match self.max_conn.compare_exchange_weak(
                max,
                estab,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => max = actual,
            }
        }
    }

    pub(crate) fn session_closed(&self) {
        self.curr_estab.fetch_sub(1, Ordering::Relaxed);
    }
}
