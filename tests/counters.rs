//! Exact counter accounting for a minimal exchange.
//!
//! This scenario lives in its own test binary: the counter block is process-wide,
//! and exact deltas are only meaningful while no other session is running.

use std::sync::atomic::Ordering;
use std::time::Duration;

use braid::snmp::SNMP;
use braid::{BraidConfig, Listener, Session};
use tokio::time::timeout;

#[tokio::test]
async fn test_minimal_exchange_accounting() {
    let config = BraidConfig::default();

    let active_before = SNMP.active_opens.load(Ordering::Relaxed);
    let passive_before = SNMP.passive_opens.load(Ordering::Relaxed);
    let sent_before = SNMP.bytes_sent.load(Ordering::Relaxed);
    let received_before = SNMP.bytes_received.load(Ordering::Relaxed);
    let estab_before = SNMP.curr_estab.load(Ordering::Relaxed);

    let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), &config)
        .await
        .unwrap();
    let client = Session::connect(listener.local_addr().unwrap(), &config)
        .await
        .unwrap();

    client.write(b"hello").await.unwrap();
    let server = timeout(Duration::from_secs(5), listener.accept())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(server.conv(), client.conv());

    let mut buf = [0u8; 32];
    let n = timeout(Duration::from_secs(5), server.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"hello");

    assert_eq!(SNMP.active_opens.load(Ordering::Relaxed) - active_before, 1);
    assert_eq!(SNMP.passive_opens.load(Ordering::Relaxed) - passive_before, 1);
    assert_eq!(SNMP.bytes_sent.load(Ordering::Relaxed) - sent_before, 5);
    assert_eq!(SNMP.bytes_received.load(Ordering::Relaxed) - received_before, 5);
    assert_eq!(SNMP.curr_estab.load(Ordering::Relaxed) - estab_before, 2);

    client.close().unwrap();
    server.close().unwrap();
    assert_eq!(SNMP.curr_estab.load(Ordering::Relaxed), estab_before);
    assert!(SNMP.max_conn.load(Ordering::Relaxed) >= 2);
}
