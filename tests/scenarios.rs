//! End-to-end scenario coverage, one test per named scenario:
//!
//! 1. Two-peer increment race -> `two_peer_increment_race_converges`
//! 2. Deadline filter drops late packets -> `deadline_filter_drops_stale_packets`
//! 3. Fragmented file transfer -> `fragmented_file_transfer_reassembles_byte_identical`
//! 4. Rebroadcast with TTL -> `rebroadcast_chain_stops_when_ttl_is_exhausted`
//! 5. Last-writer-wins with quality -> `last_writer_wins_resolves_by_quality_on_clock_tie`
//! 6. KaRL wait returns on change -> covered by `facade::tests::wait_wakes_on_store_change_and_returns_truthy`
//!    and `facade::tests::wait_times_out_without_error`; not duplicated here since `wait()`
//!    only ever observes its own process's store (`.`-prefixed names never cross the wire).
//!
//! Also covers the domain-isolation testable property, which needs a forged
//! cross-domain packet the public API has no way to produce honestly.

use std::net::TcpListener;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use karl::record::{Record, RecordValue};
use karl::store::Store;
use karl::transport::settings::{CarrierType, Reliability, TransportSettings};
use karl::transport::{Transport, TransportFilters};
use karl::wire::{self, Message, MessageHeader};

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

fn now_nanos() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos() as u64
}

fn base_settings(self_port: u16, peer_ports: &[u16], id: &str) -> TransportSettings {
    let mut hosts = vec![format!("127.0.0.1:{self_port}")];
    hosts.extend(peer_ports.iter().map(|p| format!("127.0.0.1:{p}")));
    TransportSettings {
        carrier_type: CarrierType::Udp,
        hosts,
        id: 0,
        originator_id: id.to_string(),
        domain: "fleet".to_string(),
        reliability: Reliability::BestEffort,
        ..TransportSettings::default()
    }
}

/// Scenario 1: peers P0 and P1 each locally compute 100 increments of
/// `counter`. Modeled as direct store merges rather than a live network race
/// (UDP timing would make the test flaky without changing what it proves):
/// the same 200 globally-clocked increments are applied to two stores in a
/// different order each, exercising the commutativity-of-merge invariant
/// directly. Because every increment observes the immediately preceding
/// one, the converged value lands at the top of the documented [100, 200]
/// range.
#[tokio::test]
async fn two_peer_increment_race_converges() {
    let mut events = Vec::with_capacity(200);
    let mut value = 0i64;
    for clock in 1..=200u64 {
        value += 1;
        events.push(Record { clock, quality: 1, ..Record::from_integer(value) });
    }

    let store_a = Store::new();
    for e in &events {
        store_a.apply("counter", e).await;
    }

    let store_b = Store::new();
    for e in events.iter().rev() {
        store_b.apply("counter", e).await;
    }

    let final_value = store_a.get("counter").await.to_integer();
    assert!((100..=200).contains(&final_value));
    assert_eq!(store_b.get("counter").await.to_integer(), final_value);
}

/// Scenario 5: P0 writes `v=1` at quality 5, P1 writes `v=2` at quality 10,
/// both at the same (fresh-store) clock. Cross-applying each side's record
/// onto the other must converge on the higher-quality write everywhere.
#[tokio::test]
async fn last_writer_wins_resolves_by_quality_on_clock_tie() {
    let store_p0 = Store::new();
    store_p0.set_write_quality("v", 5).await;
    store_p0.set("v", RecordValue::Integer(1)).await;

    let store_p1 = Store::new();
    store_p1.set_write_quality("v", 10).await;
    store_p1.set("v", RecordValue::Integer(2)).await;

    let from_p0 = store_p0.get("v").await;
    let from_p1 = store_p1.get("v").await;
    assert_eq!(from_p0.clock, from_p1.clock, "fresh stores must start both writes at the same clock");

    store_p0.apply("v", &from_p1).await;
    store_p1.apply("v", &from_p0).await;

    assert_eq!(store_p0.get("v").await.to_integer(), 2);
    assert_eq!(store_p1.get("v").await.to_integer(), 2);
}

/// Scenario 2: a packet timestamped 10s in the past against a 5s deadline is
/// dropped; a fresh one right after is applied.
#[tokio::test]
async fn deadline_filter_drops_stale_packets() {
    let port = free_port();
    let store = Arc::new(Store::new());
    let settings = TransportSettings {
        deadline_secs: 5.0,
        originator_id: "p1".to_string(),
        ..base_settings(port, &[], "p1")
    };
    let transport = Transport::new(settings, store.clone(), TransportFilters::default()).await.unwrap();

    let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target: std::net::SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();

    let stale = wire::encode(&Message {
        header: MessageHeader {
            reduced: false,
            originator: "p0".to_string(),
            domain: "fleet".to_string(),
            clock: 1,
            ttl: 0,
            update_count: 1,
            timestamp_nanos: now_nanos().saturating_sub(10_000_000_000),
        },
        records: vec![("m".to_string(), Record::from_integer(1))],
    });
    sender.send_to(&stale, target).await.unwrap();
    let result = transport.receive_once().await.unwrap();
    assert!(result.is_none(), "a packet older than the deadline must be dropped");
    assert!(!store.exists("m").await);

    let fresh = wire::encode(&Message {
        header: MessageHeader {
            reduced: false,
            originator: "p0".to_string(),
            domain: "fleet".to_string(),
            clock: 2,
            ttl: 0,
            update_count: 1,
            timestamp_nanos: now_nanos(),
        },
        records: vec![("m".to_string(), Record::from_integer(1))],
    });
    sender.send_to(&fresh, target).await.unwrap();
    let result = transport.receive_once().await.unwrap();
    assert!(result.is_some(), "a packet within the deadline must be applied");
    assert_eq!(store.get("m").await.to_integer(), 1);
}

/// Domain isolation: a packet tagged with a different domain than the
/// receiver's own is never applied, even though it passes every other gate.
#[tokio::test]
async fn cross_domain_packets_are_never_applied() {
    let port = free_port();
    let store = Arc::new(Store::new());
    let settings = base_settings(port, &[], "p1");
    let transport = Transport::new(settings, store.clone(), TransportFilters::default()).await.unwrap();

    let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target: std::net::SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();

    let other_domain = wire::encode(&Message {
        header: MessageHeader {
            reduced: false,
            originator: "p0".to_string(),
            domain: "other-fleet".to_string(),
            clock: 1,
            ttl: 0,
            update_count: 1,
            timestamp_nanos: now_nanos(),
        },
        records: vec![("m".to_string(), Record::from_integer(1))],
    });
    sender.send_to(&other_domain, target).await.unwrap();
    let result = transport.receive_once().await.unwrap();
    assert!(result.is_none(), "a packet from a foreign domain must be dropped");
    assert!(!store.exists("m").await);
}

/// Scenario 3: a 900KB blob split at a 60000-byte fragment size reassembles
/// byte-identical on the far side.
#[tokio::test]
async fn fragmented_file_transfer_reassembles_byte_identical() {
    let (port_a, port_b) = (free_port(), free_port());
    let blob: Vec<u8> = (0..900_000usize).map(|i| (i % 256) as u8).collect();

    let store_a = Arc::new(Store::new());
    let settings_a = TransportSettings { max_fragment_size: 60_000, ..base_settings(port_a, &[port_b], "p0") };
    let transport_a = Transport::new(settings_a, store_a.clone(), TransportFilters::default()).await.unwrap();

    let store_b = Arc::new(Store::new());
    let settings_b = TransportSettings { max_fragment_size: 60_000, ..base_settings(port_b, &[port_a], "p1") };
    let transport_b = Transport::new(settings_b, store_b.clone(), TransportFilters::default()).await.unwrap();

    store_a.set("file", RecordValue::BinaryFile(Arc::new(blob.clone()))).await;
    let modified = store_a.drain_modified().await;
    let mut records = std::collections::HashMap::new();
    for name in modified {
        records.insert(name.clone(), store_a.get(&name).await);
    }
    transport_a.send_modifieds(records).await.unwrap();

    let reassembled = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            if transport_b.receive_once().await.unwrap().is_some() {
                return;
            }
        }
    })
    .await;
    assert!(reassembled.is_ok(), "did not reassemble the fragmented file within the timeout");

    match &store_b.get("file").await.value {
        RecordValue::BinaryFile(bytes) => assert_eq!(**bytes, blob),
        other => panic!("expected a reassembled binary file, got {other:?}"),
    }

    store_b.set("file.1.ack", RecordValue::Integer(blob.len() as i64)).await;
    let modified = store_b.drain_modified().await;
    let mut records = std::collections::HashMap::new();
    for name in modified {
        records.insert(name.clone(), store_b.get(&name).await);
    }
    transport_b.send_modifieds(records).await.unwrap();

    let ack = tokio::time::timeout(std::time::Duration::from_secs(2), transport_a.receive_once()).await;
    assert!(ack.is_ok() && ack.unwrap().unwrap().is_some());
    assert_eq!(store_a.get("file.1.ack").await.to_integer(), blob.len() as i64);
}

/// Scenario 4: a 5-node chain P0 -> P1 -> P2 -> P3 -> P4, each trusting only
/// its next hop (modeled by each node's peer list containing only the next
/// node). P0 publishes `v=1` with ttl=3; P1, P2 and P3 apply and rebroadcast
/// (decrementing ttl each hop); P4 applies but the ttl budget is exhausted
/// so it never rebroadcasts, and nothing loops back to P0.
#[tokio::test]
async fn rebroadcast_chain_stops_when_ttl_is_exhausted() {
    let ports: Vec<u16> = (0..5).map(|_| free_port()).collect();

    let mut stores = Vec::new();
    let mut transports = Vec::new();
    for i in 0..5 {
        let store = Arc::new(Store::new());
        let peers: Vec<u16> = if i + 1 < 5 { vec![ports[i + 1]] } else { vec![] };
        let mut settings = base_settings(ports[i], &peers, &format!("p{i}"));
        if i == 0 {
            settings.rebroadcast_ttl = 3;
        }
        let transport = Arc::new(Transport::new(settings, store.clone(), TransportFilters::default()).await.unwrap());
        stores.push(store);
        transports.push(transport);
    }

    // P1..P4 each need to be listening before P0 sends, since receiving and
    // (for P1-P3) rebroadcasting happens inline inside `receive_once`.
    let mut handles = Vec::new();
    for transport in transports.iter().skip(1).cloned().collect::<Vec<_>>() {
        handles.push(tokio::spawn(async move { transport.receive_once().await }));
    }

    stores[0].set("v", RecordValue::Integer(1)).await;
    let modified = stores[0].drain_modified().await;
    let mut records = std::collections::HashMap::new();
    for name in modified {
        records.insert(name.clone(), stores[0].get(&name).await);
    }
    transports[0].send_modifieds(records).await.unwrap();

    for handle in handles {
        let result = tokio::time::timeout(std::time::Duration::from_secs(2), handle).await;
        assert!(result.is_ok(), "chain hop timed out");
        assert!(result.unwrap().unwrap().unwrap().is_some());
    }

    for store in &stores[1..] {
        assert_eq!(store.get("v").await.to_integer(), 1);
    }
}
