//! Integration tests for requester-responder communication over
//! loopback.
//!
//! These tests run the real responder event loop in the background and
//! verify the answer contract, monologue mode and the full requester
//! round machinery against it.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use udprobe::channel::{Channel, ChannelFamily};
use udprobe::configuration::{
    FamilySelection, Pacing, RequesterConfig, ResponderConfig, SocketOptions,
};
use udprobe::events::EventMux;
use udprobe::payload::{
    MessageType, ProbePayload, FORMAT_VERSION, MAGIC, PAYLOAD_SIZE,
};
use udprobe::report::ReportFormat;
use udprobe::requester::run_requester;
use udprobe::responder::run_responder;
use udprobe::scheduler::{run_round, RoundContext};
use udprobe::target::TargetSet;

/// Find an available port for testing.
async fn find_available_port() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.local_addr().unwrap().port()
}

fn responder_config(port: u16) -> ResponderConfig {
    ResponderConfig {
        family: FamilySelection::V4,
        socket: SocketOptions {
            port,
            ..SocketOptions::default()
        },
        responder_key: 7777,
        requester_key_filter: 0,
        monologue: false,
        exit_on_error: false,
        inactivity_timeout: Some(Duration::from_secs(3)),
        plugins: Vec::new(),
        report: ReportFormat::Csv,
    }
}

fn request(local_port: u16, seq: u64, seq_len: u64, key: u64) -> ProbePayload {
    ProbePayload {
        magic: MAGIC,
        format_version: FORMAT_VERSION,
        message_type: MessageType::Request.wire(),
        port: local_port,
        ttl_sent_by_requester: 64,
        ttl_seen_by_responder: 0,
        ttl_sent_by_responder: 0,
        ip_version: 4,
        extended_length: PAYLOAD_SIZE as u16,
        sequence_number: seq,
        sequence_length: seq_len,
        address_low: 0x0100_007F,
        address_high: 0,
        requester_key: key,
        responder_key: 0,
        monotonic_time_sent: 1_000,
        real_time_sent: 2_000,
        monotonic_time_received: 0,
        real_time_received: 0,
    }
}

#[tokio::test]
async fn test_responder_answer_contract() {
    let port = find_available_port().await;
    let responder = tokio::spawn(run_responder(responder_config(port)));

    // Give the responder time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let local_port = socket.local_addr().unwrap().port();
    let dest: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();

    let probe = request(local_port, 3, 10, 42);
    socket.send_to(&probe.to_bytes(), dest).await.unwrap();

    let mut buf = [0u8; 256];
    let (len, src) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .expect("no response within timeout")
        .unwrap();
    assert_eq!(src, dest);
    assert_eq!(len, PAYLOAD_SIZE);

    let response = udprobe::payload::verify(&buf[..len], MessageType::Response).unwrap();
    assert_eq!(response.sequence_number, 3);
    assert_eq!(response.sequence_length, 10);
    assert_eq!(response.requester_key, 42);
    assert_eq!(response.responder_key, 7777);
    // Loopback delivers the default TTL unchanged
    assert_eq!(response.ttl_seen_by_responder, 64);
    assert_ne!(response.monotonic_time_received, 0);
    assert_ne!(response.real_time_received, 0);
    assert_eq!(response.monotonic_time_sent, 1_000);
    assert_eq!(response.real_time_sent, 2_000);

    responder.abort();
}

#[tokio::test]
async fn test_responder_rejects_foreign_datagrams_silently() {
    let port = find_available_port().await;
    let responder = tokio::spawn(run_responder(responder_config(port)));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let dest: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();

    // Garbage of the wrong size, then of the right size with a bad
    // magic: neither elicits a response.
    socket.send_to(b"not a probe", dest).await.unwrap();
    let mut bogus = request(0, 0, 1, 1);
    bogus.magic = 0x1111_2222;
    socket.send_to(&bogus.to_bytes(), dest).await.unwrap();

    let mut buf = [0u8; 256];
    let result = timeout(Duration::from_millis(300), socket.recv_from(&mut buf)).await;
    assert!(result.is_err(), "foreign datagrams must not be answered");

    // A valid probe afterwards still gets through.
    let probe = request(socket.local_addr().unwrap().port(), 0, 1, 1);
    socket.send_to(&probe.to_bytes(), dest).await.unwrap();
    let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .expect("valid probe not answered")
        .unwrap();
    assert_eq!(len, PAYLOAD_SIZE);

    responder.abort();
}

#[tokio::test]
async fn test_monologue_responder_stays_silent() {
    let port = find_available_port().await;
    let mut config = responder_config(port);
    config.monologue = true;
    config.inactivity_timeout = Some(Duration::from_millis(500));
    let responder = tokio::spawn(run_responder(config));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let dest: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let probe = request(socket.local_addr().unwrap().port(), 0, 1, 1);
    socket.send_to(&probe.to_bytes(), dest).await.unwrap();

    let mut buf = [0u8; 256];
    let result = timeout(Duration::from_millis(300), socket.recv_from(&mut buf)).await;
    assert!(result.is_err(), "monologue mode must not answer");

    // The responder still shuts down cleanly on its idle timeout.
    let outcome = timeout(Duration::from_secs(3), responder)
        .await
        .expect("responder did not reach its idle timeout")
        .unwrap();
    assert!(outcome.is_ok());
}

#[tokio::test]
async fn test_idle_timeout_fires_after_traffic() {
    let port = find_available_port().await;
    let mut config = responder_config(port);
    config.inactivity_timeout = Some(Duration::from_millis(300));
    let responder = tokio::spawn(run_responder(config));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let dest: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let probe = request(socket.local_addr().unwrap().port(), 0, 1, 1);
    socket.send_to(&probe.to_bytes(), dest).await.unwrap();

    let mut buf = [0u8; 256];
    let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .expect("probe not answered")
        .unwrap();
    assert_eq!(len, PAYLOAD_SIZE);

    // After the exchange the socket goes quiet again; the idle window
    // must still expire instead of the loop spinning on stale
    // readiness.
    let outcome = timeout(Duration::from_secs(3), responder)
        .await
        .expect("responder kept running past its idle timeout")
        .unwrap();
    assert!(outcome.is_ok());
}

#[tokio::test]
async fn test_round_collects_responses() {
    let port = find_available_port().await;
    let responder = tokio::spawn(run_responder(responder_config(port)));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut channel = Channel::open(ChannelFamily::Ipv4, &SocketOptions::default()).unwrap();
    let local_port = channel.assigned_port().unwrap();
    let mut events = EventMux::new().unwrap();
    let targets =
        TargetSet::resolve(&["127.0.0.1".to_string()], FamilySelection::V4).await;

    let mut responses = Vec::new();
    let mut ctx = RoundContext {
        channel: &mut channel,
        events: &mut events,
        targets: &targets,
        round: 2,
        rounds_total: 5,
        interval: Duration::from_millis(200),
        exit_on_error: false,
        local_port,
        target_port: port,
        ttl: 64,
        requester_key: 555,
    };

    let outcome = run_round(Pacing::Dispersed, &mut ctx, &mut |payload, peer, _| {
        responses.push((payload, peer))
    })
    .await
    .unwrap();

    assert!(!outcome.terminated);
    assert_eq!(responses.len(), 1);
    let (payload, peer) = &responses[0];
    assert_eq!(peer.port(), port);
    assert_eq!(payload.sequence_number, 2);
    assert_eq!(payload.sequence_length, 5);
    assert_eq!(payload.requester_key, 555);
    assert_eq!(payload.responder_key, 7777);
    assert_eq!(channel.counters.sent_total, 1);
    assert_eq!(channel.counters.received_total, 1);

    responder.abort();
}

#[tokio::test]
async fn test_requester_end_to_end() {
    let port = find_available_port().await;
    let responder = tokio::spawn(run_responder(responder_config(port)));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let config = RequesterConfig {
        targets: vec!["127.0.0.1".to_string()],
        target_port: port,
        family: FamilySelection::V4,
        socket: SocketOptions::default(),
        pacing: Pacing::Grouped,
        rounds: 2,
        interval: Duration::from_millis(100),
        wait: Duration::from_millis(100),
        key: 0,
        exit_on_error: false,
        report: ReportFormat::Csv,
    };

    let result = timeout(Duration::from_secs(5), run_requester(config))
        .await
        .expect("requester did not finish in time");
    assert!(result.is_ok(), "requester failed: {:?}", result);

    responder.abort();
}

#[tokio::test]
async fn test_loopback_ipv6() {
    // Skip if IPv6 loopback is not available
    if UdpSocket::bind("[::1]:0").await.is_err() {
        eprintln!("Skipping IPv6 test - IPv6 loopback not available");
        return;
    }

    let port = find_available_port().await;
    let mut config = responder_config(port);
    config.family = FamilySelection::V6;
    let responder = tokio::spawn(run_responder(config));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let socket = UdpSocket::bind("[::1]:0").await.unwrap();
    let dest: SocketAddr = format!("[::1]:{}", port).parse().unwrap();
    let mut probe = request(socket.local_addr().unwrap().port(), 9, 20, 3);
    probe.ip_version = 6;
    socket.send_to(&probe.to_bytes(), dest).await.unwrap();

    let mut buf = [0u8; 256];
    let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .expect("no IPv6 response within timeout")
        .unwrap();

    let response = udprobe::payload::verify(&buf[..len], MessageType::Response).unwrap();
    assert_eq!(response.sequence_number, 9);
    assert_eq!(response.responder_key, 7777);
    // Hop limit on loopback keeps its configured value
    assert_eq!(response.ttl_seen_by_responder, 64);

    responder.abort();
}
