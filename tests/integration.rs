use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use relayd::config::{LogLevel, Role, RuntimeConfig, Tuning};
use relayd::keepalive::KEEP_ALIVE;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

fn short_tuning() -> Tuning {
    Tuning {
        receive_buffer_size: 2048,
        packet_queue_size: 16,
        client_connection_timeout: Duration::from_millis(600),
        server_connection_timeout: Duration::from_millis(600),
        server_peer_connection_timeout: Duration::from_millis(900),
        ping_interval: Duration::from_millis(20),
        ping_timeout: Duration::from_millis(150),
    }
}

fn server_config(listen_port: u16, peers: u32, relay_base: u16) -> Arc<RuntimeConfig> {
    Arc::new(RuntimeConfig {
        role: Role::Server,
        bind_ip: Ipv4Addr::LOCALHOST,
        peers,
        listen_port,
        source_ip: Ipv4Addr::UNSPECIFIED,
        destination_ip: Ipv4Addr::UNSPECIFIED,
        destination_port: 0,
        server_relay_base_port: relay_base,
        client_relay_base_port: 0,
        log_level: LogLevel::Quiet,
        tuning: Arc::new(short_tuning()),
    })
}

#[allow(clippy::too_many_arguments)]
fn client_config(
    peers: u32,
    server_relay_base: u16,
    destination_port: u16,
    client_relay_base: u16,
) -> Arc<RuntimeConfig> {
    Arc::new(RuntimeConfig {
        role: Role::Client,
        bind_ip: Ipv4Addr::LOCALHOST,
        peers,
        listen_port: 0,
        source_ip: Ipv4Addr::LOCALHOST,
        destination_ip: Ipv4Addr::LOCALHOST,
        destination_port,
        server_relay_base_port: server_relay_base,
        client_relay_base_port: client_relay_base,
        log_level: LogLevel::Quiet,
        tuning: Arc::new(short_tuning()),
    })
}

async fn bind_endpoint(port: u16) -> UdpSocket {
    UdpSocket::bind((Ipv4Addr::LOCALHOST, port)).await.unwrap()
}

/// Scenario 1: single-peer echo. A peer's datagram reaches the endpoint
/// unmodified, and the endpoint's reply reaches the peer unmodified.
#[tokio::test]
async fn single_peer_echo() {
    let endpoint = bind_endpoint(28200).await;
    let listen_port = 28015;
    let server_relay_base = 29000;
    let client_relay_base = 29100;

    let _ = tokio::spawn(relayd::run(server_config(listen_port, 1, server_relay_base)));
    let _ = tokio::spawn(relayd::run(client_config(1, server_relay_base, 28200, client_relay_base)));
    sleep(Duration::from_millis(250)).await;

    let peer = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    peer.send_to(&[0x41, 0x42], (Ipv4Addr::LOCALHOST, listen_port))
        .await
        .unwrap();

    let mut buf = [0u8; 16];
    let (n, from) = timeout(Duration::from_secs(2), endpoint.recv_from(&mut buf))
        .await
        .expect("endpoint should receive the peer's datagram")
        .unwrap();
    assert_eq!(&buf[..n], &[0x41, 0x42]);

    endpoint.send_to(&[0x43], from).await.unwrap();

    let mut reply = [0u8; 16];
    let (n, _) = timeout(Duration::from_secs(2), peer.recv_from(&mut reply))
        .await
        .expect("peer should receive the endpoint's reply")
        .unwrap();
    assert_eq!(&reply[..n], &[0x43]);
}

/// Scenario 2: two peers admitted into distinct slots never have their
/// traffic or replies swapped.
#[tokio::test]
async fn two_peer_separation() {
    let endpoint_a = bind_endpoint(28300).await;
    let endpoint_b = bind_endpoint(28301).await;
    let listen_port = 28016;
    let server_relay_base = 29200;
    let client_relay_base = 29300;

    let _ = tokio::spawn(relayd::run(server_config(listen_port, 2, server_relay_base)));
    let _ = tokio::spawn(relayd::run(client_config(2, server_relay_base, 28300, client_relay_base)));
    sleep(Duration::from_millis(250)).await;

    let peer_a = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let peer_b = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    peer_a.send_to(&[0x01], (Ipv4Addr::LOCALHOST, listen_port)).await.unwrap();
    peer_b.send_to(&[0x02], (Ipv4Addr::LOCALHOST, listen_port)).await.unwrap();

    let mut buf = [0u8; 16];
    let (n, from_a) = timeout(Duration::from_secs(2), endpoint_a.recv_from(&mut buf))
        .await
        .expect("endpoint_a should receive peer A's datagram")
        .unwrap();
    assert_eq!(&buf[..n], &[0x01]);

    let (n, from_b) = timeout(Duration::from_secs(2), endpoint_b.recv_from(&mut buf))
        .await
        .expect("endpoint_b should receive peer B's datagram")
        .unwrap();
    assert_eq!(&buf[..n], &[0x02]);

    endpoint_a.send_to(&[0xAA], from_a).await.unwrap();
    endpoint_b.send_to(&[0xBB], from_b).await.unwrap();

    let mut reply = [0u8; 16];
    let (n, _) = timeout(Duration::from_secs(2), peer_a.recv_from(&mut reply))
        .await
        .expect("peer A should receive its reply")
        .unwrap();
    assert_eq!(&reply[..n], &[0xAA]);

    let (n, _) = timeout(Duration::from_secs(2), peer_b.recv_from(&mut reply))
        .await
        .expect("peer B should receive its reply")
        .unwrap();
    assert_eq!(&reply[..n], &[0xBB]);
}

/// Scenario 5: oversubscription. With one slot occupied, a second peer's
/// datagram is dropped and the first peer's stream is unaffected.
#[tokio::test]
async fn oversubscription_drops_the_extra_peer() {
    let endpoint = bind_endpoint(28400).await;
    let listen_port = 28017;
    let server_relay_base = 29400;
    let client_relay_base = 29500;

    let _ = tokio::spawn(relayd::run(server_config(listen_port, 1, server_relay_base)));
    let _ = tokio::spawn(relayd::run(client_config(1, server_relay_base, 28400, client_relay_base)));
    sleep(Duration::from_millis(250)).await;

    let peer_a = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let peer_b = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();

    peer_a.send_to(&[0x01], (Ipv4Addr::LOCALHOST, listen_port)).await.unwrap();
    let mut buf = [0u8; 16];
    let (n, from_a) = timeout(Duration::from_secs(2), endpoint.recv_from(&mut buf))
        .await
        .expect("endpoint should receive peer A's datagram")
        .unwrap();
    assert_eq!(&buf[..n], &[0x01]);

    peer_b.send_to(&[0x02], (Ipv4Addr::LOCALHOST, listen_port)).await.unwrap();
    assert!(
        timeout(Duration::from_millis(300), endpoint.recv_from(&mut buf))
            .await
            .is_err(),
        "peer B's datagram must not reach the endpoint while the single slot is occupied"
    );

    endpoint.send_to(&[0xAA], from_a).await.unwrap();
    let mut reply = [0u8; 16];
    let (n, _) = timeout(Duration::from_secs(2), peer_a.recv_from(&mut reply))
        .await
        .expect("peer A's stream keeps working after the oversubscribed datagram was dropped")
        .unwrap();
    assert_eq!(&reply[..n], &[0xAA]);
}

/// Scenario 3: eviction under pressure. With two slots occupied, the admission
/// socket going idle past `server_peer_connection_timeout` purges every
/// mapping (the known all-or-nothing purge hazard), so a newly arriving peer
/// is admitted into the lowest vacant slot, A's former one.
#[tokio::test]
async fn eviction_under_pressure_readmits_into_the_idle_peer_slot() {
    let endpoint_a = bind_endpoint(28600).await;
    let endpoint_b = bind_endpoint(28601).await;
    let listen_port = 28019;
    let server_relay_base = 29800;
    let client_relay_base = 29900;

    let _ = tokio::spawn(relayd::run(server_config(listen_port, 2, server_relay_base)));
    let _ = tokio::spawn(relayd::run(client_config(2, server_relay_base, 28600, client_relay_base)));
    sleep(Duration::from_millis(250)).await;

    let peer_a = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let peer_b = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();

    peer_a.send_to(&[0x01], (Ipv4Addr::LOCALHOST, listen_port)).await.unwrap();
    let mut buf = [0u8; 16];
    timeout(Duration::from_secs(2), endpoint_a.recv_from(&mut buf))
        .await
        .expect("endpoint_a should receive peer A's datagram")
        .unwrap();

    peer_b.send_to(&[0x02], (Ipv4Addr::LOCALHOST, listen_port)).await.unwrap();
    timeout(Duration::from_secs(2), endpoint_b.recv_from(&mut buf))
        .await
        .expect("endpoint_b should receive peer B's datagram")
        .unwrap();

    // Let the admission socket sit idle past server_peer_connection_timeout
    // (900ms) so the purge sweep clears every mapping, A's and B's alike.
    sleep(Duration::from_millis(1100)).await;

    let peer_c = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    peer_c.send_to(&[0x03], (Ipv4Addr::LOCALHOST, listen_port)).await.unwrap();

    let (n, _) = timeout(Duration::from_secs(2), endpoint_a.recv_from(&mut buf))
        .await
        .expect("peer C is admitted into the lowest vacant slot, A's former one")
        .unwrap();
    assert_eq!(&buf[..n], &[0x03]);

    assert!(
        timeout(Duration::from_millis(300), endpoint_b.recv_from(&mut buf))
            .await
            .is_err(),
        "peer C's datagram must land only in slot 0, never in slot 1"
    );
}

/// Scenario 4: tunnel reset. After steady-state traffic, the endpoint stays
/// silent past `client_connection_timeout`; the client's destination-receive
/// times out, the slot resets, keep-alive restarts, and traffic resumes
/// without the process exiting.
#[tokio::test]
async fn tunnel_reset_after_idle_recovers_without_process_exit() {
    let endpoint = bind_endpoint(28700).await;
    let listen_port = 28020;
    let server_relay_base = 30000;
    let client_relay_base = 30100;

    let _ = tokio::spawn(relayd::run(server_config(listen_port, 1, server_relay_base)));
    let _ = tokio::spawn(relayd::run(client_config(1, server_relay_base, 28700, client_relay_base)));
    sleep(Duration::from_millis(250)).await;

    let peer = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    peer.send_to(&[0x01], (Ipv4Addr::LOCALHOST, listen_port)).await.unwrap();

    let mut buf = [0u8; 16];
    let (n, _) = timeout(Duration::from_secs(2), endpoint.recv_from(&mut buf))
        .await
        .expect("endpoint should receive the datagram before the idle window")
        .unwrap();
    assert_eq!(&buf[..n], &[0x01]);

    // Neither side exchanges anything across the tunnel for longer than
    // client_connection_timeout / server_connection_timeout (600ms), so both
    // destination-receive workers time out and the slot resets.
    sleep(Duration::from_millis(900)).await;

    peer.send_to(&[0x02], (Ipv4Addr::LOCALHOST, listen_port)).await.unwrap();
    let (n, from) = timeout(Duration::from_secs(3), endpoint.recv_from(&mut buf))
        .await
        .expect("traffic resumes once the slot resets and re-handshakes")
        .unwrap();
    assert_eq!(&buf[..n], &[0x02]);

    endpoint.send_to(&[0x03], from).await.unwrap();
    let (n, _) = timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
        .await
        .expect("the reply path also recovers after the reset")
        .unwrap();
    assert_eq!(&buf[..n], &[0x03]);
}

/// Scenario 6 (core invariant 7): a reserved keep-alive payload injected by
/// an already-admitted peer is never delivered to the endpoint, and normal
/// traffic for that peer keeps flowing.
#[tokio::test]
async fn reserved_payload_from_a_peer_never_reaches_the_endpoint() {
    let endpoint = bind_endpoint(28500).await;
    let listen_port = 28018;
    let server_relay_base = 29600;
    let client_relay_base = 29700;

    let _ = tokio::spawn(relayd::run(server_config(listen_port, 1, server_relay_base)));
    let _ = tokio::spawn(relayd::run(client_config(1, server_relay_base, 28500, client_relay_base)));
    sleep(Duration::from_millis(250)).await;

    let peer = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    peer.send_to(&[0x09], (Ipv4Addr::LOCALHOST, listen_port)).await.unwrap();

    let mut buf = [0u8; 32];
    let (n, _) = timeout(Duration::from_secs(2), endpoint.recv_from(&mut buf))
        .await
        .expect("endpoint should receive the peer's first datagram")
        .unwrap();
    assert_eq!(&buf[..n], &[0x09]);

    peer.send_to(KEEP_ALIVE, (Ipv4Addr::LOCALHOST, listen_port)).await.unwrap();
    assert!(
        timeout(Duration::from_millis(300), endpoint.recv_from(&mut buf))
            .await
            .is_err(),
        "a reserved keep-alive payload must never be delivered to the endpoint"
    );

    peer.send_to(&[0x0A], (Ipv4Addr::LOCALHOST, listen_port)).await.unwrap();
    let (n, _) = timeout(Duration::from_secs(2), endpoint.recv_from(&mut buf))
        .await
        .expect("normal traffic resumes after the reserved payload was discarded")
        .unwrap();
    assert_eq!(&buf[..n], &[0x0A]);
}
