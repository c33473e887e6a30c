use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::config::{Role, Tuning};
use crate::keepalive::{self, KEEP_ALIVE, KEEP_ALIVE_HALT};
use crate::slot::Slot;
use crate::statistics::Counters;

/// Bound on every steady-state suspension point (socket read, channel
/// dequeue) so a worker always re-checks the slot's exit flag within a
/// predictable interval instead of blocking forever.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// How often `server-destination-relay` polls the peer-address cache before
/// it becomes available.
const PEER_ADDR_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Owns a slot's two sockets and wires its four workers. A `PeerHandler`
/// outlives any number of resets — only the worker tasks it spawns are torn
/// down and respawned, per incarnation.
pub struct PeerHandler {
    pub slot: Arc<Slot>,
    role: Role,
    /// Peer-facing socket. Shared across every slot on the server (the
    /// single admission socket); dedicated per slot on the client.
    source: Arc<UdpSocket>,
    /// Endpoint/tunnel-facing socket, always dedicated to this slot.
    destination: Arc<UdpSocket>,
    /// Client only: the private endpoint's fixed (IP, port).
    endpoint_target: Option<SocketAddrV4>,
    /// Client only: this slot's server-side tunnel (IP, port).
    server_tunnel_target: Option<SocketAddrV4>,
    counters: Arc<Counters>,
    reset_tx: mpsc::Sender<usize>,
    tuning: Arc<Tuning>,
}

impl PeerHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        slot: Arc<Slot>,
        role: Role,
        source: Arc<UdpSocket>,
        destination: Arc<UdpSocket>,
        endpoint_target: Option<SocketAddrV4>,
        server_tunnel_target: Option<SocketAddrV4>,
        counters: Arc<Counters>,
        reset_tx: mpsc::Sender<usize>,
        tuning: Arc<Tuning>,
    ) -> Arc<Self> {
        Arc::new(Self {
            slot,
            role,
            source,
            destination,
            endpoint_target,
            server_tunnel_target,
            counters,
            reset_tx,
            tuning,
        })
    }

    /// Clears the slot's three flags and spawns a fresh incarnation of its
    /// workers: all four on the client, three on the server (the server has
    /// no per-slot `source-receive`; the Admission Worker subsumes it).
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        self.slot.reset_flags();

        let mut handles = Vec::with_capacity(4);
        if self.role == Role::Client {
            handles.push(tokio::spawn(run_source_receive(self.clone())));
        }
        handles.push(tokio::spawn(run_source_relay(self.clone())));
        handles.push(tokio::spawn(run_destination_receive(self.clone())));
        handles.push(tokio::spawn(run_destination_relay(self.clone())));
        handles
    }
}

fn request_reset(handler: &PeerHandler) {
    handler.slot.exit.set();
    // The channel is sized to the peer count; a send failure here just means
    // this slot is already queued for reset by another worker.
    let _ = handler.reset_tx.try_send(handler.slot.index);
}

fn v4(addr: SocketAddr) -> Option<SocketAddrV4> {
    match addr {
        SocketAddr::V4(addr) => Some(addr),
        SocketAddr::V6(_) => None,
    }
}

/// `client-source-receive`: runs the client keep-alive, then forwards
/// tunnel traffic onto the upstream channel.
async fn run_source_receive(handler: Arc<PeerHandler>) {
    if client_handshake(&handler).await {
        return;
    }

    let mut buf = vec![0u8; handler.tuning.receive_buffer_size];
    loop {
        tokio::select! {
            _ = handler.slot.exit.wait() => return,
            res = timeout(DEFAULT_TIMEOUT, handler.source.recv_from(&mut buf)) => {
                match res {
                    Ok(Ok((n, _from))) => {
                        let payload = &buf[..n];
                        if keepalive::is_reserved(payload) {
                            // Stale keep-alive after handshake completed; not an error.
                            continue;
                        }
                        handler.counters.record_source(n);
                        if handler.slot.upstream.send(Bytes::copy_from_slice(payload)).await.is_err() {
                            return;
                        }
                    }
                    Ok(Err(err)) => {
                        log::warn!("slot {}: source-receive error: {err}", handler.slot.index);
                    }
                    Err(_elapsed) => continue,
                }
            }
        }
    }
}

/// `client-destination-receive` / `server-destination-receive`: waits for
/// the link flag, then forwards endpoint/tunnel traffic onto the downstream
/// channel. A timeout here means the tunnel has gone dead, so it forces a
/// reset rather than just ticking over.
async fn run_destination_receive(handler: Arc<PeerHandler>) {
    tokio::select! {
        _ = handler.slot.exit.wait() => return,
        _ = handler.slot.link.wait() => {}
    }

    let timeout_dur = match handler.role {
        Role::Client => handler.tuning.client_connection_timeout,
        Role::Server => handler.tuning.server_connection_timeout,
    };

    let mut buf = vec![0u8; handler.tuning.receive_buffer_size];
    loop {
        tokio::select! {
            _ = handler.slot.exit.wait() => return,
            res = timeout(timeout_dur, handler.destination.recv_from(&mut buf)) => {
                match res {
                    Ok(Ok((n, _from))) => {
                        let payload = &buf[..n];
                        if keepalive::is_reserved(payload) {
                            log::warn!(
                                "slot {}: keep-alive observed during steady state, resetting",
                                handler.slot.index
                            );
                            request_reset(&handler);
                            return;
                        }
                        if handler.slot.downstream.send(Bytes::copy_from_slice(payload)).await.is_err() {
                            return;
                        }
                    }
                    Ok(Err(err)) => {
                        log::warn!("slot {}: destination-receive error: {err}, resetting", handler.slot.index);
                        request_reset(&handler);
                        return;
                    }
                    Err(_elapsed) => {
                        log::warn!("slot {}: tunnel idle, resetting", handler.slot.index);
                        request_reset(&handler);
                        return;
                    }
                }
            }
        }
    }
}

/// `client-source-relay`: sends upstream traffic to the configured private
/// endpoint. `server-source-relay`: runs the server keep-alive to learn the
/// client's tunnel address, then sends upstream traffic there.
async fn run_source_relay(handler: Arc<PeerHandler>) {
    let target = match handler.role {
        Role::Client => handler
            .endpoint_target
            .expect("client role always carries a configured endpoint target"),
        Role::Server => match server_handshake(&handler).await {
            Some(addr) => addr,
            None => return,
        },
    };

    loop {
        tokio::select! {
            _ = handler.slot.exit.wait() => return,
            payload = timeout(DEFAULT_TIMEOUT, handler.slot.upstream.recv()) => {
                match payload {
                    Ok(Some(bytes)) => {
                        if let Err(err) = handler.destination.send_to(&bytes, target).await {
                            log::debug!("slot {}: source-relay send failed: {err}", handler.slot.index);
                        }
                    }
                    Ok(None) => return,
                    Err(_elapsed) => continue,
                }
            }
        }
    }
}

/// `client-destination-relay`: sends downstream traffic back across the
/// tunnel to the statically configured server address. `server-destination-
/// relay`: waits for the link flag, caches the admission-learned peer
/// address, then sends downstream traffic there.
async fn run_destination_relay(handler: Arc<PeerHandler>) {
    let target = match handler.role {
        Role::Client => handler
            .server_tunnel_target
            .expect("client role always carries a configured tunnel target"),
        Role::Server => match wait_for_cached_peer_addr(&handler).await {
            Some(addr) => addr,
            None => return,
        },
    };

    loop {
        tokio::select! {
            _ = handler.slot.exit.wait() => return,
            payload = timeout(DEFAULT_TIMEOUT, handler.slot.downstream.recv()) => {
                match payload {
                    Ok(Some(bytes)) => {
                        match handler.source.send_to(&bytes, target).await {
                            Ok(_) => handler.counters.record_destination(bytes.len()),
                            Err(err) => log::debug!("slot {}: destination-relay send failed: {err}", handler.slot.index),
                        }
                    }
                    Ok(None) => return,
                    Err(_elapsed) => continue,
                }
            }
        }
    }
}

async fn wait_for_cached_peer_addr(handler: &Arc<PeerHandler>) -> Option<SocketAddrV4> {
    tokio::select! {
        _ = handler.slot.exit.wait() => return None,
        _ = handler.slot.link.wait() => {}
    }

    loop {
        if let Some(addr) = handler.slot.peer_addr.get() {
            return Some(addr);
        }
        tokio::select! {
            _ = handler.slot.exit.wait() => return None,
            _ = tokio::time::sleep(PEER_ADDR_POLL_INTERVAL) => continue,
        }
    }
}

/// Runs the client side of the keep-alive handshake (§ the paired state
/// machine). Returns `true` if the slot's exit flag fired before the
/// handshake completed, telling the caller to give up without entering the
/// steady-state loop.
async fn client_handshake(handler: &Arc<PeerHandler>) -> bool {
    let server_target = handler
        .server_tunnel_target
        .expect("client role always carries a configured tunnel target");
    let mut buf = vec![0u8; handler.tuning.receive_buffer_size];
    let mut confirmed = false;

    while !handler.slot.remote_peer.is_set() && !handler.slot.exit.is_set() {
        if let Err(err) = handler.source.send_to(KEEP_ALIVE, server_target).await {
            log::warn!("slot {}: keep-alive send failed: {err}", handler.slot.index);
        }

        match timeout(handler.tuning.ping_timeout, handler.source.recv_from(&mut buf)).await {
            Ok(Ok((n, from))) => {
                if v4(from) != Some(server_target) {
                    log::warn!("slot {}: handshake reply from unexpected address {from}", handler.slot.index);
                    continue;
                }

                let payload = &buf[..n];
                if payload == KEEP_ALIVE {
                    if !confirmed {
                        confirmed = true;
                        log::info!("slot {}: server connection confirmed", handler.slot.index);
                    }
                    tokio::time::sleep(handler.tuning.ping_interval).await;
                } else if payload == KEEP_ALIVE_HALT {
                    handler.slot.remote_peer.set();
                } else {
                    log::warn!("slot {}: malformed handshake payload", handler.slot.index);
                }
            }
            Ok(Err(err)) => log::warn!("slot {}: handshake recv error: {err}", handler.slot.index),
            Err(_elapsed) => continue,
        }
    }

    if handler.slot.exit.is_set() {
        return true;
    }

    handler.slot.link.set();
    false
}

/// Runs the server side of the keep-alive handshake. Returns the client's
/// learned tunnel address, or `None` if the slot's exit flag fired first.
async fn server_handshake(handler: &Arc<PeerHandler>) -> Option<SocketAddrV4> {
    let mut buf = vec![0u8; handler.tuning.receive_buffer_size];
    let mut confirmed = false;
    let mut tunnel_target = None;

    while !handler.slot.remote_peer.is_set() {
        let recv = tokio::select! {
            _ = handler.slot.exit.wait() => return None,
            recv = handler.destination.recv_from(&mut buf) => recv,
        };

        let (n, from) = match recv {
            Ok((n, from)) => (n, from),
            Err(err) => {
                log::warn!("slot {}: handshake recv error: {err}", handler.slot.index);
                continue;
            }
        };

        let Some(from) = v4(from) else { continue };
        let payload = &buf[..n];

        if payload == KEEP_ALIVE {
            if !confirmed {
                confirmed = true;
                log::info!("slot {}: client connection confirmed", handler.slot.index);
            }
            tokio::time::sleep(handler.tuning.ping_interval).await;
        } else {
            log::warn!("slot {}: malformed handshake payload", handler.slot.index);
        }

        if handler.slot.remote_peer.is_set() {
            if let Err(err) = handler.destination.send_to(KEEP_ALIVE_HALT, from).await {
                log::warn!("slot {}: halt send failed: {err}", handler.slot.index);
            }
            log::info!("slot {}: halted keep-alive for {from}", handler.slot.index);
        } else if let Err(err) = handler.destination.send_to(KEEP_ALIVE, from).await {
            log::warn!("slot {}: keep-alive send failed: {err}", handler.slot.index);
        }

        tunnel_target = Some(from);
    }

    let tunnel_target = tunnel_target?;
    handler.slot.link.set();
    Some(tunnel_target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Tuning;
    use crate::slot::Slot;
    use std::net::Ipv4Addr;
    use tokio::sync::mpsc;

    async fn loopback_socket() -> Arc<UdpSocket> {
        Arc::new(UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap())
    }

    fn short_tuning() -> Arc<Tuning> {
        Arc::new(Tuning {
            receive_buffer_size: 2048,
            packet_queue_size: 16,
            client_connection_timeout: Duration::from_millis(200),
            server_connection_timeout: Duration::from_millis(200),
            server_peer_connection_timeout: Duration::from_millis(500),
            ping_interval: Duration::from_millis(10),
            ping_timeout: Duration::from_millis(100),
        })
    }

    #[tokio::test]
    async fn full_handshake_sets_link_on_both_sides() {
        let client_source = loopback_socket().await;
        let server_destination = loopback_socket().await;
        let server_addr = v4(server_destination.local_addr().unwrap()).unwrap();
        let client_addr = v4(client_source.local_addr().unwrap()).unwrap();

        let (reset_tx, _reset_rx) = mpsc::channel(4);
        let tuning = short_tuning();
        let counters = Arc::new(Counters::default());

        let client_slot = Arc::new(Slot::new(0, 16));
        let client_handler = PeerHandler::new(
            client_slot.clone(),
            Role::Client,
            client_source.clone(),
            client_source.clone(),
            None,
            Some(server_addr),
            counters.clone(),
            reset_tx.clone(),
            tuning.clone(),
        );

        let server_slot = Arc::new(Slot::new(0, 16));
        let server_handler = PeerHandler::new(
            server_slot.clone(),
            Role::Server,
            server_destination.clone(),
            server_destination.clone(),
            None,
            None,
            counters,
            reset_tx,
            tuning,
        );

        let client_task = tokio::spawn(async move { client_handshake(&client_handler).await });
        let server_task = tokio::spawn(async move { server_handshake(&server_handler).await });

        let client_exited = timeout(Duration::from_secs(2), client_task).await.unwrap().unwrap();
        let server_tunnel_target = timeout(Duration::from_secs(2), server_task).await.unwrap().unwrap();

        assert!(!client_exited);
        assert_eq!(server_tunnel_target, Some(client_addr));
        assert!(client_slot.link.is_set());
        assert!(server_slot.link.is_set());
    }

    #[tokio::test]
    async fn client_handshake_gives_up_once_exit_flag_is_set() {
        let client_source = loopback_socket().await;
        let fake_server: SocketAddrV4 = "127.0.0.1:1".parse().unwrap();

        let (reset_tx, _reset_rx) = mpsc::channel(4);
        let tuning = short_tuning();
        let slot = Arc::new(Slot::new(0, 16));
        slot.exit.set();

        let handler = PeerHandler::new(
            slot,
            Role::Client,
            client_source.clone(),
            client_source,
            None,
            Some(fake_server),
            Arc::new(Counters::default()),
            reset_tx,
            tuning,
        );

        let exited = timeout(Duration::from_secs(1), client_handshake(&handler))
            .await
            .unwrap();
        assert!(exited);
    }
}
