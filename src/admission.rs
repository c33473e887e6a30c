use std::net::SocketAddrV4;
use std::sync::Arc;

use ahash::AHashMap;
use bytes::Bytes;
use tokio::net::UdpSocket;

use crate::config::Tuning;
use crate::flags::Flag;
use crate::slot::Slot;
use crate::statistics::Counters;

/// The single reader of the server's public listening port. Demultiplexes
/// inbound peer datagrams onto per-slot upstream channels, admitting new
/// peers into the lowest-indexed vacant slot and evicting idle ones.
///
/// The forward (peer address → slot) and reverse (slot → peer address,
/// folded into each `Slot::peer_addr`) maps are mutated only here, so they
/// need no lock of their own — the forward map lives entirely inside `run`.
pub struct AdmissionWorker {
    socket: Arc<UdpSocket>,
    slots: Arc<Vec<Arc<Slot>>>,
    counters: Arc<Counters>,
    tuning: Arc<Tuning>,
}

impl AdmissionWorker {
    pub fn new(
        socket: Arc<UdpSocket>,
        slots: Arc<Vec<Arc<Slot>>>,
        counters: Arc<Counters>,
        tuning: Arc<Tuning>,
    ) -> Self {
        Self {
            socket,
            slots,
            counters,
            tuning,
        }
    }

    /// Waits on `ready` before reading the first datagram, so every slot's
    /// relay worker is already blocked on its keep-alive read by the time
    /// the first peer arrives. Returns when `shutdown` is set.
    pub async fn run(self, ready: Arc<Flag>, shutdown: Arc<Flag>) {
        ready.wait().await;

        let mut forward: AHashMap<SocketAddrV4, usize> = AHashMap::with_capacity(self.slots.len());
        let mut vacancy = vec![true; self.slots.len()];
        let mut buf = vec![0u8; self.tuning.receive_buffer_size];

        loop {
            tokio::select! {
                _ = shutdown.wait() => return,
                res = tokio::time::timeout(
                    self.tuning.server_peer_connection_timeout,
                    self.socket.recv_from(&mut buf),
                ) => {
                    match res {
                        Ok(Ok((n, std::net::SocketAddr::V4(from)))) => {
                            self.admit(&mut forward, &mut vacancy, from, &buf[..n]).await;
                        }
                        Ok(Ok((_, std::net::SocketAddr::V6(_)))) => {
                            log::debug!("dropping IPv6 datagram, only IPv4 peers are supported");
                        }
                        Ok(Err(err)) => {
                            log::warn!("admission socket error: {err}");
                        }
                        Err(_elapsed) => self.purge(&mut forward, &mut vacancy),
                    }
                }
            }
        }
    }

    async fn admit(
        &self,
        forward: &mut AHashMap<SocketAddrV4, usize>,
        vacancy: &mut [bool],
        from: SocketAddrV4,
        payload: &[u8],
    ) {
        if let Some(&index) = forward.get(&from) {
            let slot = &self.slots[index];
            if !slot.remote_peer.is_set() {
                log::info!("slot {index}: reinstated dropped peer {from}");
                slot.remote_peer.set();
            }
            self.counters.record_source(payload.len());
            if slot.upstream.send(Bytes::copy_from_slice(payload)).await.is_err() {
                log::warn!("slot {index}: upstream channel closed, dropping datagram");
            }
            return;
        }

        if vacancy.iter().all(|vacant| !vacant) {
            self.evict_idle_slots(forward, vacancy);
        }

        let Some(index) = vacancy.iter().position(|vacant| *vacant) else {
            log::warn!("no vacancies, dropping datagram from {from}");
            return;
        };

        forward.insert(from, index);
        vacancy[index] = false;

        let slot = &self.slots[index];
        slot.peer_addr.set(from);
        slot.remote_peer.set();

        self.counters.record_source(payload.len());
        if slot.upstream.send(Bytes::copy_from_slice(payload)).await.is_err() {
            log::warn!("slot {index}: upstream channel closed, dropping datagram");
        }
    }

    /// Scans for slots whose remote-peer flag has gone cold and frees them.
    /// Never touches a slot whose flag is still set — invariant 4 (eviction
    /// fairness).
    fn evict_idle_slots(&self, forward: &mut AHashMap<SocketAddrV4, usize>, vacancy: &mut [bool]) {
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.remote_peer.is_set() {
                continue;
            }
            if let Some(old_addr) = slot.peer_addr.get() {
                forward.remove(&old_addr);
                slot.peer_addr.clear();
            }
            vacancy[index] = true;
        }
    }

    /// Idle timeout with at least one known peer purges every peer mapping,
    /// live or dead alike. This is a known hazard inherited unchanged from
    /// the reference behavior this was distilled from: a peer that is still
    /// actively exchanging traffic can be purged here if no *other* peer's
    /// datagram arrives within the timeout window, since the timer resets
    /// on any admission-socket activity rather than per-peer.
    fn purge(&self, forward: &mut AHashMap<SocketAddrV4, usize>, vacancy: &mut [bool]) {
        if forward.is_empty() {
            return;
        }

        log::warn!("no peer activity within timeout, purging {} peer(s)", forward.len());
        for &index in forward.values() {
            self.slots[index].peer_addr.clear();
            self.slots[index].remote_peer.clear();
        }
        forward.clear();
        vacancy.iter_mut().for_each(|vacant| *vacant = true);
    }
}
