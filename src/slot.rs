use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use crate::channel::DatagramChannel;
use crate::flags::Flag;

/// An IPv4 socket address packed into two atomic cells, replacing the
/// cross-process shared byte array the admission worker and the
/// `server-destination-relay` worker agreed on in the source implementation.
///
/// The all-zero state (`0.0.0.0:0`) represents "unset"; port 0 is not a
/// usable UDP source port, so it doubles safely as the sentinel.
#[derive(Default)]
pub struct SlotAddr {
    ip: AtomicU32,
    port: AtomicU16,
}

impl SlotAddr {
    pub fn set(&self, addr: SocketAddrV4) {
        self.ip.store(u32::from(*addr.ip()), Ordering::Release);
        self.port.store(addr.port(), Ordering::Release);
    }

    pub fn get(&self) -> Option<SocketAddrV4> {
        let port = self.port.load(Ordering::Acquire);
        if port == 0 {
            return None;
        }
        let ip = self.ip.load(Ordering::Acquire);
        Some(SocketAddrV4::new(Ipv4Addr::from(ip), port))
    }

    pub fn clear(&self) {
        self.port.store(0, Ordering::Release);
        self.ip.store(0, Ordering::Release);
    }
}

/// One per-peer slot's persistent state: everything that survives a reset of
/// the slot's four workers. Sockets are owned by the `PeerHandler` built atop
/// this slot, not by the slot itself, since on the client they are per-slot
/// but on the server the source socket is shared across every slot.
pub struct Slot {
    pub index: usize,
    /// Server only: the admitted peer's public address, written by the
    /// admission worker and cached by `server-destination-relay`.
    pub peer_addr: SlotAddr,
    pub link: Flag,
    pub remote_peer: Flag,
    pub exit: Flag,
    pub upstream: DatagramChannel,
    pub downstream: DatagramChannel,
}

impl Slot {
    pub fn new(index: usize, packet_queue_size: usize) -> Self {
        Self {
            index,
            peer_addr: SlotAddr::default(),
            link: Flag::new(),
            remote_peer: Flag::new(),
            exit: Flag::new(),
            upstream: DatagramChannel::new(packet_queue_size),
            downstream: DatagramChannel::new(packet_queue_size),
        }
    }

    /// Clears the three synchronization flags ahead of spawning a fresh
    /// incarnation of this slot's workers. The peer address cache is left
    /// alone here; resets of a live tunnel do not imply the peer moved, and
    /// an eviction clears it explicitly through `peer_addr.clear()`.
    pub fn reset_flags(&self) {
        self.link.clear();
        self.remote_peer.clear();
        self.exit.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_addr_round_trips_through_set_and_get() {
        let addr = SlotAddr::default();
        assert_eq!(addr.get(), None);

        let target: SocketAddrV4 = "203.0.113.9:51820".parse().unwrap();
        addr.set(target);
        assert_eq!(addr.get(), Some(target));
    }

    #[test]
    fn slot_addr_clear_restores_the_unset_sentinel() {
        let addr = SlotAddr::default();
        addr.set("203.0.113.9:51820".parse().unwrap());
        addr.clear();
        assert_eq!(addr.get(), None);
    }

    #[test]
    fn reset_flags_clears_all_three_without_touching_peer_addr() {
        let slot = Slot::new(0, 4);
        slot.link.set();
        slot.remote_peer.set();
        slot.exit.set();
        slot.peer_addr.set("203.0.113.9:51820".parse().unwrap());

        slot.reset_flags();

        assert!(!slot.link.is_set());
        assert!(!slot.remote_peer.is_set());
        assert!(!slot.exit.is_set());
        assert!(slot.peer_addr.get().is_some());
    }
}
