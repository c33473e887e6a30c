//! Reserved payloads exchanged between a client and server instance before
//! either side forwards real application traffic for a slot.
//!
//! Both binaries are built from this same crate, so client and server always
//! agree on the exact bytes without needing a handshake to negotiate them.

/// Sent periodically by whichever side is still waiting for the other to
/// confirm the tunnel.
pub const KEEP_ALIVE: &[u8] = b"\xACrelayd:ping";

/// Sent by the server once admission has associated a real peer with the
/// slot, telling the client to stop pinging and start forwarding.
pub const KEEP_ALIVE_HALT: &[u8] = b"\xADrelayd:halt";

/// True if `payload` is one of the two reserved keep-alive byte strings and
/// must never reach the private endpoint or the public peer.
pub fn is_reserved(payload: &[u8]) -> bool {
    payload == KEEP_ALIVE || payload == KEEP_ALIVE_HALT
}
