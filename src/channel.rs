use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

/// Bounded single-producer/single-consumer queue of UDP payloads shared
/// between a receive worker and a relay worker of the same (slot, direction).
///
/// The channel is constructed once, at slot creation, and outlives every
/// reset of the slot's workers: only the tasks holding the two ends are torn
/// down and respawned, never the queue itself, matching the "sockets and
/// queues are preserved across resets" rule for a `Remote Peer Handler`. The
/// receiving half is shared behind a `tokio::sync::Mutex` purely so a fresh
/// worker incarnation can reclaim it after the previous incarnation's task
/// has exited; at any instant exactly one task holds the lock.
pub struct DatagramChannel {
    tx: mpsc::Sender<Bytes>,
    rx: Arc<Mutex<mpsc::Receiver<Bytes>>>,
}

impl DatagramChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Enqueues a payload, blocking the caller while the queue is full. This
    /// is the "no explicit drop-newest path" branch: back-pressure is applied
    /// to the receive worker instead of silently discarding datagrams.
    pub async fn send(&self, payload: Bytes) -> Result<(), mpsc::error::SendError<Bytes>> {
        self.tx.send(payload).await
    }

    /// Dequeues the next payload, or `None` once every sender has been
    /// dropped. Exclusive access to the receiving half is acquired for the
    /// duration of the call, so only one worker incarnation reads at a time.
    pub async fn recv(&self) -> Option<Bytes> {
        self.rx.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn preserves_fifo_order_for_a_single_producer_and_consumer() {
        let channel = DatagramChannel::new(8);
        channel.send(Bytes::from_static(b"one")).await.unwrap();
        channel.send(Bytes::from_static(b"two")).await.unwrap();

        assert_eq!(channel.recv().await, Some(Bytes::from_static(b"one")));
        assert_eq!(channel.recv().await, Some(Bytes::from_static(b"two")));
    }

    #[tokio::test]
    async fn recv_blocks_on_an_empty_open_channel() {
        let channel = DatagramChannel::new(1);
        assert!(tokio::time::timeout(std::time::Duration::from_millis(10), channel.recv())
            .await
            .is_err());
    }
}
