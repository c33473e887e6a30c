use std::sync::atomic::{AtomicUsize, Ordering};

/// A single atomically-updated counter.
#[derive(Default)]
pub struct Count(AtomicUsize);

impl Count {
    pub fn add(&self, value: usize) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    /// Stores `value` if it is larger than the current one.
    pub fn observe_max(&self, value: usize) {
        self.0.fetch_max(value, Ordering::Relaxed);
    }
}

/// Process-wide relay statistics, printed as a footer on clean shutdown.
#[derive(Default)]
pub struct Counters {
    pub max_packet_size: Count,
    pub source_packet_count: Count,
    pub destination_packet_count: Count,
}

impl Counters {
    pub fn record_source(&self, bytes: usize) {
        self.max_packet_size.observe_max(bytes);
        self.source_packet_count.add(1);
    }

    pub fn record_destination(&self, _bytes: usize) {
        self.destination_packet_count.add(1);
    }

    pub fn log_summary(&self) {
        log::info!("max packet size: {} bytes", self.max_packet_size.get());
        log::info!("source packet count: {}", self.source_packet_count.get());
        log::info!(
            "destination packet count: {}",
            self.destination_packet_count.get()
        );
    }
}
