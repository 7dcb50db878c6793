use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide traffic counters, passed explicitly into the components that
///  produce or consume bytes. The registration layer samples these at each
///  refresh cycle to derive byte-rate averages for the process descriptor.
#[derive(Debug, Default)]
pub struct TrafficStats {
    read_bytes: AtomicU64,
    write_bytes: AtomicU64,
}

impl TrafficStats {
    pub fn add_read_bytes(&self, n: u64) {
        self.read_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_write_bytes(&self, n: u64) {
        self.write_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn read_bytes(&self) -> u64 {
        self.read_bytes.load(Ordering::Relaxed)
    }

    pub fn write_bytes(&self) -> u64 {
        self.write_bytes.load(Ordering::Relaxed)
    }
}
