use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;
use serde::Serialize;

#[derive(Default)]
struct Count(AtomicU64);

impl Count {
    fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct Counters {
    received_bytes: Count,
    sent_bytes: Count,
    received_pkts: Count,
    sent_pkts: Count,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub received_bytes: u64,
    pub sent_bytes: u64,
    pub received_pkts: u64,
    pub sent_pkts: u64,
}

/// Per-address byte/packet counters, kept for diagnostics only. A
/// connection's entry here is independent of its lifetime in the
/// [`crate::registry::Registry`]; losing a race between the two just means
/// a stray counter update is dropped, not a correctness issue.
#[derive(Clone, Default)]
pub struct Statistics(Arc<RwLock<AHashMap<SocketAddr, Counters>>>);

impl Statistics {
    pub fn register(&self, addr: SocketAddr) {
        self.0.write().insert(addr, Counters::default());
    }

    pub fn unregister(&self, addr: &SocketAddr) {
        self.0.write().remove(addr);
    }

    pub fn report_received(&self, addr: &SocketAddr, bytes: u64, pkts: u64) {
        if let Some(counters) = self.0.read().get(addr) {
            counters.received_bytes.add(bytes);
            counters.received_pkts.add(pkts);
        }
    }

    pub fn report_sent(&self, addr: &SocketAddr, bytes: u64, pkts: u64) {
        if let Some(counters) = self.0.read().get(addr) {
            counters.sent_bytes.add(bytes);
            counters.sent_pkts.add(pkts);
        }
    }

    pub fn snapshot(&self, addr: &SocketAddr) -> Option<Snapshot> {
        self.0.read().get(addr).map(|c| Snapshot {
            received_bytes: c.received_bytes.get(),
            sent_bytes: c.sent_bytes.get(),
            received_pkts: c.received_pkts.get(),
            sent_pkts: c.sent_pkts.get(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_address_reports_report_and_snapshot_silently() {
        let stats = Statistics::default();
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        stats.report_received(&addr, 10, 1);
        assert_eq!(stats.snapshot(&addr), None);
    }

    #[test]
    fn counters_accumulate_until_unregistered() {
        let stats = Statistics::default();
        let addr: SocketAddr = "127.0.0.1:2".parse().unwrap();
        stats.register(addr);

        stats.report_received(&addr, 100, 1);
        stats.report_received(&addr, 50, 1);
        stats.report_sent(&addr, 20, 1);

        let snapshot = stats.snapshot(&addr).unwrap();
        assert_eq!(snapshot.received_bytes, 150);
        assert_eq!(snapshot.received_pkts, 2);
        assert_eq!(snapshot.sent_bytes, 20);
        assert_eq!(snapshot.sent_pkts, 1);

        stats.unregister(&addr);
        assert_eq!(stats.snapshot(&addr), None);
    }
}
