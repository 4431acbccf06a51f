//! Short-term memory of recent qdisc events.
//!
//! A qdisc delete usually arrives without its TCA_KIND attribute, so the
//! only way to classify it as netem-related is to remember what was recently
//! installed on that interface. Bounded both by entry count and by age.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::netlink::event::AttrMap;

/// Retained entries beyond this count evict the oldest.
const CAPACITY: usize = 20;

/// Entries older than this are never consulted and are evicted on push.
const MAX_AGE_MS: i64 = 300_000;

#[derive(Debug, Clone)]
pub struct QdiscHistoryEntry {
    pub timestamp_ms: i64,
    pub kind_name: &'static str,
    pub attrs: AttrMap,
}

/// Bounded FIFO of recent qdisc events, shared behind one mutex.
#[derive(Debug, Default)]
pub struct QdiscHistory {
    entries: Mutex<VecDeque<QdiscHistoryEntry>>,
}

impl QdiscHistory {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(CAPACITY)),
        }
    }

    /// Record a qdisc event, evicting expired entries first and the oldest
    /// entry if the FIFO is full.
    pub fn push(&self, now_ms: i64, kind_name: &'static str, attrs: AttrMap) {
        let mut entries = self.entries.lock();

        let cutoff = now_ms - MAX_AGE_MS;
        while entries.front().is_some_and(|e| e.timestamp_ms < cutoff) {
            entries.pop_front();
        }

        if entries.len() >= CAPACITY {
            entries.pop_front();
        }

        entries.push_back(QdiscHistoryEntry {
            timestamp_ms: now_ms,
            kind_name,
            attrs,
        });
    }

    /// True iff a retained, unexpired entry on `interface` was netem.
    /// Scans oldest → newest.
    pub fn netem_seen_on_interface(&self, interface: &str, now_ms: i64) -> bool {
        let cutoff = now_ms - MAX_AGE_MS;
        self.entries.lock().iter().any(|entry| {
            entry.timestamp_ms >= cutoff
                && entry.attrs.get("interface").is_some_and(|i| i == interface)
                && entry.attrs.get("is_netem").is_some_and(|v| v == "true")
        })
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn netem_attrs(interface: &str, is_netem: bool) -> AttrMap {
        let mut attrs = AttrMap::new();
        attrs.insert("interface".to_string(), interface.to_string());
        attrs.insert(
            "is_netem".to_string(),
            if is_netem { "true" } else { "false" }.to_string(),
        );
        attrs
    }

    #[test]
    fn test_scan_matches_interface_and_netem_flag() {
        let history = QdiscHistory::new();
        history.push(1_000, "QDISC_ADD", netem_attrs("eth0", true));
        history.push(1_100, "QDISC_ADD", netem_attrs("eth1", false));

        assert!(history.netem_seen_on_interface("eth0", 1_200));
        assert!(!history.netem_seen_on_interface("eth1", 1_200));
        assert!(!history.netem_seen_on_interface("eth2", 1_200));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let history = QdiscHistory::new();
        history.push(0, "QDISC_ADD", netem_attrs("eth0", true));
        for i in 0..CAPACITY {
            history.push(100 + i as i64, "QDISC_ADD", netem_attrs("dummy0", false));
        }

        assert_eq!(history.len(), CAPACITY);
        // The netem entry on eth0 was the oldest and is gone.
        assert!(!history.netem_seen_on_interface("eth0", 200));
    }

    #[test]
    fn test_expired_entries_not_consulted() {
        let history = QdiscHistory::new();
        history.push(0, "QDISC_ADD", netem_attrs("eth0", true));

        assert!(history.netem_seen_on_interface("eth0", MAX_AGE_MS));
        assert!(!history.netem_seen_on_interface("eth0", MAX_AGE_MS + 1));
    }

    #[test]
    fn test_push_evicts_expired() {
        let history = QdiscHistory::new();
        history.push(0, "QDISC_ADD", netem_attrs("eth0", true));
        history.push(1, "QDISC_ADD", netem_attrs("eth1", true));
        assert_eq!(history.len(), 2);

        history.push(MAX_AGE_MS + 2, "QDISC_ADD", netem_attrs("eth2", false));
        assert_eq!(history.len(), 1);
        assert!(!history.is_empty());
    }
}
