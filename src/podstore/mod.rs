//! Pod metadata store (C3, spec §4.3): a time-indexed (IP → pod) mapping
//! populated from Kubernetes pod events and queried by C4.

pub mod watcher;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use arc_swap::ArcSwap;

#[derive(Debug, Clone)]
pub struct PodSnapshotEntry {
    pub ip: IpAddr,
    pub pod_name: String,
    pub pod_namespace: String,
    pub node_name: String,
    pub labels: BTreeMap<String, String>,
    pub start_time: SystemTime,
    pub end_time: Option<SystemTime>,
}

impl PodSnapshotEntry {
    fn contains(&self, t: SystemTime, clock_skew_margin: std::time::Duration) -> bool {
        let accepted_start = self.start_time.checked_sub(clock_skew_margin).unwrap_or(self.start_time);
        if t < accepted_start {
            return false;
        }
        match self.end_time {
            Some(end) => t <= end,
            None => true,
        }
    }
}

#[derive(Default)]
struct PodIndex {
    by_ip: HashMap<IpAddr, Vec<PodSnapshotEntry>>,
}

/// Time-aware pod metadata store (spec §4.3). Single writer (the watcher
/// task), concurrent readers via `ArcSwap` (spec §5 "a read-mostly lock
/// protects the IP index"), grounded in `spark2026`'s use of `arc-swap` for
/// its own hot-swappable routing table.
pub struct PodStore {
    index: ArcSwap<PodIndex>,
    synced: AtomicBool,
    clock_skew_margin: std::time::Duration,
}

impl PodStore {
    pub fn new(clock_skew_margin: std::time::Duration) -> Self {
        PodStore { index: ArcSwap::from_pointee(PodIndex::default()), synced: AtomicBool::new(false), clock_skew_margin }
    }

    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Called by the watcher task once the initial pod listing has been
    /// fully applied (spec §4.3 "exposes HasSynced()").
    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::Release);
    }

    /// Latest entry whose validity interval contains `t`; on IP reuse, the
    /// most recently started entry containing `t` wins (spec §3, §4.3).
    pub fn get_pod_by_ip_and_time(&self, ip: IpAddr, t: SystemTime) -> Option<PodSnapshotEntry> {
        let index = self.index.load();
        index.by_ip.get(&ip)?.iter().find(|e| e.contains(t, self.clock_skew_margin)).cloned()
    }

    fn mutate(&self, f: impl FnOnce(&mut PodIndex)) {
        let mut next = (**self.index.load()).clone_shallow();
        f(&mut next);
        self.index.store(Arc::new(next));
    }

    /// Records a pod add/update (spec §4.3). Entries for an IP are kept
    /// sorted by startTime descending so IP-reuse lookups see the most
    /// recent match first.
    pub fn upsert(&self, entry: PodSnapshotEntry) {
        self.mutate(|idx| {
            let list = idx.by_ip.entry(entry.ip).or_default();
            list.retain(|e| e.pod_name != entry.pod_name || e.pod_namespace != entry.pod_namespace);
            list.push(entry);
            list.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        });
    }

    /// Records a pod delete: sets endTime on the matching entry rather than
    /// removing it, so in-flight lookups for records timestamped before the
    /// delete still resolve (spec §4.3, §8 scenario 6 "pod churn").
    pub fn close(&self, ip: IpAddr, pod_name: &str, pod_namespace: &str, end_time: SystemTime) {
        self.mutate(|idx| {
            if let Some(list) = idx.by_ip.get_mut(&ip) {
                for e in list.iter_mut() {
                    if e.pod_name == pod_name && e.pod_namespace == pod_namespace && e.end_time.is_none() {
                        e.end_time = Some(end_time);
                    }
                }
            }
        });
    }

    /// Removes closed entries older than `gc_threshold` past their endTime
    /// (spec §3 "garbage-collected after max(active, inactive) + safety
    /// margin past endTime").
    pub fn sweep(&self, now: SystemTime, gc_threshold: std::time::Duration) {
        self.mutate(|idx| {
            idx.by_ip.retain(|_, list| {
                list.retain(|e| match e.end_time {
                    Some(end) => now.duration_since(end).map(|age| age < gc_threshold).unwrap_or(true),
                    None => true,
                });
                !list.is_empty()
            });
        });
    }
}

impl PodIndex {
    fn clone_shallow(&self) -> Self {
        PodIndex { by_ip: self.by_ip.clone() }
    }
}

impl Clone for PodIndex {
    fn clone(&self) -> Self {
        self.clone_shallow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(ip: IpAddr, start_secs: u64, end_secs: Option<u64>) -> PodSnapshotEntry {
        PodSnapshotEntry {
            ip,
            pod_name: "p".into(),
            pod_namespace: "ns".into(),
            node_name: "node".into(),
            labels: BTreeMap::new(),
            start_time: std::time::UNIX_EPOCH + Duration::from_secs(start_secs),
            end_time: end_secs.map(|s| std::time::UNIX_EPOCH + Duration::from_secs(s)),
        }
    }

    #[test]
    fn ip_reuse_picks_most_recent_containing_entry() {
        let store = PodStore::new(Duration::from_secs(1));
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        store.mutate(|idx| {
            idx.by_ip.insert(ip, vec![entry(ip, 200, None), entry(ip, 100, Some(150))]);
        });
        let at_120 = std::time::UNIX_EPOCH + Duration::from_secs(120);
        let found = store.get_pod_by_ip_and_time(ip, at_120).unwrap();
        assert_eq!(found.start_time, std::time::UNIX_EPOCH + Duration::from_secs(100));
    }

    #[test]
    fn unsynced_store_reports_not_synced() {
        let store = PodStore::new(Duration::from_secs(1));
        assert!(!store.has_synced());
        store.mark_synced();
        assert!(store.has_synced());
    }
}
