//! Scenario 6 (pod churn): a pod's IP is reused by a later pod, and a flow
//! timestamped inside the first pod's lifetime must still resolve to it even
//! after the first pod has been deleted (end-time set, not removed).

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, SystemTime};

use flow_aggregator::enrich::{self, EnricherOptions};
use flow_aggregator::ipfix::{FieldValue, FlowRecord, Ie};
use flow_aggregator::podstore::{PodSnapshotEntry, PodStore};

fn pod(ip: IpAddr, name: &str, start: SystemTime) -> PodSnapshotEntry {
    PodSnapshotEntry { ip, pod_name: name.to_string(), pod_namespace: "default".to_string(), node_name: "node-a".to_string(), labels: BTreeMap::new(), start_time: start, end_time: None }
}

fn flow_between(src: IpAddr, dst: IpAddr) -> FlowRecord {
    let mut record = FlowRecord::new();
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            record.set(Ie::SourceIPv4Address, FieldValue::Ipv4(s));
            record.set(Ie::DestinationIPv4Address, FieldValue::Ipv4(d));
        }
        _ => unreachable!("test only uses v4 addresses"),
    }
    record.set(Ie::SourceTransportPort, FieldValue::U16(4000));
    record.set(Ie::DestinationTransportPort, FieldValue::U16(8080));
    record.set(Ie::ProtocolIdentifier, FieldValue::U8(6));
    record
}

#[test]
fn reused_ip_resolves_to_the_pod_live_at_record_time() {
    let store = PodStore::new(Duration::from_secs(5));
    let ip: IpAddr = "10.1.1.9".parse().unwrap();
    let origin: IpAddr = "10.1.1.1".parse().unwrap();

    let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
    let t1 = SystemTime::UNIX_EPOCH + Duration::from_secs(2_000);
    let t2 = SystemTime::UNIX_EPOCH + Duration::from_secs(3_000);

    store.upsert(pod(ip, "pod-one", t0));

    // A flow seen while pod-one is still alive enriches as pod-one.
    let mut record = flow_between(origin, ip);
    let options = EnricherOptions { include_pod_labels: false, cluster_id: "test-cluster".to_string() };
    enrich::enrich(&mut record, t1, origin, 1, enrich::flow_type_from_record(&record), &store, &options);
    assert_eq!(record.get_string(Ie::DestinationPodName), "pod-one");

    // pod-one is deleted and its IP reassigned to pod-two.
    store.close(ip, "pod-one", "default", t1);
    store.upsert(pod(ip, "pod-two", t1));

    // A fresh flow, timestamped after the reassignment, resolves to pod-two.
    let mut fresh_record = flow_between(origin, ip);
    enrich::enrich(&mut fresh_record, t2, origin, 1, enrich::flow_type_from_record(&fresh_record), &store, &options);
    assert_eq!(fresh_record.get_string(Ie::DestinationPodName), "pod-two");

    // A late-arriving record still timestamped during pod-one's lifetime
    // keeps resolving to pod-one even though it has since been closed.
    let mut late_record = flow_between(origin, ip);
    enrich::enrich(&mut late_record, t0 + Duration::from_secs(1), origin, 1, enrich::flow_type_from_record(&late_record), &store, &options);
    assert_eq!(late_record.get_string(Ie::DestinationPodName), "pod-one");
}

#[test]
fn sweep_removes_entries_past_the_gc_threshold_but_not_before() {
    let store = PodStore::new(Duration::from_secs(1));
    let ip: IpAddr = "10.2.2.2".parse().unwrap();
    let start = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
    let end = SystemTime::UNIX_EPOCH + Duration::from_secs(200);

    store.upsert(pod(ip, "pod-gone", start));
    store.close(ip, "pod-gone", "default", end);

    let gc_threshold = Duration::from_secs(300);
    store.sweep(end + Duration::from_secs(100), gc_threshold);
    assert!(store.get_pod_by_ip_and_time(ip, start + Duration::from_secs(10)).is_some());

    store.sweep(end + Duration::from_secs(400), gc_threshold);
    assert!(store.get_pod_by_ip_and_time(ip, start + Duration::from_secs(10)).is_none());
}
