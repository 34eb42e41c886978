//! Enricher (C4, spec §4.4): fills K8s names/namespaces/nodes, pod-labels
//! JSON, cluster identifier, original-exporter address, and flow direction.

use std::net::IpAddr;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ipfix::{FieldValue, FlowRecord, Ie};
use crate::podstore::PodStore;

const POD_SYNC_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowType {
    IntraNode,
    InterNode,
    ToExternal,
    FromExternal,
}

pub struct EnricherOptions {
    pub include_pod_labels: bool,
    pub cluster_id: String,
}

/// Runs C4 inline on the item it's given; used both by proxy mode (called
/// directly per record) and by the aggregation engine (called once per
/// finalized aggregated record before export).
pub fn enrich(
    record: &mut FlowRecord,
    record_time: std::time::SystemTime,
    exporter_address: IpAddr,
    original_observation_domain_id: u32,
    flow_type: FlowType,
    pod_store: &PodStore,
    options: &EnricherOptions,
) {
    let src_ip = record.source_address();
    let dst_ip = record.destination_address();

    let src_pod = src_ip.and_then(|ip| pod_store.get_pod_by_ip_and_time(ip, record_time));
    let dst_pod = dst_ip.and_then(|ip| pod_store.get_pod_by_ip_and_time(ip, record_time));

    if let Some(pod) = &src_pod {
        set_if_empty(record, Ie::SourcePodName, FieldValue::String(pod.pod_name.clone()));
        set_if_empty(record, Ie::SourcePodNamespace, FieldValue::String(pod.pod_namespace.clone()));
        set_if_empty(record, Ie::SourceNodeName, FieldValue::String(pod.node_name.clone()));
    }
    if let Some(pod) = &dst_pod {
        set_if_empty(record, Ie::DestinationPodName, FieldValue::String(pod.pod_name.clone()));
        set_if_empty(record, Ie::DestinationPodNamespace, FieldValue::String(pod.pod_namespace.clone()));
        set_if_empty(record, Ie::DestinationNodeName, FieldValue::String(pod.node_name.clone()));
    }

    record.set(Ie::SourcePodLabels, FieldValue::String(pod_labels_json(options.include_pod_labels, src_pod.as_ref())));
    record.set(Ie::DestinationPodLabels, FieldValue::String(pod_labels_json(options.include_pod_labels, dst_pod.as_ref())));

    record.set(Ie::ClusterId, FieldValue::String(options.cluster_id.clone()));
    record.set(Ie::OriginalObservationDomainId, FieldValue::U32(original_observation_domain_id));
    set_original_exporter(record, exporter_address);

    let source_known = src_pod.is_some() || record.is_populated(Ie::SourcePodName);
    let destination_known = dst_pod.is_some() || record.is_populated(Ie::DestinationPodName);
    record.set(Ie::FlowDirection, FieldValue::U8(flow_direction(flow_type, source_known, destination_known)));
}

fn set_if_empty(record: &mut FlowRecord, ie: Ie, value: FieldValue) {
    if !record.is_populated(ie) {
        record.set(ie, value);
    }
}

fn pod_labels_json(include: bool, pod: Option<&crate::podstore::PodSnapshotEntry>) -> String {
    if !include {
        return String::new();
    }
    match pod {
        Some(pod) => serde_json::to_string(&pod.labels).unwrap_or_else(|_| "{}".to_string()),
        None => "{}".to_string(),
    }
}

fn set_original_exporter(record: &mut FlowRecord, exporter_address: IpAddr) {
    match exporter_address {
        IpAddr::V4(addr) => {
            record.set(Ie::OriginalExporterIPv4Address, FieldValue::Ipv4(addr));
            record.set(Ie::OriginalExporterIPv6Address, FieldValue::Ipv6(std::net::Ipv6Addr::UNSPECIFIED));
        }
        IpAddr::V6(addr) => {
            record.set(Ie::OriginalExporterIPv6Address, FieldValue::Ipv6(addr));
            record.set(Ie::OriginalExporterIPv4Address, FieldValue::Ipv4(std::net::Ipv4Addr::UNSPECIFIED));
        }
    }
}

/// Decodes the Antrea `flowType` IE into the enum `flow_direction` switches
/// on. Unrecognized values fall back to `IntraNode`, the safest (most
/// conservative) choice since it always yields `DIRECTION_UNKNOWN`.
pub fn flow_type_from_record(record: &FlowRecord) -> FlowType {
    match record.get_u8(Ie::FlowType) {
        1 => FlowType::InterNode,
        2 => FlowType::ToExternal,
        3 => FlowType::FromExternal,
        _ => FlowType::IntraNode,
    }
}

/// Spec §4.4 step 5.
pub const DIRECTION_INGRESS: u8 = 0x00;
pub const DIRECTION_EGRESS: u8 = 0x01;
pub const DIRECTION_UNKNOWN: u8 = 0xff;

fn flow_direction(flow_type: FlowType, source_known: bool, destination_known: bool) -> u8 {
    match flow_type {
        FlowType::InterNode if source_known && !destination_known => DIRECTION_EGRESS,
        FlowType::InterNode if destination_known && !source_known => DIRECTION_INGRESS,
        FlowType::ToExternal if source_known => DIRECTION_EGRESS,
        FlowType::FromExternal if destination_known => DIRECTION_INGRESS,
        _ => DIRECTION_UNKNOWN,
    }
}

/// Blocks until the pod store reports synced, up to `POD_SYNC_WAIT`, then
/// proceeds regardless (spec §4.3 "a bounded wait... after which it
/// proceeds anyway with best-effort lookups").
pub async fn wait_for_pod_sync(pod_store: &PodStore, cancel: &CancellationToken) {
    let deadline = tokio::time::Instant::now() + POD_SYNC_WAIT;
    while !pod_store.has_synced() && tokio::time::Instant::now() < deadline {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }
}

pub fn options_from(record_contents_pod_labels: bool, cluster_id: String) -> EnricherOptions {
    EnricherOptions { include_pod_labels: record_contents_pod_labels, cluster_id }
}

/// Drives C4 between C2 and C5 in aggregate mode: enriches each normalized
/// record in place, then forwards it unchanged in shape so C5's merge rules
/// see already-resolved pod names (spec §4.4 step 1, §4.5 "Correlation").
pub async fn run(
    mut rx: mpsc::Receiver<crate::pipeline::IngestedRecord>,
    tx: mpsc::Sender<crate::pipeline::IngestedRecord>,
    pod_store: std::sync::Arc<PodStore>,
    options: EnricherOptions,
    cancel: CancellationToken,
) {
    loop {
        let mut ingested = tokio::select! {
            _ = cancel.cancelled() => return,
            item = rx.recv() => match item {
                Some(i) => i,
                None => return,
            },
        };

        let flow_type = flow_type_from_record(&ingested.record);
        enrich(&mut ingested.record, ingested.record_time, ingested.exporter_address, ingested.observation_domain_id, flow_type, &pod_store, &options);

        tokio::select! {
            _ = cancel.cancelled() => return,
            result = tx.send(ingested) => if result.is_err() { return },
        }
    }
}

/// Drives C4 directly into C6 in proxy mode: "per-record enrichment with no
/// buffering" (spec §9) — every record is enriched and exported immediately,
/// always `is_final`.
pub async fn run_proxy(
    mut rx: mpsc::Receiver<crate::pipeline::IngestedRecord>,
    tx: mpsc::Sender<crate::aggregation::ExportableRecord>,
    pod_store: std::sync::Arc<PodStore>,
    options: EnricherOptions,
    cancel: CancellationToken,
) {
    loop {
        let mut ingested = tokio::select! {
            _ = cancel.cancelled() => return,
            item = rx.recv() => match item {
                Some(i) => i,
                None => return,
            },
        };

        let flow_type = flow_type_from_record(&ingested.record);
        enrich(&mut ingested.record, ingested.record_time, ingested.exporter_address, ingested.observation_domain_id, flow_type, &pod_store, &options);

        let exportable = crate::aggregation::ExportableRecord {
            fields: ingested.record,
            record_time: ingested.record_time,
            exporter_address: ingested.exporter_address,
            observation_domain_id: ingested.observation_domain_id,
            is_final: true,
        };

        tokio::select! {
            _ = cancel.cancelled() => return,
            result = tx.send(exportable) => if result.is_err() { return },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inter_node_source_known_is_egress() {
        assert_eq!(flow_direction(FlowType::InterNode, true, false), DIRECTION_EGRESS);
    }

    #[test]
    fn inter_node_destination_known_is_ingress() {
        assert_eq!(flow_direction(FlowType::InterNode, false, true), DIRECTION_INGRESS);
    }

    #[test]
    fn intra_node_is_unknown_direction() {
        assert_eq!(flow_direction(FlowType::IntraNode, true, true), DIRECTION_UNKNOWN);
    }

    #[test]
    fn pod_labels_disabled_yields_empty_string() {
        assert_eq!(pod_labels_json(false, None), "");
    }
}
