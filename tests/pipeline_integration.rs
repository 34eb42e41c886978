//! Drives the real C2 -> C5 task pipeline over tokio channels, rather than
//! calling `AggregationEngine` methods directly, so a regression in the
//! channel wiring (not just the merge logic) would show up here.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use flow_aggregator::aggregation;
use flow_aggregator::ipfix::{FieldValue, FlowRecord, Ie};
use flow_aggregator::metrics::Metrics;
use flow_aggregator::pipeline::IngestedRecord;
use flow_aggregator::preprocessor;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn one_sided_flow(src_known: bool, dst_known: bool) -> IngestedRecord {
    let mut record = FlowRecord::new();
    record.set(Ie::SourceIPv4Address, FieldValue::Ipv4(Ipv4Addr::new(10, 0, 1, 1)));
    record.set(Ie::DestinationIPv4Address, FieldValue::Ipv4(Ipv4Addr::new(10, 0, 2, 1)));
    record.set(Ie::SourceTransportPort, FieldValue::U16(33445));
    record.set(Ie::DestinationTransportPort, FieldValue::U16(443));
    record.set(Ie::ProtocolIdentifier, FieldValue::U8(6));
    record.set(Ie::OctetDeltaCount, FieldValue::U64(2048));
    if src_known {
        record.set(Ie::SourcePodName, FieldValue::String("client-abc".into()));
    }
    if dst_known {
        record.set(Ie::DestinationPodName, FieldValue::String("server-xyz".into()));
    }
    IngestedRecord { record, exporter_address: IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), observation_domain_id: 1, record_time: SystemTime::now() }
}

/// Scenario: two agents on different nodes each report one side of the same
/// flow. Fed through a live preprocessor task into a live aggregation task,
/// the two reports should correlate into a single exported record carrying
/// both pod names.
#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn inter_node_flow_correlates_through_live_tasks() {
    let cancel = CancellationToken::new();
    let metrics = Arc::new(Metrics::new());

    let (raw_tx, raw_rx) = mpsc::channel::<IngestedRecord>(16);
    let (normalized_tx, normalized_rx) = mpsc::channel::<IngestedRecord>(16);
    let (export_tx, mut export_rx) = mpsc::channel::<aggregation::ExportableRecord>(16);

    let preproc = tokio::spawn(preprocessor::run(raw_rx, normalized_tx, metrics.clone(), cancel.clone()));
    let agg = tokio::spawn(aggregation::run(normalized_rx, export_tx, Duration::from_millis(50), Duration::from_millis(50), metrics, cancel.clone()));

    raw_tx.send(one_sided_flow(true, false)).await.unwrap();
    raw_tx.send(one_sided_flow(false, true)).await.unwrap();

    let exported = tokio::time::timeout(Duration::from_secs(2), export_rx.recv()).await.expect("export arrived before timeout").expect("channel open");

    assert_eq!(exported.fields.get_string(Ie::SourcePodName), "client-abc");
    assert_eq!(exported.fields.get_string(Ie::DestinationPodName), "server-xyz");
    assert!(exported.is_final);

    cancel.cancel();
    drop(raw_tx);
    let _ = preproc.await;
    let _ = agg.await;
}

/// Records with ambiguous address families never reach the aggregator, so a
/// flow with only one reporting side stays unexported until its active
/// timeout forces emission.
#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn single_sided_flow_emits_after_active_timeout() {
    let cancel = CancellationToken::new();
    let metrics = Arc::new(Metrics::new());

    let (raw_tx, raw_rx) = mpsc::channel::<IngestedRecord>(16);
    let (normalized_tx, normalized_rx) = mpsc::channel::<IngestedRecord>(16);
    let (export_tx, mut export_rx) = mpsc::channel::<aggregation::ExportableRecord>(16);

    let preproc = tokio::spawn(preprocessor::run(raw_rx, normalized_tx, metrics.clone(), cancel.clone()));
    let agg = tokio::spawn(aggregation::run(normalized_rx, export_tx, Duration::from_millis(50), Duration::from_secs(3600), metrics, cancel.clone()));

    raw_tx.send(one_sided_flow(true, false)).await.unwrap();

    let exported = tokio::time::timeout(Duration::from_secs(2), export_rx.recv()).await.expect("export arrived before timeout").expect("channel open");
    assert_eq!(exported.fields.get_string(Ie::SourcePodName), "client-abc");
    assert_eq!(exported.fields.get_string(Ie::DestinationPodName), "");

    cancel.cancel();
    drop(raw_tx);
    let _ = preproc.await;
    let _ = agg.await;
}
