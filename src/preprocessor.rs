//! Preprocessor (C2, spec §4.2): normalize every incoming record to one of
//! the two canonical templates and reject anything malformed.

use std::sync::Arc;

use log::trace;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ipfix::{FieldValue, Ie};
use crate::metrics::Metrics;
use crate::pipeline::IngestedRecord;

pub async fn run(
    mut rx: mpsc::Receiver<IngestedRecord>,
    tx: mpsc::Sender<IngestedRecord>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) {
    loop {
        let ingested = tokio::select! {
            _ = cancel.cancelled() => return,
            item = rx.recv() => match item {
                Some(i) => i,
                None => return,
            },
        };

        let Some(mut ingested) = ingested_or_drop(ingested, &metrics) else { continue };
        strip_unknown_elements(&mut ingested.record);

        tokio::select! {
            _ = cancel.cancelled() => return,
            result = tx.send(ingested) => if result.is_err() { return },
        }
    }
}

/// Rule 2 (spec §4.2): exactly one of (sourceIPv4Address, sourceIPv6Address)
/// must be non-zero and the destination address must be of the same family.
fn ingested_or_drop(ingested: IngestedRecord, metrics: &Metrics) -> Option<IngestedRecord> {
    let is_v4 = ingested.record.is_ipv4();
    let is_v6 = ingested.record.is_ipv6();
    if is_v4 == is_v6 {
        metrics.records_dropped.with_label_values(&["ambiguous_address_family"]).inc();
        trace!("Dropping record with ambiguous address family from {}", ingested.exporter_address);
        return None;
    }
    let dest_matches = if is_v4 { ingested.record.contains(Ie::DestinationIPv4Address) } else { ingested.record.contains(Ie::DestinationIPv6Address) };
    if !dest_matches {
        metrics.records_dropped.with_label_values(&["address_family_mismatch"]).inc();
        trace!("Dropping record with source/destination family mismatch from {}", ingested.exporter_address);
        return None;
    }
    Some(ingested)
}

/// Rule 1 (spec §4.2): "extra unknown elements are stripped." Unknown IEs
/// survived C1's lenient decode so they could reach here.
fn strip_unknown_elements(record: &mut crate::ipfix::FlowRecord) {
    let unknowns: Vec<Ie> = record.iter().filter(|(ie, _)| matches!(ie, Ie::Unknown(_))).map(|(ie, _)| *ie).collect();
    for ie in unknowns {
        record.remove(ie);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipfix::element::ElementKey;
    use crate::ipfix::FlowRecord;
    use std::net::Ipv4Addr;
    use std::net::IpAddr;
    use std::time::SystemTime;

    fn sample(is_v4_dest: bool) -> IngestedRecord {
        let mut record = FlowRecord::new();
        record.set(Ie::SourceIPv4Address, FieldValue::Ipv4(Ipv4Addr::new(10, 0, 0, 1)));
        if is_v4_dest {
            record.set(Ie::DestinationIPv4Address, FieldValue::Ipv4(Ipv4Addr::new(10, 0, 0, 2)));
        }
        IngestedRecord { record, exporter_address: IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), observation_domain_id: 1, record_time: SystemTime::now() }
    }

    #[test]
    fn family_mismatch_is_dropped() {
        let metrics = Metrics::new();
        assert!(ingested_or_drop(sample(false), &metrics).is_none());
    }

    #[test]
    fn matching_family_is_kept() {
        let metrics = Metrics::new();
        assert!(ingested_or_drop(sample(true), &metrics).is_some());
    }

    #[test]
    fn unknown_elements_are_stripped() {
        let mut record = FlowRecord::new();
        record.set(Ie::Unknown(ElementKey { enterprise_id: 424242, element_id: 1 }), FieldValue::Bytes(vec![1, 2, 3]));
        strip_unknown_elements(&mut record);
        assert!(!record.contains(Ie::Unknown(ElementKey { enterprise_id: 424242, element_id: 1 })));
    }
}
