//! Aggregation engine (C5, spec §4.5): bidirectional flow correlation with
//! dual active/inactive expiry priority queues.
//!
//! The teacher has no analog for this component (it forwards every record
//! immediately); the shape below — one task owning a `HashMap` plus two
//! `BinaryHeap`s, serializing all mutation of a FlowKey's state in that one
//! task — follows spec §5's explicit ordering guarantee ("operations on a
//! single FlowKey are serialised by being processed in one task") and
//! §9's redesign note ("any redesign that parallelises the aggregator must
//! shard by FlowKey hash to preserve invariant I1").

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::net::IpAddr;
use std::time::{Duration, SystemTime};

use log::debug;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::ipfix::canonical::{COUNTER_FIELDS, CORRELATABLE_FIELDS};
use crate::ipfix::{FieldValue, FlowKey, FlowRecord, Ie, ReportingSide};
use crate::metrics::Metrics;
use crate::pipeline::IngestedRecord;

/// Antrea tcpState strings that force immediate emission regardless of
/// timers (spec §4.5 "a record bearing tcpState in {CLOSED, TIME_WAIT}").
const IMMEDIATE_EMIT_TCP_STATES: &[&str] = &["CLOSED", "TIME_WAIT"];

pub struct AggregatedRecord {
    pub fields: FlowRecord,
    pub flow_key: FlowKey,
    pub source_filled: bool,
    pub destination_filled: bool,
    pub ready_to_send: bool,
    pub first_seen: SystemTime,
    pub last_seen: SystemTime,
    pub last_export_time: SystemTime,
    pub last_export_octets: u64,
    pub last_export_reverse_octets: u64,
    pub exporter_address: IpAddr,
    pub observation_domain_id: u32,
    active_generation: u64,
    inactive_generation: u64,
    force_emit: bool,
}

/// Finalized record handed to C4/C6, with the per-interval throughput
/// computed at export time (spec §4.5 "Expiry").
pub struct ExportableRecord {
    pub fields: FlowRecord,
    pub record_time: SystemTime,
    pub exporter_address: IpAddr,
    pub observation_domain_id: u32,
    pub is_final: bool,
}

pub struct AggregationEngine {
    entries: HashMap<FlowKey, AggregatedRecord>,
    active_queue: BinaryHeap<Reverse<(Instant, FlowKey, u64)>>,
    inactive_queue: BinaryHeap<Reverse<(Instant, FlowKey, u64)>>,
    active_timeout: Duration,
    inactive_timeout: Duration,
}

impl AggregationEngine {
    pub fn new(active_timeout: Duration, inactive_timeout: Duration) -> Self {
        AggregationEngine {
            entries: HashMap::new(),
            active_queue: BinaryHeap::new(),
            inactive_queue: BinaryHeap::new(),
            active_timeout,
            inactive_timeout,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Ingests one C2-normalized record (spec §4.5 "Correlation").
    pub fn ingest(&mut self, record: FlowRecord, exporter_address: IpAddr, observation_domain_id: u32, record_time: SystemTime) {
        let Some(flow_key) = record.flow_key() else { return };
        let side = record.reporting_side();
        let now = Instant::now();

        if let Some(entry) = self.entries.get_mut(&flow_key) {
            merge_report(entry, &record, side);
            entry.last_seen = record_time;
            entry.inactive_generation += 1;
            self.inactive_queue.push(Reverse((now + self.inactive_timeout, flow_key.clone(), entry.inactive_generation)));
            if tcp_state_forces_emit(&record) {
                entry.force_emit = true;
            }
        } else {
            let mut entry = AggregatedRecord {
                fields: record.clone(),
                flow_key: flow_key.clone(),
                source_filled: matches!(side, ReportingSide::Source | ReportingSide::Both),
                destination_filled: matches!(side, ReportingSide::Destination | ReportingSide::Both),
                ready_to_send: false,
                first_seen: record_time,
                last_seen: record_time,
                last_export_time: record_time,
                last_export_octets: 0,
                last_export_reverse_octets: 0,
                exporter_address,
                observation_domain_id,
                active_generation: 1,
                inactive_generation: 1,
                force_emit: tcp_state_forces_emit(&record),
            };
            entry.ready_to_send = true;
            self.active_queue.push(Reverse((now + self.active_timeout, flow_key.clone(), entry.active_generation)));
            self.inactive_queue.push(Reverse((now + self.inactive_timeout, flow_key.clone(), entry.inactive_generation)));
            self.entries.insert(flow_key, entry);
        }
    }

    /// Pops every entry whose active or inactive timer has elapsed,
    /// producing export records and re-enqueuing survivors (spec §4.5
    /// "Expiry"). Intended to be called on a periodic tick.
    pub fn expire(&mut self, now_instant: Instant, now_wall: SystemTime, metrics: &Metrics) -> Vec<ExportableRecord> {
        let mut out = Vec::new();

        while let Some(Reverse((deadline, _, _))) = self.inactive_queue.peek() {
            if *deadline > now_instant {
                break;
            }
            let Reverse((_, key, gen)) = self.inactive_queue.pop().unwrap();
            let Some(entry) = self.entries.get(&key) else { continue };
            if entry.inactive_generation != gen {
                continue;
            }
            let entry = self.entries.remove(&key).unwrap();
            out.push(finalize(entry, now_wall, true));
        }

        while let Some(Reverse((deadline, _, _))) = self.active_queue.peek() {
            if *deadline > now_instant {
                break;
            }
            let Reverse((_, key, gen)) = self.active_queue.pop().unwrap();
            let Some(entry) = self.entries.get_mut(&key) else { continue };
            if entry.active_generation != gen {
                continue;
            }
            if entry.force_emit {
                let entry = self.entries.remove(&key).unwrap();
                out.push(finalize(entry, now_wall, true));
                continue;
            }
            let exportable = export_tick(entry, now_wall);
            entry.active_generation += 1;
            self.active_queue.push(Reverse((now_instant + self.active_timeout, key, entry.active_generation)));
            out.push(exportable);
        }

        metrics.flows.set(self.entries.len() as i64);
        out
    }
}

fn tcp_state_forces_emit(record: &FlowRecord) -> bool {
    let state = record.get_string(Ie::TcpState);
    IMMEDIATE_EMIT_TCP_STATES.contains(&state.as_str())
}

/// Merge rule (spec §4.5): correlatable fields fill only if currently empty
/// ("the side filled second does not overwrite already-filled fields");
/// counters merge by max, except a genuine decrease resets the counter,
/// treated as conntrack re-creation (DESIGN.md Open Question 1).
fn merge_report(entry: &mut AggregatedRecord, incoming: &FlowRecord, side: ReportingSide) {
    for &ie in CORRELATABLE_FIELDS {
        if let Some(value) = incoming.get(ie) {
            if !entry.fields.is_populated(ie) && !value.is_empty_ish() {
                entry.fields.set(ie, value.clone());
            }
        }
    }

    for &ie in COUNTER_FIELDS {
        let incoming_value = incoming.get_u64(ie);
        let current_value = entry.fields.get_u64(ie);
        let merged = if incoming_value < current_value {
            debug!("counter_reset: {:?} on {:?} went from {} to {}, treating as conntrack re-creation", ie, entry.flow_key, current_value, incoming_value);
            incoming_value
        } else {
            incoming_value.max(current_value)
        };
        entry.fields.set(ie, FieldValue::U64(merged));
    }

    match side {
        ReportingSide::Source => entry.source_filled = true,
        ReportingSide::Destination => entry.destination_filled = true,
        ReportingSide::Both => {
            entry.source_filled = true;
            entry.destination_filled = true;
        }
    }
}

fn throughput_bits_per_sec(delta_octets: u64, elapsed: Duration) -> u64 {
    if elapsed.is_zero() {
        return 0;
    }
    ((delta_octets as f64 * 8.0) / elapsed.as_secs_f64()) as u64
}

fn export_tick(entry: &mut AggregatedRecord, now_wall: SystemTime) -> ExportableRecord {
    let elapsed = now_wall.duration_since(entry.last_export_time).unwrap_or(Duration::ZERO);
    let octets = entry.fields.get_u64(Ie::OctetDeltaCount);
    let reverse_octets = entry.fields.get_u64(Ie::ReverseOctetDeltaCount);
    let delta_forward = octets.saturating_sub(entry.last_export_octets);
    let delta_reverse = reverse_octets.saturating_sub(entry.last_export_reverse_octets);

    let throughput = throughput_bits_per_sec(delta_forward, elapsed);
    let reverse_throughput = throughput_bits_per_sec(delta_reverse, elapsed);

    entry.fields.set(Ie::Throughput, FieldValue::U64(throughput));
    entry.fields.set(Ie::ReverseThroughput, FieldValue::U64(reverse_throughput));
    entry.fields.set(Ie::SourceThroughput, FieldValue::U64(throughput));
    entry.fields.set(Ie::DestinationThroughput, FieldValue::U64(reverse_throughput));

    entry.last_export_time = now_wall;
    entry.last_export_octets = octets;
    entry.last_export_reverse_octets = reverse_octets;

    ExportableRecord {
        fields: entry.fields.clone(),
        record_time: entry.last_seen,
        exporter_address: entry.exporter_address,
        observation_domain_id: entry.observation_domain_id,
        is_final: false,
    }
}

fn finalize(mut entry: AggregatedRecord, now_wall: SystemTime, is_final: bool) -> ExportableRecord {
    let exportable = export_tick(&mut entry, now_wall);
    ExportableRecord { is_final, ..exportable }
}

const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Drives the engine: reads normalized records from C2, periodically
/// expires entries, and forwards exportable records downstream to C4+C6.
pub async fn run(
    mut rx: mpsc::Receiver<IngestedRecord>,
    tx: mpsc::Sender<ExportableRecord>,
    active_timeout: Duration,
    inactive_timeout: Duration,
    metrics: std::sync::Arc<Metrics>,
    cancel: CancellationToken,
) {
    let mut engine = AggregationEngine::new(active_timeout, inactive_timeout);
    let mut ticker = tokio::time::interval(TICK_INTERVAL);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                for exportable in engine.expire(Instant::now(), SystemTime::now(), &metrics) {
                    if tx.send(exportable).await.is_err() {
                        return;
                    }
                }
            }
            item = rx.recv() => {
                match item {
                    Some(ingested) => engine.ingest(ingested.record, ingested.exporter_address, ingested.observation_domain_id, ingested.record_time),
                    None => break,
                }
            }
        }
    }

    for exportable in engine.expire(Instant::now() + active_timeout + inactive_timeout, SystemTime::now(), &metrics) {
        let _ = tx.send(exportable).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn record(src_known: bool, dst_known: bool) -> FlowRecord {
        let mut r = FlowRecord::new();
        r.set(Ie::SourceIPv4Address, FieldValue::Ipv4(Ipv4Addr::new(10, 0, 0, 1)));
        r.set(Ie::DestinationIPv4Address, FieldValue::Ipv4(Ipv4Addr::new(10, 0, 0, 2)));
        r.set(Ie::SourceTransportPort, FieldValue::U16(1111));
        r.set(Ie::DestinationTransportPort, FieldValue::U16(80));
        r.set(Ie::ProtocolIdentifier, FieldValue::U8(6));
        r.set(Ie::OctetDeltaCount, FieldValue::U64(100));
        if src_known {
            r.set(Ie::SourcePodName, FieldValue::String("client".into()));
        }
        if dst_known {
            r.set(Ie::DestinationPodName, FieldValue::String("server".into()));
        }
        r
    }

    #[test]
    fn single_report_creates_one_entry() {
        let mut engine = AggregationEngine::new(Duration::from_secs(60), Duration::from_secs(90));
        engine.ingest(record(true, false), "1.1.1.1".parse().unwrap(), 1, SystemTime::now());
        assert_eq!(engine.len(), 1);
    }

    #[test]
    fn two_sided_reports_correlate_into_single_entry() {
        let mut engine = AggregationEngine::new(Duration::from_secs(60), Duration::from_secs(90));
        engine.ingest(record(true, false), "1.1.1.1".parse().unwrap(), 1, SystemTime::now());
        engine.ingest(record(false, true), "2.2.2.2".parse().unwrap(), 1, SystemTime::now());
        assert_eq!(engine.len(), 1);
        let key = record(true, false).flow_key().unwrap();
        let entry = engine.entries.get(&key).unwrap();
        assert!(entry.source_filled);
        assert!(entry.destination_filled);
        assert_eq!(entry.fields.get_string(Ie::SourcePodName), "client");
        assert_eq!(entry.fields.get_string(Ie::DestinationPodName), "server");
    }

    #[test]
    fn decreasing_counter_resets_rather_than_sticking() {
        let mut entry = AggregatedRecord {
            fields: record(true, false),
            flow_key: record(true, false).flow_key().unwrap(),
            source_filled: true,
            destination_filled: false,
            ready_to_send: true,
            first_seen: SystemTime::now(),
            last_seen: SystemTime::now(),
            last_export_time: SystemTime::now(),
            last_export_octets: 0,
            last_export_reverse_octets: 0,
            exporter_address: "1.1.1.1".parse().unwrap(),
            observation_domain_id: 1,
            active_generation: 1,
            inactive_generation: 1,
            force_emit: false,
        };
        let mut incoming = record(true, false);
        incoming.set(Ie::OctetDeltaCount, FieldValue::U64(10));
        merge_report(&mut entry, &incoming, ReportingSide::Source);
        assert_eq!(entry.fields.get_u64(Ie::OctetDeltaCount), 10);
    }

    #[test]
    fn tcp_closed_state_forces_emit() {
        let mut r = record(true, true);
        r.set(Ie::TcpState, FieldValue::String("CLOSED".into()));
        assert!(tcp_state_forces_emit(&r));
    }
}
