//! Internal gRPC ingest (spec §4.1 "an internal gRPC ingest... runs
//! unconditionally as a second C1-shaped task", §6 "Internal RPC"). Node-local
//! agents that cannot speak raw IPFIX stream flows here instead; every flow
//! is converted into the same `IngestedRecord` the UDP/TCP/TLS path produces
//! and pushed onto the same bounded channel, so it sees the same
//! backpressure and C2 processing.

pub mod proto {
    tonic::include_proto!("flowaggregator");
}

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::warn;
use tonic::transport::{Identity, Server, ServerTlsConfig};
use tonic::{Request, Response, Status, Streaming};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ipfix::{FieldValue, FlowRecord, Ie};
use crate::metrics::Metrics;
use crate::pipeline::IngestedRecord;
use proto::flow_export_server::{FlowExport, FlowExportServer};
use proto::{ExportRequest, ExportResponse, Flow};

pub const GRPC_PORT: u16 = 14739;

pub struct FlowExportService {
    tx: mpsc::Sender<IngestedRecord>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
}

impl FlowExportService {
    pub fn new(tx: mpsc::Sender<IngestedRecord>, metrics: Arc<Metrics>, cancel: CancellationToken) -> Self {
        FlowExportService { tx, metrics, cancel }
    }
}

#[tonic::async_trait]
impl FlowExport for FlowExportService {
    async fn export(&self, request: Request<Streaming<ExportRequest>>) -> Result<Response<ExportResponse>, Status> {
        let peer: IpAddr = request
            .remote_addr()
            .map(|a| a.ip())
            .unwrap_or(IpAddr::from([0, 0, 0, 0]));
        let mut stream = request.into_inner();
        let mut accepted: u64 = 0;
        let mut rejected: u64 = 0;

        while let Some(batch) = stream.message().await.map_err(|e| Status::invalid_argument(e.to_string()))? {
            for flow in batch.flows {
                self.metrics.records_received.inc();
                let record_time = flow_record_time(&flow);
                let exporter_address = if flow.exporter_address.is_empty() {
                    peer
                } else {
                    flow.exporter_address.parse().unwrap_or(peer)
                };
                let observation_domain_id = flow.observation_domain_id;
                let record = match flow_to_record(flow) {
                    Some(r) => r,
                    None => {
                        rejected += 1;
                        self.metrics.records_dropped.with_label_values(&["malformed"]).inc();
                        continue;
                    }
                };

                let ingested = IngestedRecord { record, exporter_address, observation_domain_id, record_time };
                // Same intentional backpressure as the UDP/TCP/TLS path (spec §4.1).
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(Status::unavailable("aggregator is shutting down")),
                    send_result = self.tx.send(ingested) => {
                        match send_result {
                            Ok(_) => accepted += 1,
                            Err(_) => return Err(Status::unavailable("ingest channel closed")),
                        }
                    }
                }
            }
        }

        Ok(Response::new(ExportResponse { accepted, rejected }))
    }
}

fn flow_record_time(flow: &Flow) -> SystemTime {
    let seconds = if flow.flow_end_seconds > 0 { flow.flow_end_seconds } else { flow.flow_start_seconds };
    UNIX_EPOCH + Duration::from_secs(u64::from(seconds))
}

/// `tcpState` is a String-kind IE (wire records carry the label already); the
/// gRPC `Flow.tcp_state` field carries the raw conntrack state number
/// instead, so it needs mapping to the same labels the aggregation engine's
/// CLOSED/TIME_WAIT immediate-emit check compares against.
fn tcp_state_label(state: u32) -> &'static str {
    match state {
        1 => "ESTABLISHED",
        2 => "SYN_SENT",
        3 => "SYN_RECV",
        4 => "FIN_WAIT1",
        5 => "FIN_WAIT2",
        6 => "TIME_WAIT",
        7 => "CLOSED",
        8 => "CLOSE_WAIT",
        9 => "LAST_ACK",
        10 => "LISTEN",
        11 => "CLOSING",
        12 => "NEW_SYN_RECV",
        _ => "",
    }
}

/// Converts a typed `Flow` message into the same `FlowRecord` representation
/// the wire decoder produces, so C2/C4/C5 never need to know which ingest
/// path a record arrived through. Rejects a flow with neither address family
/// set, mirroring the wire decoder's `AmbiguousAddressFamily` check.
fn flow_to_record(flow: Flow) -> Option<FlowRecord> {
    let mut record = FlowRecord::new();

    let source_v4: Option<std::net::Ipv4Addr> = flow.source_address.parse().ok();
    let source_v6: Option<std::net::Ipv6Addr> = if source_v4.is_none() { flow.source_address.parse().ok() } else { None };
    let dest_v4: Option<std::net::Ipv4Addr> = flow.destination_address.parse().ok();
    let dest_v6: Option<std::net::Ipv6Addr> = if dest_v4.is_none() { flow.destination_address.parse().ok() } else { None };

    match (source_v4, source_v6, dest_v4, dest_v6) {
        (Some(s), _, Some(d), _) => {
            record.set(Ie::SourceIPv4Address, FieldValue::Ipv4(s));
            record.set(Ie::DestinationIPv4Address, FieldValue::Ipv4(d));
        }
        (_, Some(s), _, Some(d)) => {
            record.set(Ie::SourceIPv6Address, FieldValue::Ipv6(s));
            record.set(Ie::DestinationIPv6Address, FieldValue::Ipv6(d));
        }
        _ => return None,
    }

    record.set(Ie::SourceTransportPort, FieldValue::U16(flow.source_port as u16));
    record.set(Ie::DestinationTransportPort, FieldValue::U16(flow.destination_port as u16));
    record.set(Ie::ProtocolIdentifier, FieldValue::U8(flow.protocol_identifier as u8));
    record.set(Ie::OctetDeltaCount, FieldValue::U64(flow.octet_delta_count));
    record.set(Ie::PacketDeltaCount, FieldValue::U64(flow.packet_delta_count));
    record.set(Ie::ReverseOctetDeltaCount, FieldValue::U64(flow.reverse_octet_delta_count));
    record.set(Ie::ReversePacketDeltaCount, FieldValue::U64(flow.reverse_packet_delta_count));
    record.set(Ie::FlowStartSeconds, FieldValue::U32(flow.flow_start_seconds));
    record.set(Ie::FlowEndSeconds, FieldValue::U32(flow.flow_end_seconds));
    record.set(Ie::TcpState, FieldValue::String(tcp_state_label(flow.tcp_state).to_string()));

    if !flow.source_pod_name.is_empty() {
        record.set(Ie::SourcePodName, FieldValue::String(flow.source_pod_name));
        record.set(Ie::SourcePodNamespace, FieldValue::String(flow.source_pod_namespace));
        record.set(Ie::SourceNodeName, FieldValue::String(flow.source_node_name));
    }
    if !flow.destination_pod_name.is_empty() {
        record.set(Ie::DestinationPodName, FieldValue::String(flow.destination_pod_name));
        record.set(Ie::DestinationPodNamespace, FieldValue::String(flow.destination_pod_namespace));
        record.set(Ie::DestinationNodeName, FieldValue::String(flow.destination_node_name));
    }
    if !flow.destination_cluster_ip.is_empty() {
        if let Ok(addr) = flow.destination_cluster_ip.parse::<std::net::Ipv4Addr>() {
            record.set(Ie::DestinationClusterIPv4, FieldValue::Ipv4(addr));
        } else if let Ok(addr) = flow.destination_cluster_ip.parse::<std::net::Ipv6Addr>() {
            record.set(Ie::DestinationClusterIPv6, FieldValue::Ipv6(addr));
        }
    }
    if flow.destination_service_port > 0 {
        record.set(Ie::DestinationServicePort, FieldValue::U16(flow.destination_service_port as u16));
    }
    if !flow.destination_service_name.is_empty() {
        record.set(Ie::DestinationServicePortName, FieldValue::String(flow.destination_service_name));
    }

    if !flow.ingress_network_policy_name.is_empty() {
        record.set(Ie::IngressNetworkPolicyName, FieldValue::String(flow.ingress_network_policy_name));
        record.set(Ie::IngressNetworkPolicyNamespace, FieldValue::String(flow.ingress_network_policy_namespace));
        record.set(Ie::IngressNetworkPolicyType, FieldValue::U8(flow.ingress_network_policy_type as u8));
        record.set(Ie::IngressNetworkPolicyRuleAction, FieldValue::U8(flow.ingress_network_policy_rule_action as u8));
    }
    if !flow.egress_network_policy_name.is_empty() {
        record.set(Ie::EgressNetworkPolicyName, FieldValue::String(flow.egress_network_policy_name));
        record.set(Ie::EgressNetworkPolicyNamespace, FieldValue::String(flow.egress_network_policy_namespace));
        record.set(Ie::EgressNetworkPolicyType, FieldValue::U8(flow.egress_network_policy_type as u8));
        record.set(Ie::EgressNetworkPolicyRuleAction, FieldValue::U8(flow.egress_network_policy_rule_action as u8));
    }

    record.set(Ie::FlowType, FieldValue::U8(flow.flow_type as u8));
    Some(record)
}

/// Runs the gRPC server to completion; always mTLS (spec §6 "Internal RPC...
/// mTLS"), using the server identity and client CA root produced by C8.
pub async fn run(
    addr: SocketAddr,
    identity: Identity,
    client_ca: tonic::transport::Certificate,
    tx: mpsc::Sender<IngestedRecord>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) -> Result<(), tonic::transport::Error> {
    let tls_config = ServerTlsConfig::new().identity(identity).client_ca_root(client_ca);
    let service = FlowExportService::new(tx, metrics, cancel.clone());

    let server = Server::builder()
        .tls_config(tls_config)?
        .add_service(FlowExportServer::new(service))
        .serve_with_shutdown(addr, async move {
            cancel.cancelled().await;
        });

    if let Err(e) = server.await {
        warn!("gRPC ingest server on {} exited with error: {}", addr, e);
        return Err(e);
    }
    Ok(())
}
