//! The two canonical templates C2 normalizes every message to (spec §4.2).

use crate::ipfix::element::Ie;

pub const CANONICAL_IPV4_TEMPLATE_ID: u16 = 256;
pub const CANONICAL_IPV6_TEMPLATE_ID: u16 = 257;

/// Field order fixed so every sink that needs a stable schema (ClickHouse
/// columns, CSV headers) can rely on it. Pod-labels fields are always
/// present (spec §4.4: "the field is always added so the output template is
/// stable") even when `recordContents.podLabels` is disabled, in which case
/// they are written as an empty string rather than omitted.
pub fn canonical_fields(is_ipv6: bool) -> &'static [Ie] {
    if is_ipv6 {
        &IPV6_FIELDS
    } else {
        &IPV4_FIELDS
    }
}

macro_rules! common_tail {
    () => {
        [
            Ie::SourceTransportPort,
            Ie::DestinationTransportPort,
            Ie::ProtocolIdentifier,
            Ie::OctetDeltaCount,
            Ie::PacketDeltaCount,
            Ie::ReverseOctetDeltaCount,
            Ie::ReversePacketDeltaCount,
            Ie::TcpControlBits,
            Ie::FlowStartSeconds,
            Ie::FlowEndSeconds,
            Ie::FlowEndReason,
            Ie::FlowDirection,
            Ie::SourcePodName,
            Ie::SourcePodNamespace,
            Ie::SourceNodeName,
            Ie::DestinationPodName,
            Ie::DestinationPodNamespace,
            Ie::DestinationNodeName,
            Ie::DestinationServicePort,
            Ie::DestinationServicePortName,
            Ie::IngressNetworkPolicyName,
            Ie::IngressNetworkPolicyNamespace,
            Ie::IngressNetworkPolicyType,
            Ie::IngressNetworkPolicyRuleAction,
            Ie::IngressNetworkPolicyRuleName,
            Ie::EgressNetworkPolicyName,
            Ie::EgressNetworkPolicyNamespace,
            Ie::EgressNetworkPolicyType,
            Ie::EgressNetworkPolicyRuleAction,
            Ie::EgressNetworkPolicyRuleName,
            Ie::FlowType,
            Ie::TcpState,
            Ie::Throughput,
            Ie::ReverseThroughput,
            Ie::SourceThroughput,
            Ie::DestinationThroughput,
            Ie::SourcePodLabels,
            Ie::DestinationPodLabels,
            Ie::EgressName,
            Ie::EgressIP,
            Ie::AppProtocolName,
            Ie::ClusterId,
            Ie::OriginalObservationDomainId,
        ]
    };
}

lazy_static::lazy_static! {
    static ref IPV4_FIELDS: Vec<Ie> = {
        let mut v = vec![Ie::SourceIPv4Address, Ie::DestinationIPv4Address];
        v.extend(common_tail!());
        v.push(Ie::DestinationClusterIPv4);
        v.push(Ie::OriginalExporterIPv4Address);
        v
    };
    static ref IPV6_FIELDS: Vec<Ie> = {
        let mut v = vec![Ie::SourceIPv6Address, Ie::DestinationIPv6Address];
        v.extend(common_tail!());
        v.push(Ie::DestinationClusterIPv6);
        v.push(Ie::OriginalExporterIPv6Address);
        v
    };
}

/// The correlatable fields named in spec §4.5, filled on the aggregated
/// record only when previously empty.
pub const CORRELATABLE_FIELDS: &[Ie] = &[
    Ie::SourcePodName,
    Ie::SourcePodNamespace,
    Ie::SourceNodeName,
    Ie::DestinationPodName,
    Ie::DestinationPodNamespace,
    Ie::DestinationNodeName,
    Ie::DestinationClusterIPv4,
    Ie::DestinationClusterIPv6,
    Ie::DestinationServicePort,
    Ie::DestinationServicePortName,
    Ie::IngressNetworkPolicyName,
    Ie::IngressNetworkPolicyNamespace,
    Ie::IngressNetworkPolicyType,
    Ie::IngressNetworkPolicyRuleAction,
    Ie::IngressNetworkPolicyRuleName,
    Ie::EgressNetworkPolicyName,
    Ie::EgressNetworkPolicyNamespace,
    Ie::EgressNetworkPolicyType,
    Ie::EgressNetworkPolicyRuleAction,
    Ie::EgressNetworkPolicyRuleName,
];

/// The cumulative counters merged with `max(current, incoming)` (spec §4.5).
pub const COUNTER_FIELDS: &[Ie] = &[Ie::OctetDeltaCount, Ie::PacketDeltaCount, Ie::ReverseOctetDeltaCount, Ie::ReversePacketDeltaCount];
