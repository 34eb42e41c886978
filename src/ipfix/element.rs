//! Information-element registry (spec §3 "Flow record", §3.1).
//!
//! The teacher represents a flow record as a fixed C-like struct
//! (`flow::ipfix::IpfixDataSet` / `netflow::ipfix::IpfixDataSet`) decoded with
//! `bincode`. That shape cannot carry the three IE families this spec needs
//! (IANA, IANA-reverse, Antrea enterprise) plus unknown/variable-length IEs
//! that must round-trip through C1 for C2 to strip, so the registry below
//! generalizes it to a `(enterprise_id, element_id)` keyed catalog, in the
//! spirit of `netflow_parser`'s `IPFixField`/`FieldValue` split (that crate's
//! own catalog does not cover Antrea's private enterprise IEs, so this one is
//! built independently).

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use lazy_static::lazy_static;

pub const ENTERPRISE_IANA: u32 = 0;
pub const ENTERPRISE_IANA_REVERSE: u32 = 29305;
pub const ENTERPRISE_ANTREA: u32 = 56506;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ElementKey {
    pub enterprise_id: u32,
    pub element_id: u16,
}

impl ElementKey {
    pub const fn iana(element_id: u16) -> Self {
        ElementKey { enterprise_id: ENTERPRISE_IANA, element_id }
    }
    pub const fn iana_reverse(element_id: u16) -> Self {
        ElementKey { enterprise_id: ENTERPRISE_IANA_REVERSE, element_id }
    }
    pub const fn antrea(element_id: u16) -> Self {
        ElementKey { enterprise_id: ENTERPRISE_ANTREA, element_id }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    U8,
    U16,
    U32,
    U64,
    Ipv4,
    Ipv6,
    Mac,
    String,
    Bool,
    Bytes,
}

/// The well-known information elements this aggregator understands. Anything
/// else decodes to `Ie::Unknown` and is carried unchanged until C2 strips it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Ie {
    SourceIPv4Address,
    SourceIPv6Address,
    DestinationIPv4Address,
    DestinationIPv6Address,
    SourceTransportPort,
    DestinationTransportPort,
    ProtocolIdentifier,
    OctetDeltaCount,
    PacketDeltaCount,
    ReverseOctetDeltaCount,
    ReversePacketDeltaCount,
    TcpControlBits,
    IngressInterface,
    EgressInterface,
    FlowStartSeconds,
    FlowEndSeconds,
    FlowDirection,
    FlowEndReason,
    OriginalExporterIPv4Address,
    OriginalExporterIPv6Address,
    OriginalObservationDomainId,

    SourcePodName,
    SourcePodNamespace,
    SourceNodeName,
    DestinationPodName,
    DestinationPodNamespace,
    DestinationNodeName,
    DestinationClusterIPv4,
    DestinationClusterIPv6,
    DestinationServicePort,
    DestinationServicePortName,
    IngressNetworkPolicyName,
    IngressNetworkPolicyNamespace,
    IngressNetworkPolicyType,
    IngressNetworkPolicyRuleAction,
    IngressNetworkPolicyRuleName,
    EgressNetworkPolicyName,
    EgressNetworkPolicyNamespace,
    EgressNetworkPolicyType,
    EgressNetworkPolicyRuleAction,
    EgressNetworkPolicyRuleName,
    FlowType,
    TcpState,
    Throughput,
    ReverseThroughput,
    SourceThroughput,
    DestinationThroughput,
    SourcePodLabels,
    DestinationPodLabels,
    EgressName,
    EgressIP,
    AppProtocolName,
    ClusterId,

    Unknown(ElementKey),
}

pub struct ElementDescriptor {
    pub key: ElementKey,
    pub name: &'static str,
    pub kind: ElementKind,
}

macro_rules! registry {
    ($( ($ie:expr, $key:expr, $name:expr, $kind:expr) ),* $(,)?) => {
        lazy_static! {
            static ref BY_KEY: HashMap<ElementKey, Ie> = {
                let mut m = HashMap::new();
                $( m.insert($key, $ie); )*
                m
            };
            static ref BY_IE: HashMap<Ie, ElementDescriptor> = {
                let mut m = HashMap::new();
                $( m.insert($ie, ElementDescriptor { key: $key, name: $name, kind: $kind }); )*
                m
            };
        }
    };
}

use ElementKind::*;
use Ie::*;

registry! {
    (SourceIPv4Address, ElementKey::iana(8), "sourceIPv4Address", Ipv4),
    (DestinationIPv4Address, ElementKey::iana(12), "destinationIPv4Address", Ipv4),
    (SourceIPv6Address, ElementKey::iana(27), "sourceIPv6Address", Ipv6),
    (DestinationIPv6Address, ElementKey::iana(28), "destinationIPv6Address", Ipv6),
    (SourceTransportPort, ElementKey::iana(7), "sourceTransportPort", U16),
    (DestinationTransportPort, ElementKey::iana(11), "destinationTransportPort", U16),
    (ProtocolIdentifier, ElementKey::iana(4), "protocolIdentifier", U8),
    (OctetDeltaCount, ElementKey::iana(1), "octetDeltaCount", U64),
    (PacketDeltaCount, ElementKey::iana(2), "packetDeltaCount", U64),
    (ReverseOctetDeltaCount, ElementKey::iana_reverse(1), "reverseOctetDeltaCount", U64),
    (ReversePacketDeltaCount, ElementKey::iana_reverse(2), "reversePacketDeltaCount", U64),
    (TcpControlBits, ElementKey::iana(6), "tcpControlBits", U16),
    (IngressInterface, ElementKey::iana(10), "ingressInterface", U32),
    (EgressInterface, ElementKey::iana(14), "egressInterface", U32),
    (FlowStartSeconds, ElementKey::iana(150), "flowStartSeconds", U32),
    (FlowEndSeconds, ElementKey::iana(151), "flowEndSeconds", U32),
    (FlowDirection, ElementKey::iana(61), "flowDirection", U8),
    (FlowEndReason, ElementKey::iana(136), "flowEndReason", U8),
    (OriginalExporterIPv4Address, ElementKey::antrea(101), "originalExporterIPv4Address", Ipv4),
    (OriginalExporterIPv6Address, ElementKey::antrea(102), "originalExporterIPv6Address", Ipv6),
    (OriginalObservationDomainId, ElementKey::antrea(100), "originalObservationDomainId", U32),

    (SourcePodName, ElementKey::antrea(1), "sourcePodName", String),
    (SourcePodNamespace, ElementKey::antrea(2), "sourcePodNamespace", String),
    (SourceNodeName, ElementKey::antrea(3), "sourceNodeName", String),
    (DestinationPodName, ElementKey::antrea(4), "destinationPodName", String),
    (DestinationPodNamespace, ElementKey::antrea(5), "destinationPodNamespace", String),
    (DestinationNodeName, ElementKey::antrea(6), "destinationNodeName", String),
    (DestinationClusterIPv4, ElementKey::antrea(7), "destinationClusterIPv4", Ipv4),
    (DestinationClusterIPv6, ElementKey::antrea(8), "destinationClusterIPv6", Ipv6),
    (DestinationServicePort, ElementKey::antrea(9), "destinationServicePort", U16),
    (DestinationServicePortName, ElementKey::antrea(10), "destinationServicePortName", String),
    (IngressNetworkPolicyName, ElementKey::antrea(11), "ingressNetworkPolicyName", String),
    (IngressNetworkPolicyNamespace, ElementKey::antrea(12), "ingressNetworkPolicyNamespace", String),
    (IngressNetworkPolicyType, ElementKey::antrea(13), "ingressNetworkPolicyType", U8),
    (IngressNetworkPolicyRuleAction, ElementKey::antrea(14), "ingressNetworkPolicyRuleAction", U8),
    (EgressNetworkPolicyName, ElementKey::antrea(15), "egressNetworkPolicyName", String),
    (EgressNetworkPolicyNamespace, ElementKey::antrea(16), "egressNetworkPolicyNamespace", String),
    (EgressNetworkPolicyType, ElementKey::antrea(17), "egressNetworkPolicyType", U8),
    (EgressNetworkPolicyRuleAction, ElementKey::antrea(18), "egressNetworkPolicyRuleAction", U8),
    (FlowType, ElementKey::antrea(19), "flowType", U8),
    (TcpState, ElementKey::antrea(20), "tcpState", String),
    (Throughput, ElementKey::antrea(21), "throughput", U64),
    (ReverseThroughput, ElementKey::antrea(22), "reverseThroughput", U64),
    (SourceThroughput, ElementKey::antrea(23), "sourceThroughput", U64),
    (DestinationThroughput, ElementKey::antrea(24), "destinationThroughput", U64),
    (SourcePodLabels, ElementKey::antrea(25), "sourcePodLabels", String),
    (DestinationPodLabels, ElementKey::antrea(26), "destinationPodLabels", String),
    (EgressName, ElementKey::antrea(27), "egressName", String),
    (EgressIP, ElementKey::antrea(28), "egressIP", String),
    (AppProtocolName, ElementKey::antrea(29), "appProtocolName", String),
    (ClusterId, ElementKey::antrea(30), "clusterId", String),
    (IngressNetworkPolicyRuleName, ElementKey::antrea(31), "ingressNetworkPolicyRuleName", String),
    (EgressNetworkPolicyRuleName, ElementKey::antrea(32), "egressNetworkPolicyRuleName", String),
}

pub fn lookup_key(key: ElementKey) -> Ie {
    BY_KEY.get(&key).copied().unwrap_or(Ie::Unknown(key))
}

pub fn descriptor(ie: Ie) -> Option<&'static ElementDescriptor> {
    BY_IE.get(&ie)
}

pub fn element_key_of(ie: Ie) -> ElementKey {
    match ie {
        Ie::Unknown(k) => k,
        known => BY_IE.get(&known).map(|d| d.key).expect("every non-Unknown Ie is registered"),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Bool(bool),
    String(String),
    Bytes(Vec<u8>),
}

impl FieldValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FieldValue::U8(v) => Some(*v as u64),
            FieldValue::U16(v) => Some(*v as u64),
            FieldValue::U32(v) => Some(*v as u64),
            FieldValue::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn is_empty_ish(&self) -> bool {
        match self {
            FieldValue::String(s) => s.is_empty(),
            FieldValue::U8(0) | FieldValue::U16(0) | FieldValue::U32(0) | FieldValue::U64(0) => true,
            FieldValue::Ipv4(a) => a.is_unspecified(),
            FieldValue::Ipv6(a) => a.is_unspecified(),
            FieldValue::Bytes(b) => b.is_empty(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_known_key() {
        let key = ElementKey::antrea(1);
        assert_eq!(lookup_key(key), Ie::SourcePodName);
        assert_eq!(element_key_of(Ie::SourcePodName), key);
    }

    #[test]
    fn unknown_key_is_preserved() {
        let key = ElementKey { enterprise_id: 99999, element_id: 4242 };
        assert_eq!(lookup_key(key), Ie::Unknown(key));
    }
}
