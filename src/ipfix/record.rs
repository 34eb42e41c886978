//! `FlowRecord` and `FlowKey` (spec §3).
//!
//! Generalizes the teacher's fixed `IpfixDataSet { src_addr: u32, ... }`
//! struct (`flow/ipfix.rs`, `netflow/ipfix.rs`) to a typed field map so a
//! single representation covers IPv4 and IPv6, the IANA/reverse/Antrea IE
//! families, and unknown IEs that must survive until C2 strips them.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use crate::ipfix::element::{FieldValue, Ie};

#[derive(Debug, Clone, Default)]
pub struct FlowRecord {
    fields: BTreeMap<Ie, FieldValue>,
}

impl FlowRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, ie: Ie) -> Option<&FieldValue> {
        self.fields.get(&ie)
    }

    pub fn set(&mut self, ie: Ie, value: FieldValue) {
        self.fields.insert(ie, value);
    }

    pub fn remove(&mut self, ie: Ie) -> Option<FieldValue> {
        self.fields.remove(&ie)
    }

    pub fn contains(&self, ie: Ie) -> bool {
        self.fields.contains_key(&ie)
    }

    /// A field is "populated" when present and not the family's zero value
    /// (spec §4.5: "if the incoming value is non-empty").
    pub fn is_populated(&self, ie: Ie) -> bool {
        self.fields.get(&ie).is_some_and(|v| !v.is_empty_ish())
    }

    pub fn get_string(&self, ie: Ie) -> String {
        match self.fields.get(&ie) {
            Some(FieldValue::String(s)) => s.clone(),
            _ => String::new(),
        }
    }

    pub fn get_u64(&self, ie: Ie) -> u64 {
        self.fields.get(&ie).and_then(FieldValue::as_u64).unwrap_or(0)
    }

    pub fn get_u32(&self, ie: Ie) -> u32 {
        self.get_u64(ie) as u32
    }

    pub fn get_u8(&self, ie: Ie) -> u8 {
        self.get_u64(ie) as u8
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Ie, &FieldValue)> {
        self.fields.iter()
    }

    pub fn is_ipv4(&self) -> bool {
        self.contains(Ie::SourceIPv4Address)
    }

    pub fn is_ipv6(&self) -> bool {
        self.contains(Ie::SourceIPv6Address)
    }

    pub fn source_address(&self) -> Option<IpAddr> {
        match self.fields.get(&Ie::SourceIPv4Address) {
            Some(FieldValue::Ipv4(a)) => Some(IpAddr::V4(*a)),
            _ => match self.fields.get(&Ie::SourceIPv6Address) {
                Some(FieldValue::Ipv6(a)) => Some(IpAddr::V6(*a)),
                _ => None,
            },
        }
    }

    pub fn destination_address(&self) -> Option<IpAddr> {
        match self.fields.get(&Ie::DestinationIPv4Address) {
            Some(FieldValue::Ipv4(a)) => Some(IpAddr::V4(*a)),
            _ => match self.fields.get(&Ie::DestinationIPv6Address) {
                Some(FieldValue::Ipv6(a)) => Some(IpAddr::V6(*a)),
                _ => None,
            },
        }
    }

    pub fn flow_key(&self) -> Option<FlowKey> {
        let src = self.source_address()?;
        let dst = self.destination_address()?;
        Some(FlowKey {
            source_address: src.to_string(),
            destination_address: dst.to_string(),
            source_port: self.get_u32(Ie::SourceTransportPort) as u16,
            destination_port: self.get_u32(Ie::DestinationTransportPort) as u16,
            protocol_identifier: self.get_u8(Ie::ProtocolIdentifier),
        })
    }

    /// The side that is "present" for correlation purposes: a record counts
    /// as a source-side report when its pod/node identity for the source is
    /// known and the destination's is not, and vice versa (spec §4.5).
    pub fn reporting_side(&self) -> ReportingSide {
        let src_known = self.is_populated(Ie::SourcePodName) || self.is_populated(Ie::SourceNodeName);
        let dst_known = self.is_populated(Ie::DestinationPodName) || self.is_populated(Ie::DestinationNodeName);
        match (src_known, dst_known) {
            (true, false) => ReportingSide::Source,
            (false, true) => ReportingSide::Destination,
            _ => ReportingSide::Both,
        }
    }
}

impl fmt::Display for FlowRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} proto={} octets={} packets={}",
            self.source_address().map(|a| a.to_string()).unwrap_or_default(),
            self.get_u32(Ie::SourceTransportPort),
            self.destination_address().map(|a| a.to_string()).unwrap_or_default(),
            self.get_u32(Ie::DestinationTransportPort),
            self.get_u8(Ie::ProtocolIdentifier),
            self.get_u64(Ie::OctetDeltaCount),
            self.get_u64(Ie::PacketDeltaCount),
        )
    }
}

/// Directional 5-tuple (spec §3 "FlowKey"). Addresses are canonical strings;
/// the two sides of a bidirectional flow are never swapped into a single
/// normalized key, per spec.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FlowKey {
    pub source_address: String,
    pub destination_address: String,
    pub source_port: u16,
    pub destination_port: u16,
    pub protocol_identifier: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportingSide {
    Source,
    Destination,
    Both,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn sample() -> FlowRecord {
        let mut r = FlowRecord::new();
        r.set(Ie::SourceIPv4Address, FieldValue::Ipv4(Ipv4Addr::new(10, 0, 0, 1)));
        r.set(Ie::DestinationIPv4Address, FieldValue::Ipv4(Ipv4Addr::new(10, 0, 0, 2)));
        r.set(Ie::SourceTransportPort, FieldValue::U16(1234));
        r.set(Ie::DestinationTransportPort, FieldValue::U16(80));
        r.set(Ie::ProtocolIdentifier, FieldValue::U8(6));
        r
    }

    #[test]
    fn flow_key_is_directional() {
        let r = sample();
        let key = r.flow_key().unwrap();
        assert_eq!(key.source_address, "10.0.0.1");
        assert_eq!(key.destination_address, "10.0.0.2");
    }

    #[test]
    fn reporting_side_detects_source_only() {
        let mut r = sample();
        r.set(Ie::SourcePodName, FieldValue::String("pod-a".into()));
        assert_eq!(r.reporting_side(), ReportingSide::Source);
    }
}
