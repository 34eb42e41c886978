//! Shared envelope types carried across the channel stages named in spec §5
//! (collector → preprocessor → enricher/aggregator → exporter fan-out).

use std::net::IpAddr;

use crate::ipfix::FlowRecord;

/// One record plus the metadata C4 needs to stamp originalExporter* and
/// originalObservationDomainId (spec §4.4 step 4). Produced by C1, consumed
/// unchanged through C2, and read (not re-derived) by C4 whether the record
/// arrived via proxy mode or via the aggregator.
#[derive(Debug, Clone)]
pub struct IngestedRecord {
    pub record: FlowRecord,
    pub exporter_address: IpAddr,
    pub observation_domain_id: u32,
    /// Wall-clock-ish record time used by C3 lookups (spec §4.4 step 1): the
    /// record's own flowEndSeconds, or flowStartSeconds if not yet set.
    pub record_time: std::time::SystemTime,
}

pub const CHANNEL_CAPACITY: usize = 16;
