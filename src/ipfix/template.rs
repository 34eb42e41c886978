//! Template cache (spec §3 "Template", §9 "key the template cache by
//! (session-id, observation-domain-id)").
//!
//! Generalizes the teacher's `threads/listener.rs::ExporterList` (a
//! `HashMap<Exporter, ExporterInfos>` where `Exporter { addr, domain_id }`)
//! to a `(SessionId, observation_domain_id)` key so TCP/TLS sessions from
//! different exporters never collide on template-id 256, and so a UDP
//! template's per-exporter TTL (also tracked by the teacher's structure,
//! there named `sampling`) is modeled explicitly.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::ipfix::element::{ElementKey, Ie};

/// Identifies the scope a template lives in. For TCP/TLS this is the
/// connection; templates live for the life of the session (spec §3). For UDP,
/// which has no connection, the exporter's source IP stands in (DESIGN.md
/// Open Question 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionId {
    Connection(u64),
    UdpPeer(IpAddr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TemplateKey {
    pub session: SessionId,
    pub observation_domain_id: u32,
    pub template_id: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpecifier {
    pub element_key: ElementKey,
    pub ie: Ie,
    pub length: u16,
}

#[derive(Debug, Clone)]
pub struct Template {
    pub template_id: u16,
    pub fields: Vec<FieldSpecifier>,
    /// `None` for TCP/TLS (lives for the session); `Some(deadline)` for UDP,
    /// refreshed whenever the exporter retransmits the template set.
    expires_at: Option<Instant>,
}

impl Template {
    pub fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(deadline) if now >= deadline)
    }

    /// Total record length if every field is fixed-length; `None` if any
    /// field is RFC 7011 §7 variable-length (marked `0xFFFF`), in which case
    /// the codec must walk records one at a time using each record's own
    /// length-prefix octets.
    pub fn fixed_record_length(&self) -> Option<usize> {
        self.fields.iter().try_fold(0usize, |acc, f| if f.length == 0xFFFF { None } else { Some(acc + f.length as usize) })
    }
}

#[derive(Default)]
pub struct TemplateCache {
    templates: HashMap<TemplateKey, Template>,
}

impl TemplateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, session: SessionId, observation_domain_id: u32, template_id: u16, fields: Vec<FieldSpecifier>, ttl: Option<Duration>) {
        let key = TemplateKey { session, observation_domain_id, template_id };
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.templates.insert(key, Template { template_id, fields, expires_at });
    }

    /// Returns the template only if present and not expired; an expired or
    /// absent template means the caller must discard the data set (spec §3,
    /// §8 "a UDP template that expires mid-session causes subsequent data
    /// sets using it to be dropped, not panicked").
    pub fn get(&self, session: SessionId, observation_domain_id: u32, template_id: u16) -> Option<&Template> {
        let key = TemplateKey { session, observation_domain_id, template_id };
        self.templates.get(&key).filter(|t| !t.is_expired(Instant::now()))
    }

    pub fn evict_session(&mut self, session: SessionId) {
        self.templates.retain(|k, _| k.session != session);
    }

    pub fn sweep_expired(&mut self) {
        let now = Instant::now();
        self.templates.retain(|_, t| !t.is_expired(now));
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.templates.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_template_expires() {
        let mut cache = TemplateCache::new();
        let session = SessionId::UdpPeer("10.0.0.1".parse().unwrap());
        cache.insert(session, 1, 256, vec![], Some(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(session, 1, 256).is_none());
    }

    #[test]
    fn tcp_template_never_expires_until_session_evicted() {
        let mut cache = TemplateCache::new();
        let session = SessionId::Connection(7);
        cache.insert(session, 1, 256, vec![], None);
        assert!(cache.get(session, 1, 256).is_some());
        cache.evict_session(session);
        assert!(cache.get(session, 1, 256).is_none());
    }

    #[test]
    fn different_sessions_do_not_collide_on_template_id_256() {
        let mut cache = TemplateCache::new();
        let a = SessionId::UdpPeer("10.0.0.1".parse().unwrap());
        let b = SessionId::UdpPeer("10.0.0.2".parse().unwrap());
        cache.insert(a, 1, 256, vec![FieldSpecifier { element_key: ElementKey::iana(8), ie: Ie::SourceIPv4Address, length: 4 }], None);
        cache.insert(b, 1, 256, vec![], None);
        assert_eq!(cache.get(a, 1, 256).unwrap().fields.len(), 1);
        assert_eq!(cache.get(b, 1, 256).unwrap().fields.len(), 0);
    }
}
