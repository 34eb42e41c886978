//! Error taxonomy (spec §7).
//!
//! Each variant maps to one of the categories named in the spec. `MalformedRecord`
//! and `LookupMiss` are handled inline by the component that detects them and
//! never reach a caller as an `Err` - they are logged and counted in place.
//! `ResourceExhausted` is the one "drop and continue" category that does
//! propagate, as a per-sink `Err` the exporter fan-out turns into a dropped-record
//! count without treating it as a hard failure. The remaining variants are
//! transient sink failures that trigger backoff, and fatal conditions that cause
//! process exit.

use std::net::SocketAddr;

#[derive(thiserror::Error, Debug)]
pub enum AggregatorError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("configuration watcher failed irrecoverably: {0}")]
    ConfigWatcherBroken(String),

    #[error("transient network failure talking to {addr}: {source}")]
    TransientNetwork {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("sink is backing off, record skipped")]
    Backoff,

    #[error("sink queue is full, record dropped")]
    ResourceExhausted,

    #[error("certificate generation failed: {0}")]
    CertGeneration(String),

    #[error("kubernetes API error: {0}")]
    Kubernetes(#[from] kube::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AggregatorError>;

/// Per-record decode/validation failure (spec §7 `MalformedRecord`). Carries
/// enough context to log usefully but is always swallowed by the caller after
/// incrementing `numRecordsDropped`.
#[derive(thiserror::Error, Debug, Clone)]
pub enum MalformedRecordError {
    #[error("set {set_id} references unknown template")]
    UnknownTemplate { set_id: u16 },
    #[error("data set too short: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("record has both or neither of sourceIPv4Address/sourceIPv6Address set")]
    AmbiguousAddressFamily,
    #[error("record address family mismatch between source and destination")]
    FamilyMismatch,
    #[error("ipfix header malformed: {0}")]
    BadHeader(String),
}

/// Session-level failure: the session is closed but the listener keeps running
/// (spec §4.1).
#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("peer {peer} closed the connection")]
    Closed { peer: SocketAddr },
    #[error("io error from {peer}: {source}")]
    Io {
        peer: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("tls handshake with {peer} failed: {source}")]
    TlsHandshake {
        peer: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}
