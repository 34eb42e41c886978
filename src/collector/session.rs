//! Per-connection (TCP/TLS) and per-datagram (UDP) message framing and
//! decode, shared by `collector::{tcp,tls,udp}` (spec §4.1).

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ipfix::header::MESSAGE_HEADER_SIZE;
use crate::ipfix::{codec, element::Ie, SessionId, TemplateCache};
use crate::metrics::Metrics;
use crate::pipeline::IngestedRecord;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_session_id() -> SessionId {
    SessionId::Connection(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
}

/// Reads one complete IPFIX message off a byte stream: the 16-byte header
/// carries the total message length at offset 2, so the rest is read once
/// that's known. Returns `Ok(None)` on a clean EOF between messages.
pub async fn read_message<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; MESSAGE_HEADER_SIZE];
    match stream.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let length = u16::from_be_bytes([header[2], header[3]]) as usize;
    if length < MESSAGE_HEADER_SIZE {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "ipfix message length smaller than its own header"));
    }
    let mut buf = vec![0u8; length];
    buf[..MESSAGE_HEADER_SIZE].copy_from_slice(&header);
    stream.read_exact(&mut buf[MESSAGE_HEADER_SIZE..]).await?;
    Ok(Some(buf))
}

/// Runs a TCP/TLS session to completion: reads framed messages until EOF or
/// error, decoding each with a session-local template cache (spec §3
/// "over TCP/TLS, templates live for the connection"). A decode error on one
/// message is logged and the session continues reading (spec §4.1: "a decode
/// error on a record... continues"); a session-level I/O error ends it.
pub async fn run_stream_session<S: AsyncRead + Unpin>(
    mut stream: S,
    peer: IpAddr,
    tx: mpsc::Sender<IngestedRecord>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) {
    let session = next_session_id();
    let mut cache = TemplateCache::new();
    metrics.connections_to_collector.inc();

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = read_message(&mut stream) => msg,
        };
        match msg {
            Ok(Some(buf)) => {
                if publish_decoded(&buf, session, Duration::from_secs(0), &mut cache, peer, &tx, &metrics, &cancel).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Collector session with {} ended: {}", peer, e);
                break;
            }
        }
    }

    metrics.connections_to_collector.dec();
}

/// Decodes one datagram for a UDP peer, reusing the caller's shared
/// per-exporter template cache (spec §3: UDP templates expire by TTL rather
/// than session close, so the cache outlives any single datagram).
pub async fn publish_datagram(
    buf: &[u8],
    peer: IpAddr,
    udp_template_ttl: Duration,
    cache: &mut TemplateCache,
    tx: &mpsc::Sender<IngestedRecord>,
    metrics: &Arc<Metrics>,
    cancel: &CancellationToken,
) {
    let session = SessionId::UdpPeer(peer);
    let _ = publish_decoded(buf, session, udp_template_ttl, cache, peer, tx, metrics, cancel).await;
}

async fn publish_decoded(
    buf: &[u8],
    session: SessionId,
    udp_template_ttl: Duration,
    cache: &mut TemplateCache,
    peer: IpAddr,
    tx: &mpsc::Sender<IngestedRecord>,
    metrics: &Arc<Metrics>,
    cancel: &CancellationToken,
) -> Result<(), ()> {
    let decoded = match codec::decode_message(buf, session, udp_template_ttl, cache) {
        Ok(d) => d,
        Err(e) => {
            metrics.records_dropped.with_label_values(&["malformed"]).inc();
            debug!("Dropping malformed IPFIX message from {}: {}", peer, e);
            return Ok(());
        }
    };
    if decoded.sets_dropped_unknown_template > 0 {
        metrics.records_dropped.with_label_values(&["unknown_template"]).inc_by(decoded.sets_dropped_unknown_template as u64);
    }

    for record in decoded.records {
        metrics.records_received.inc();
        let ingested = IngestedRecord {
            record_time: record_time_of(&record),
            record,
            exporter_address: peer,
            observation_domain_id: decoded.header.observation_domain_id,
        };
        // Backpressure is intentional (spec §4.1): a blocked send here
        // slows the reader rather than silently dropping input.
        tokio::select! {
            _ = cancel.cancelled() => return Err(()),
            send_result = tx.send(ingested) => {
                if send_result.is_err() {
                    return Err(());
                }
            }
        }
    }
    Ok(())
}

fn record_time_of(record: &crate::ipfix::FlowRecord) -> SystemTime {
    let seconds = match record.get(Ie::FlowEndSeconds) {
        Some(v) if v.as_u64().unwrap_or(0) > 0 => v.as_u64().unwrap_or(0),
        _ => record.get(Ie::FlowStartSeconds).and_then(|v| v.as_u64()).unwrap_or(0),
    };
    UNIX_EPOCH + Duration::from_secs(seconds)
}
