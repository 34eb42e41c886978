//! Metrics endpoint (spec §6 "metrics endpoint", §7 "counters exported via
//! the metrics endpoint").
//!
//! The teacher serves a hard-coded HTML page off a hand-rolled
//! `std::net::TcpListener` loop (`threads/prometheus.rs`). This keeps that
//! same accept-loop shape (ported to `tokio::net::TcpListener` so it can run
//! as a task alongside everything else) but serves a real Prometheus text
//! exposition body from a `prometheus::Registry`, the crate `estuary-flow`
//! uses for its own operational counters.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{error, info};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub struct Metrics {
    registry: Registry,
    pub records_received: IntCounter,
    pub records_exported: IntCounterVec,
    pub records_dropped: IntCounterVec,
    pub flows: IntGauge,
    pub connections_to_collector: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let records_received = IntCounter::new("num_records_received", "IPFIX records received by the collector").unwrap();
        let records_exported =
            IntCounterVec::new(Opts::new("num_records_exported", "Records exported, labeled by sink"), &["sink"]).unwrap();
        let records_dropped =
            IntCounterVec::new(Opts::new("num_records_dropped", "Records dropped, labeled by reason"), &["reason"]).unwrap();
        let flows = IntGauge::new("num_flows", "Aggregated flows currently tracked (aggregate mode)").unwrap();
        let connections_to_collector = IntGauge::new("num_connections_to_collector", "Live TCP/TLS collector sessions").unwrap();

        registry.register(Box::new(records_received.clone())).unwrap();
        registry.register(Box::new(records_exported.clone())).unwrap();
        registry.register(Box::new(records_dropped.clone())).unwrap();
        registry.register(Box::new(flows.clone())).unwrap();
        registry.register(Box::new(connections_to_collector.clone())).unwrap();

        Metrics { registry, records_received, records_exported, records_dropped, flows, connections_to_collector }
    }

    fn gather(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        encoder.encode(&self.registry.gather(), &mut buf).expect("prometheus text encoding is infallible for well-formed metrics");
        buf
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn serve(addr: SocketAddr, metrics: Arc<Metrics>, cancel: CancellationToken) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Listening for metrics scrapes on {}", &addr);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let metrics = metrics.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, &metrics).await {
                        error!("Metrics connection failed: {}", e);
                    }
                });
            }
        }
    }
}

async fn handle_connection(mut stream: tokio::net::TcpStream, metrics: &Metrics) -> std::io::Result<()> {
    let body = metrics.gather();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.write_all(&body).await?;
    stream.flush().await
}
