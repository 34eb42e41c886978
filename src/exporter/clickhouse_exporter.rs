//! ClickHouse sink (spec §4.6 "ClickHouse"). Uses the `klickhouse` native
//! protocol client, the crate grounded in
//! `other_examples/*klickhouse*protocol.rs*`, the only file in the pack that
//! speaks the ClickHouse native wire format.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use klickhouse::{Client, ClientOptions, Row};
use log::{error, info, warn};

use crate::aggregation::ExportableRecord;
use crate::config::options::{ClickHouseOptions, Options};
use crate::error::AggregatorError;
use crate::ipfix::{FieldValue, Ie};

const HIGH_WATER: usize = 100_000;

#[derive(Row)]
struct FlowRow {
    source_address: String,
    destination_address: String,
    source_port: u16,
    destination_port: u16,
    protocol_identifier: u8,
    octet_delta_count: u64,
    packet_delta_count: u64,
    reverse_octet_delta_count: u64,
    reverse_packet_delta_count: u64,
    source_pod_name: String,
    source_pod_namespace: String,
    source_node_name: String,
    destination_pod_name: String,
    destination_pod_namespace: String,
    destination_node_name: String,
    flow_direction: u8,
    flow_type: u8,
    throughput: u64,
    reverse_throughput: u64,
    cluster_id: String,
}

pub struct ClickHouseExporter {
    database_url: String,
    database: String,
    commit_interval: Duration,
    compress: bool,
    client: Option<Client>,
    pending: VecDeque<FlowRow>,
    last_commit: Instant,
}

impl ClickHouseExporter {
    pub fn new(options: &Options) -> Self {
        let opts: &ClickHouseOptions = &options.click_house;
        ClickHouseExporter {
            database_url: opts.database_url.clone(),
            database: opts.database.clone(),
            commit_interval: opts.commit_interval,
            compress: opts.compress,
            client: None,
            pending: VecDeque::new(),
            last_commit: Instant::now(),
        }
    }

    async fn connect(&self) -> Result<Client, AggregatorError> {
        let options = ClientOptions { default_database: self.database.clone(), ..Default::default() };
        Client::connect(&self.database_url, options)
            .await
            .map_err(|e| AggregatorError::TransientNetwork { addr: self.database_url.clone(), source: std::io::Error::other(e.to_string()) })
    }

    async fn commit(&mut self) -> Result<(), AggregatorError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        if self.client.is_none() {
            self.client = Some(self.connect().await?);
        }
        let client = self.client.as_ref().expect("connected above");
        let rows: Vec<FlowRow> = self.pending.drain(..).collect();
        let compression = if self.compress { "LZ4" } else { "None" };
        if let Err(e) = client.insert_native_block(&format!("INSERT INTO flows SETTINGS network_compression_method = '{compression}'"), rows).await {
            warn!("ClickHouse commit failed: {}", e);
            self.client = None;
            return Err(AggregatorError::TransientNetwork { addr: self.database_url.clone(), source: std::io::Error::other(e.to_string()) });
        }
        self.last_commit = Instant::now();
        Ok(())
    }
}

fn to_row(record: &ExportableRecord) -> FlowRow {
    let f = &record.fields;
    FlowRow {
        source_address: f.source_address().map(|a| a.to_string()).unwrap_or_default(),
        destination_address: f.destination_address().map(|a| a.to_string()).unwrap_or_default(),
        source_port: f.get_u32(Ie::SourceTransportPort) as u16,
        destination_port: f.get_u32(Ie::DestinationTransportPort) as u16,
        protocol_identifier: f.get_u8(Ie::ProtocolIdentifier),
        octet_delta_count: f.get_u64(Ie::OctetDeltaCount),
        packet_delta_count: f.get_u64(Ie::PacketDeltaCount),
        reverse_octet_delta_count: f.get_u64(Ie::ReverseOctetDeltaCount),
        reverse_packet_delta_count: f.get_u64(Ie::ReversePacketDeltaCount),
        source_pod_name: f.get_string(Ie::SourcePodName),
        source_pod_namespace: f.get_string(Ie::SourcePodNamespace),
        source_node_name: f.get_string(Ie::SourceNodeName),
        destination_pod_name: f.get_string(Ie::DestinationPodName),
        destination_pod_namespace: f.get_string(Ie::DestinationPodNamespace),
        destination_node_name: f.get_string(Ie::DestinationNodeName),
        flow_direction: f.get_u8(Ie::FlowDirection),
        flow_type: f.get_u8(Ie::FlowType),
        throughput: f.get_u64(Ie::Throughput),
        reverse_throughput: f.get_u64(Ie::ReverseThroughput),
        cluster_id: f.get_string(Ie::ClusterId),
    }
}

#[async_trait]
impl super::Exporter for ClickHouseExporter {
    fn name(&self) -> &'static str {
        "clickhouse"
    }

    async fn start(&mut self) -> Result<(), AggregatorError> {
        self.client = Some(self.connect().await?);
        info!("ClickHouse exporter connected to {}", self.database_url);
        Ok(())
    }

    async fn stop(&mut self) {
        let _ = self.commit().await;
        self.client = None;
    }

    async fn add_record(&mut self, record: &ExportableRecord) -> Result<(), AggregatorError> {
        if self.pending.len() >= HIGH_WATER {
            error!("ClickHouse pending buffer at high-water ({}), dropping record", HIGH_WATER);
            return Err(AggregatorError::ResourceExhausted);
        }
        self.pending.push_back(to_row(record));
        if self.last_commit.elapsed() >= self.commit_interval {
            self.commit().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), AggregatorError> {
        self.commit().await
    }

    async fn update_options(&mut self, options: &Options) {
        self.commit_interval = options.click_house.commit_interval;
        self.compress = options.click_house.compress;
    }
}
