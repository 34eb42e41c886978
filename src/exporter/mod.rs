//! Exporter fan-out (C6, spec §4.6): routes every finalized record to each
//! enabled sink, independently of the others' failure state.

pub mod clickhouse_exporter;
pub mod ipfix_exporter;
pub mod log_exporter;
pub mod s3_exporter;

use std::sync::Arc;

use async_trait::async_trait;
use log::{error, warn};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::aggregation::ExportableRecord;
use crate::config::options::Options;
use crate::error::AggregatorError;
use crate::metrics::Metrics;

/// Capability set shared by every sink (spec §4.6). Implementations are
/// invoked only by the export loop (spec §5 "single-writer discipline").
#[async_trait]
pub trait Exporter: Send + Sync {
    fn name(&self) -> &'static str;
    async fn start(&mut self) -> Result<(), AggregatorError>;
    async fn stop(&mut self);
    async fn add_record(&mut self, record: &ExportableRecord) -> Result<(), AggregatorError>;
    async fn flush(&mut self) -> Result<(), AggregatorError>;
    async fn update_options(&mut self, options: &Options);
}

/// Owns the live exporter set; mutated only here, on a pointer swap guarded
/// by `exporters-mutex` (spec §5), triggered by C7 snapshots.
pub struct ExporterManager {
    exporters: Arc<RwLock<Vec<Box<dyn Exporter>>>>,
    metrics: Arc<Metrics>,
}

impl ExporterManager {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        ExporterManager { exporters: Arc::new(RwLock::new(Vec::new())), metrics }
    }

    pub async fn apply_initial(&self, options: &Options) {
        let mut built = build_enabled_exporters(options);
        for exporter in built.iter_mut() {
            if let Err(e) = exporter.start().await {
                error!("Exporter {} failed to start: {}", exporter.name(), e);
            }
        }
        *self.exporters.write().await = built;
    }

    /// Applies a reconciled config snapshot (spec §4.7): create-and-start
    /// newly-enabled sinks, stop-and-drop newly-disabled ones, otherwise
    /// call UpdateOptions.
    pub async fn reconcile(&self, previous: &Options, next: &Options) {
        let mut exporters = self.exporters.write().await;

        let mut kept = Vec::new();
        for mut exporter in exporters.drain(..) {
            let still_enabled = sink_enabled(next, exporter.name());
            if still_enabled {
                exporter.update_options(next).await;
                kept.push(exporter);
            } else {
                exporter.stop().await;
            }
        }

        for mut candidate in build_enabled_exporters(next) {
            let was_enabled = sink_enabled(previous, candidate.name());
            if !was_enabled {
                if let Err(e) = candidate.start().await {
                    error!("Exporter {} failed to start: {}", candidate.name(), e);
                    continue;
                }
                kept.push(candidate);
            }
        }

        *exporters = kept;
    }

    /// Fan-out in deterministic (construction) order; one sink's failure is
    /// counted and does not suppress the others (spec §4.6).
    pub async fn add_record(&self, record: &ExportableRecord) {
        let mut exporters = self.exporters.write().await;
        for exporter in exporters.iter_mut() {
            if let Err(e) = exporter.add_record(record).await {
                warn!("Exporter {} dropped a record: {}", exporter.name(), e);
                self.metrics.records_dropped.with_label_values(&["exporter_failure"]).inc();
            } else {
                self.metrics.records_exported.with_label_values(&[exporter.name()]).inc();
            }
        }
    }

    pub async fn flush_all(&self) {
        let mut exporters = self.exporters.write().await;
        for exporter in exporters.iter_mut() {
            let _ = exporter.flush().await;
        }
    }

    pub async fn stop_all(&self) {
        let mut exporters = self.exporters.write().await;
        for exporter in exporters.iter_mut() {
            exporter.stop().await;
        }
    }
}

fn sink_enabled(options: &Options, name: &str) -> bool {
    match name {
        "ipfix" => options.flow_collector.enable,
        "clickhouse" => options.click_house.enable,
        "s3" => options.s3_uploader.enable,
        "log" => options.flow_logger.enable,
        _ => false,
    }
}

fn build_enabled_exporters(options: &Options) -> Vec<Box<dyn Exporter>> {
    let mut out: Vec<Box<dyn Exporter>> = Vec::new();
    if options.flow_collector.enable {
        out.push(Box::new(ipfix_exporter::IpfixExporter::new(options)));
    }
    if options.click_house.enable {
        out.push(Box::new(clickhouse_exporter::ClickHouseExporter::new(options)));
    }
    if options.s3_uploader.enable {
        out.push(Box::new(s3_exporter::S3Exporter::new(options)));
    }
    if options.flow_logger.enable {
        out.push(Box::new(log_exporter::LogExporter::new(options)));
    }
    out
}

pub const FAN_OUT_CHANNEL_CAPACITY: usize = crate::pipeline::CHANNEL_CAPACITY;

/// Drives the export loop: the sole mutator and sole caller of the exporter
/// set (spec §4.6, §5).
pub async fn run(
    mut rx: mpsc::Receiver<ExportableRecord>,
    manager: Arc<ExporterManager>,
    mut config_updates: mpsc::Receiver<crate::config::ConfigUpdate>,
    mut current: Options,
    cancel: CancellationToken,
) {
    manager.apply_initial(&current).await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            record = rx.recv() => {
                match record {
                    Some(record) => manager.add_record(&record).await,
                    None => break,
                }
            }
            update = config_updates.recv() => {
                match update {
                    Some(update) => {
                        let diffs = current.startup_fixed_fields_differ(&update.options);
                        if !diffs.is_empty() {
                            warn!("Ignoring attempted runtime change to fixed fields: {:?}", diffs);
                        }
                        let next = update.options.with_fixed_fields_from(&current);
                        manager.reconcile(&current, &next).await;
                        current = next;
                    }
                    None => {}
                }
            }
        }
    }

    manager.flush_all().await;
    manager.stop_all().await;
}
