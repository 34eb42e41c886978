//! Rotating local log file sink (spec §4.6 "Local log file").

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use log::{info, warn};

use crate::aggregation::ExportableRecord;
use crate::config::options::{FilterClause, FlowLoggerOptions, Options, RecordFormat};
use crate::error::AggregatorError;
use crate::ipfix::Ie;

pub struct LogExporter {
    path: PathBuf,
    max_size_bytes: u64,
    max_backups: u32,
    max_age: Duration,
    compress: bool,
    record_format: RecordFormat,
    filters: Vec<FilterClause>,
    pretty_print: bool,
    file: Option<File>,
    current_size: u64,
}

impl LogExporter {
    pub fn new(options: &Options) -> Self {
        let opts: &FlowLoggerOptions = &options.flow_logger;
        LogExporter {
            path: opts.path.clone(),
            max_size_bytes: opts.max_size.saturating_mul(1024 * 1024).max(1),
            max_backups: opts.max_backups,
            max_age: Duration::from_secs(u64::from(opts.max_age) * 24 * 3600),
            compress: opts.compress,
            record_format: opts.record_format,
            filters: opts.filters.clone(),
            pretty_print: opts.pretty_print,
            file: None,
            current_size: 0,
        }
    }

    fn open_file(&mut self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.current_size = file.metadata().map(|m| m.len()).unwrap_or(0);
        self.file = Some(file);
        Ok(())
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        self.file = None;
        let rotated_name = format!("{}.{}", self.path.display(), now_timestamp());
        fs::rename(&self.path, &rotated_name)?;

        if self.compress {
            if let Err(e) = gzip_file_in_place(Path::new(&rotated_name)) {
                warn!("Failed to gzip rotated log {}: {}", rotated_name, e);
            }
        }

        prune_backups(&self.path, self.max_backups, self.max_age)?;
        self.open_file()
    }

    fn passes_filters(record: &ExportableRecord, filters: &[FilterClause]) -> bool {
        if filters.is_empty() {
            return true;
        }
        filters.iter().any(|clause| {
            clause.conditions.iter().all(|(field, expected)| field_as_string(record, field) == *expected)
        })
    }

    fn render(&self, record: &ExportableRecord) -> String {
        match self.record_format {
            RecordFormat::Csv => record_to_csv_row(record),
            RecordFormat::Json => {
                let value = record_to_json(record);
                if self.pretty_print {
                    serde_json::to_string_pretty(&value).unwrap_or_default()
                } else {
                    serde_json::to_string(&value).unwrap_or_default()
                }
            }
        }
    }

    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        if self.file.is_none() {
            self.open_file()?;
        }
        let bytes = line.as_bytes();
        let file = self.file.as_mut().expect("opened above");
        file.write_all(bytes)?;
        file.write_all(b"\n")?;
        self.current_size += bytes.len() as u64 + 1;
        if self.current_size >= self.max_size_bytes {
            self.rotate()?;
        }
        Ok(())
    }
}

fn now_timestamp() -> u64 {
    SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn gzip_file_in_place(path: &Path) -> std::io::Result<()> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let data = fs::read(path)?;
    let gz_path = format!("{}.gz", path.display());
    let mut encoder = GzEncoder::new(File::create(&gz_path)?, Compression::default());
    encoder.write_all(&data)?;
    encoder.finish()?;
    fs::remove_file(path)?;
    Ok(())
}

fn prune_backups(base_path: &Path, max_backups: u32, max_age: Duration) -> std::io::Result<()> {
    let parent = base_path.parent().unwrap_or_else(|| Path::new("."));
    let stem = base_path.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();
    let mut backups: Vec<(PathBuf, SystemTime)> = Vec::new();

    if let Ok(entries) = fs::read_dir(parent) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&stem) && name.as_ref() != stem {
                if let Ok(meta) = entry.metadata() {
                    if let Ok(modified) = meta.modified() {
                        backups.push((entry.path(), modified));
                    }
                }
            }
        }
    }

    backups.sort_by_key(|(_, modified)| std::cmp::Reverse(*modified));

    let now = SystemTime::now();
    for (idx, (path, modified)) in backups.iter().enumerate() {
        let too_old = max_age > Duration::ZERO && now.duration_since(*modified).unwrap_or_default() > max_age;
        let too_many = max_backups > 0 && idx as u32 >= max_backups;
        if too_old || too_many {
            let _ = fs::remove_file(path);
        }
    }

    Ok(())
}

fn field_as_string(record: &ExportableRecord, field: &str) -> String {
    match field {
        "sourcePodName" => record.fields.get_string(Ie::SourcePodName),
        "destinationPodName" => record.fields.get_string(Ie::DestinationPodName),
        "sourcePodNamespace" => record.fields.get_string(Ie::SourcePodNamespace),
        "destinationPodNamespace" => record.fields.get_string(Ie::DestinationPodNamespace),
        "sourceNodeName" => record.fields.get_string(Ie::SourceNodeName),
        "destinationNodeName" => record.fields.get_string(Ie::DestinationNodeName),
        "flowType" => record.fields.get_u8(Ie::FlowType).to_string(),
        "protocolIdentifier" => record.fields.get_u8(Ie::ProtocolIdentifier).to_string(),
        _ => String::new(),
    }
}

/// Shared CSV rendering, also used by the S3 sink's file format.
pub fn record_to_csv_row(record: &ExportableRecord) -> String {
    let f = &record.fields;
    format!(
        "{},{},{},{},{},{},{},{},{}",
        f.source_address().map(|a| a.to_string()).unwrap_or_default(),
        f.destination_address().map(|a| a.to_string()).unwrap_or_default(),
        f.get_u32(Ie::SourceTransportPort),
        f.get_u32(Ie::DestinationTransportPort),
        f.get_u8(Ie::ProtocolIdentifier),
        f.get_u64(Ie::OctetDeltaCount),
        f.get_u64(Ie::PacketDeltaCount),
        f.get_u8(Ie::FlowDirection),
        f.get_string(Ie::ClusterId),
    )
}

fn record_to_json(record: &ExportableRecord) -> serde_json::Value {
    let f = &record.fields;
    serde_json::json!({
        "sourceAddress": f.source_address().map(|a| a.to_string()),
        "destinationAddress": f.destination_address().map(|a| a.to_string()),
        "sourceTransportPort": f.get_u32(Ie::SourceTransportPort),
        "destinationTransportPort": f.get_u32(Ie::DestinationTransportPort),
        "protocolIdentifier": f.get_u8(Ie::ProtocolIdentifier),
        "octetDeltaCount": f.get_u64(Ie::OctetDeltaCount),
        "packetDeltaCount": f.get_u64(Ie::PacketDeltaCount),
        "sourcePodName": f.get_string(Ie::SourcePodName),
        "destinationPodName": f.get_string(Ie::DestinationPodName),
        "flowDirection": f.get_u8(Ie::FlowDirection),
        "clusterId": f.get_string(Ie::ClusterId),
        "isFinal": record.is_final,
    })
}

#[async_trait]
impl super::Exporter for LogExporter {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn start(&mut self) -> Result<(), AggregatorError> {
        self.open_file().map_err(AggregatorError::Io)?;
        info!("Log exporter writing to {}", self.path.display());
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
        }
        self.file = None;
    }

    async fn add_record(&mut self, record: &ExportableRecord) -> Result<(), AggregatorError> {
        if !Self::passes_filters(record, &self.filters) {
            return Ok(());
        }
        let line = self.render(record);
        self.write_line(&line).map_err(AggregatorError::Io)
    }

    async fn flush(&mut self) -> Result<(), AggregatorError> {
        if let Some(file) = self.file.as_mut() {
            file.flush().map_err(AggregatorError::Io)?;
        }
        Ok(())
    }

    async fn update_options(&mut self, options: &Options) {
        let opts = &options.flow_logger;
        self.max_size_bytes = opts.max_size.saturating_mul(1024 * 1024).max(1);
        self.max_backups = opts.max_backups;
        self.max_age = Duration::from_secs(u64::from(opts.max_age) * 24 * 3600);
        self.compress = opts.compress;
        self.record_format = opts.record_format;
        self.filters = opts.filters.clone();
        self.pretty_print = opts.pretty_print;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipfix::record::FlowRecord;
    use std::net::IpAddr;

    fn sample_record() -> ExportableRecord {
        let mut fields = FlowRecord::new();
        fields.set(Ie::SourceIPv4Address, crate::ipfix::FieldValue::Ipv4(std::net::Ipv4Addr::new(10, 0, 0, 1)));
        fields.set(Ie::SourcePodName, crate::ipfix::FieldValue::String("web-1".into()));
        ExportableRecord {
            fields,
            record_time: SystemTime::now(),
            exporter_address: "10.0.0.1".parse::<IpAddr>().unwrap(),
            observation_domain_id: 1,
            is_final: true,
        }
    }

    #[test]
    fn filter_matches_on_pod_name() {
        let clause = FilterClause { conditions: [("sourcePodName".to_string(), "web-1".to_string())].into_iter().collect() };
        assert!(LogExporter::passes_filters(&sample_record(), &[clause]));
    }

    #[test]
    fn filter_rejects_non_matching_clause() {
        let clause = FilterClause { conditions: [("sourcePodName".to_string(), "other".to_string())].into_iter().collect() };
        assert!(!LogExporter::passes_filters(&sample_record(), &[clause]));
    }

    #[test]
    fn no_filters_means_everything_passes() {
        assert!(LogExporter::passes_filters(&sample_record(), &[]));
    }
}
