//! The configuration snapshot (spec §3 "Config snapshot", §6 "Config file").
//!
//! Shaped after the teacher's `utils.rs::Settings` (one struct per config
//! section, `#[derive(Deserialize)]`, loaded once and frozen), but sourced
//! from YAML instead of the teacher's `config`-crate `.ini` merge, since the
//! spec's config file is YAML and reloadable rather than a static merge of
//! defaults + environment.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{AggregatorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Mode {
    Aggregate,
    Proxy,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Aggregate
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregatorTransportProtocol {
    Tls,
    Tcp,
    Udp,
    None,
}

impl Default for AggregatorTransportProtocol {
    fn default() -> Self {
        AggregatorTransportProtocol::Tls
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RecordContents {
    pub pod_labels: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiServer {
    pub api_port: u16,
    pub tls_cipher_suites: Vec<String>,
    pub tls_min_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TlsOptions {
    pub enable: bool,
    pub ca_cert: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub server_name: Option<String>,
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordFormat {
    Json,
    Csv,
}

impl Default for RecordFormat {
    fn default() -> Self {
        RecordFormat::Csv
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct FlowCollectorOptions {
    pub enable: bool,
    pub address: String,
    pub observation_domain_id: u32,
    pub record_format: RecordFormat,
    #[serde(with = "humantime_serde", default = "default_template_refresh")]
    pub template_refresh_timeout: Duration,
    pub max_ipfix_msg_size: u32,
    pub tls: TlsOptions,
    pub include_k8s_names: bool,
    pub include_k8s_uids: bool,
}

fn default_template_refresh() -> Duration {
    Duration::from_secs(600)
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ClickHouseOptions {
    pub enable: bool,
    pub database: String,
    pub database_url: String,
    pub tls: TlsOptions,
    pub debug: bool,
    pub compress: bool,
    #[serde(with = "humantime_serde", default = "default_commit_interval")]
    pub commit_interval: Duration,
}

fn default_commit_interval() -> Duration {
    Duration::from_secs(8)
}

/// Lower bound named in the spec's boundary-behaviour tests: commitInterval
/// below this is clamped up, never rejected outright.
pub const CLICKHOUSE_MIN_COMMIT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct S3UploaderOptions {
    pub enable: bool,
    pub bucket_name: String,
    pub bucket_prefix: String,
    pub region: String,
    pub record_format: RecordFormat,
    pub compress: bool,
    pub max_records_per_file: u32,
    #[serde(with = "humantime_serde", default = "default_upload_interval")]
    pub upload_interval: Duration,
}

fn default_upload_interval() -> Duration {
    Duration::from_secs(60)
}

/// One OR-branch of a log-exporter filter: all conditions within a clause are
/// ANDed, field name -> exact string match against the record's rendered
/// field value.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
pub struct FilterClause {
    #[serde(flatten)]
    pub conditions: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct FlowLoggerOptions {
    pub enable: bool,
    pub path: PathBuf,
    pub max_size: u64,
    pub max_backups: u32,
    pub max_age: u32,
    pub compress: bool,
    pub record_format: RecordFormat,
    pub filters: Vec<FilterClause>,
    pub pretty_print: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Options {
    pub mode: Mode,
    #[serde(with = "humantime_serde", default = "default_active_timeout")]
    pub active_flow_record_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_inactive_timeout")]
    pub inactive_flow_record_timeout: Duration,
    pub aggregator_transport_protocol: AggregatorTransportProtocol,
    pub flow_aggregator_address: String,
    pub record_contents: RecordContents,
    pub api_server: ApiServer,
    pub flow_collector: FlowCollectorOptions,
    pub click_house: ClickHouseOptions,
    pub s3_uploader: S3UploaderOptions,
    pub flow_logger: FlowLoggerOptions,
    pub cluster_id: String,
}

fn default_active_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_inactive_timeout() -> Duration {
    Duration::from_secs(90)
}

impl Default for Options {
    fn default() -> Self {
        Options {
            mode: Mode::default(),
            active_flow_record_timeout: default_active_timeout(),
            inactive_flow_record_timeout: default_inactive_timeout(),
            aggregator_transport_protocol: AggregatorTransportProtocol::default(),
            flow_aggregator_address: "0.0.0.0:4739".to_string(),
            record_contents: RecordContents::default(),
            api_server: ApiServer::default(),
            flow_collector: FlowCollectorOptions::default(),
            click_house: ClickHouseOptions::default(),
            s3_uploader: S3UploaderOptions::default(),
            flow_logger: FlowLoggerOptions::default(),
            cluster_id: String::new(),
        }
    }
}

impl Options {
    /// Load, parse and validate a config snapshot. A `ConfigInvalid` error
    /// here at startup is fatal (spec §7); the caller decides that policy.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| AggregatorError::ConfigInvalid(format!("cannot read {}: {e}", path.display())))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let mut opts: Options = serde_yaml::from_str(raw).map_err(|e| AggregatorError::ConfigInvalid(format!("cannot parse config: {e}")))?;
        opts.normalize_and_validate()?;
        Ok(opts)
    }

    /// Clamp and reject per the boundary rules named in spec §8.
    fn normalize_and_validate(&mut self) -> Result<()> {
        if self.active_flow_record_timeout.is_zero() {
            return Err(AggregatorError::ConfigInvalid("activeFlowRecordTimeout must be > 0".into()));
        }
        if self.inactive_flow_record_timeout.is_zero() {
            return Err(AggregatorError::ConfigInvalid("inactiveFlowRecordTimeout must be > 0".into()));
        }
        if self.click_house.commit_interval < CLICKHOUSE_MIN_COMMIT_INTERVAL {
            self.click_house.commit_interval = CLICKHOUSE_MIN_COMMIT_INTERVAL;
        }
        if self.flow_collector.enable && self.flow_collector.max_ipfix_msg_size == 0 {
            self.flow_collector.max_ipfix_msg_size = self.default_ipfix_msg_size();
        }
        if self.s3_uploader.enable && self.s3_uploader.bucket_name.is_empty() {
            return Err(AggregatorError::ConfigInvalid("s3Uploader.bucketName is required when s3Uploader.enable is true".into()));
        }
        if self.click_house.enable && self.click_house.database_url.is_empty() {
            return Err(AggregatorError::ConfigInvalid("clickHouse.databaseURL is required when clickHouse.enable is true".into()));
        }
        Ok(())
    }

    fn default_ipfix_msg_size(&self) -> u32 {
        match self.aggregator_transport_protocol {
            AggregatorTransportProtocol::Udp => 512,
            _ => 65535,
        }
    }

    /// Returns `self` with every startup-fixed field replaced by `prior`'s
    /// value (spec §4.7: attempts to change them are "ignored", not merely
    /// logged). Everything else — including apiServer, which is itself
    /// fixed and therefore always copied too — comes from `self`.
    pub fn with_fixed_fields_from(mut self, prior: &Options) -> Options {
        self.mode = prior.mode;
        self.active_flow_record_timeout = prior.active_flow_record_timeout;
        self.inactive_flow_record_timeout = prior.inactive_flow_record_timeout;
        self.aggregator_transport_protocol = prior.aggregator_transport_protocol;
        self.flow_aggregator_address = prior.flow_aggregator_address.clone();
        self.api_server = prior.api_server.clone();
        self
    }

    /// Fields that are fixed at process startup (spec §4.7): any difference
    /// here between an old and new snapshot must be logged and ignored by the
    /// reconciler, never applied.
    pub fn startup_fixed_fields_differ(&self, other: &Options) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.mode != other.mode {
            changed.push("mode");
        }
        if self.active_flow_record_timeout != other.active_flow_record_timeout {
            changed.push("activeFlowRecordTimeout");
        }
        if self.inactive_flow_record_timeout != other.inactive_flow_record_timeout {
            changed.push("inactiveFlowRecordTimeout");
        }
        if self.aggregator_transport_protocol != other.aggregator_transport_protocol {
            changed.push("aggregatorTransportProtocol");
        }
        if self.flow_aggregator_address != other.flow_aggregator_address {
            changed.push("flowAggregatorAddress");
        }
        if self.api_server != other.api_server {
            changed.push("apiServer");
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let mut opts = Options::default();
        opts.normalize_and_validate().unwrap();
        assert_eq!(opts.active_flow_record_timeout, Duration::from_secs(60));
    }

    #[test]
    fn commit_interval_is_clamped_up() {
        let raw = r#"
mode: Aggregate
clickHouse:
  enable: true
  databaseURL: "tcp://ch:9000"
  commitInterval: "200ms"
"#;
        let opts = Options::parse(raw).unwrap();
        assert_eq!(opts.click_house.commit_interval, CLICKHOUSE_MIN_COMMIT_INTERVAL);
    }

    #[test]
    fn max_ipfix_msg_size_zero_selects_default_for_transport() {
        let raw = r#"
mode: Proxy
aggregatorTransportProtocol: udp
flowCollector:
  enable: true
  address: "127.0.0.1:4739:udp"
  maxIPFIXMsgSize: 0
"#;
        let opts = Options::parse(raw).unwrap();
        assert_eq!(opts.flow_collector.max_ipfix_msg_size, 512);
    }

    #[test]
    fn s3_enabled_without_bucket_is_rejected() {
        let raw = r#"
s3Uploader:
  enable: true
"#;
        assert!(Options::parse(raw).is_err());
    }

    #[test]
    fn identical_snapshots_have_no_startup_field_diff() {
        let a = Options::default();
        let b = Options::default();
        assert!(a.startup_fixed_fields_differ(&b).is_empty());
        assert_eq!(a, b);
    }

    #[test]
    fn mode_change_is_reported_as_startup_fixed() {
        let a = Options::default();
        let mut b = Options::default();
        b.mode = Mode::Proxy;
        assert_eq!(a.startup_fixed_fields_differ(&b), vec!["mode"]);
    }
}
