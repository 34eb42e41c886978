//! Object-store sink (spec §4.6 "Object store (S3-compatible)"). Grounded
//! in `estuary-flow`'s use of the `aws-sdk-s3`/`aws-config` stack for its
//! own blob writes.

use std::io::Write;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{info, warn};

use crate::aggregation::ExportableRecord;
use crate::config::options::{Options, S3UploaderOptions};
use crate::error::AggregatorError;
use crate::exporter::log_exporter::record_to_csv_row;

pub struct S3Exporter {
    bucket_name: String,
    bucket_prefix: String,
    compress: bool,
    max_records_per_file: u32,
    upload_interval: Duration,
    client: Option<Client>,
    pending_rows: Vec<String>,
    last_upload: Instant,
}

impl S3Exporter {
    pub fn new(options: &Options) -> Self {
        let opts: &S3UploaderOptions = &options.s3_uploader;
        S3Exporter {
            bucket_name: opts.bucket_name.clone(),
            bucket_prefix: opts.bucket_prefix.clone(),
            compress: opts.compress,
            max_records_per_file: opts.max_records_per_file.max(1),
            upload_interval: opts.upload_interval,
            client: None,
            pending_rows: Vec::new(),
            last_upload: Instant::now(),
        }
    }

    async fn upload_pending(&mut self) -> Result<(), AggregatorError> {
        if self.pending_rows.is_empty() {
            return Ok(());
        }
        let Some(client) = self.client.as_ref() else {
            return Err(AggregatorError::TransientNetwork { addr: self.bucket_name.clone(), source: std::io::Error::other("s3 client not started") });
        };

        let mut body = String::from("sourceAddress,destinationAddress,sourcePort,destinationPort,protocolIdentifier,octetDeltaCount,packetDeltaCount,flowDirection,clusterId\n");
        for row in &self.pending_rows {
            body.push_str(row);
            body.push('\n');
        }

        let (bytes, ext) = if self.compress {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(body.as_bytes()).map_err(AggregatorError::Io)?;
            (encoder.finish().map_err(AggregatorError::Io)?, "csv.gz")
        } else {
            (body.into_bytes(), "csv")
        };

        let key = format!("{}/flows-{}-{}.{}", self.bucket_prefix, now_timestamp(), uuid::Uuid::new_v4(), ext);
        client
            .put_object()
            .bucket(&self.bucket_name)
            .key(&key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| AggregatorError::TransientNetwork { addr: self.bucket_name.clone(), source: std::io::Error::other(e.to_string()) })?;

        info!("Uploaded {} flow records to s3://{}/{}", self.pending_rows.len(), self.bucket_name, key);
        self.pending_rows.clear();
        self.last_upload = Instant::now();
        Ok(())
    }
}

fn now_timestamp() -> u64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[async_trait]
impl super::Exporter for S3Exporter {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn start(&mut self) -> Result<(), AggregatorError> {
        let config = aws_config::load_from_env().await;
        self.client = Some(Client::new(&config));
        Ok(())
    }

    async fn stop(&mut self) {
        // Upload a final partial file so no buffered rows are lost (spec §5
        // shutdown sequencing, §4.6 "a partial file is uploaded at shutdown").
        if let Err(e) = self.upload_pending().await {
            warn!("S3 exporter failed to upload final partial file: {}", e);
        }
        self.client = None;
    }

    async fn add_record(&mut self, record: &ExportableRecord) -> Result<(), AggregatorError> {
        self.pending_rows.push(record_to_csv_row(record));
        if self.pending_rows.len() as u32 >= self.max_records_per_file || self.last_upload.elapsed() >= self.upload_interval {
            self.upload_pending().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), AggregatorError> {
        self.upload_pending().await
    }

    async fn update_options(&mut self, options: &Options) {
        self.bucket_name = options.s3_uploader.bucket_name.clone();
        self.bucket_prefix = options.s3_uploader.bucket_prefix.clone();
        self.compress = options.s3_uploader.compress;
        self.max_records_per_file = options.s3_uploader.max_records_per_file.max(1);
        self.upload_interval = options.s3_uploader.upload_interval;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_with_empty_pending_buffer() {
        let exporter = S3Exporter::new(&Options::default());
        assert!(exporter.pending_rows.is_empty());
    }
}
