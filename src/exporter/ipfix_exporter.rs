//! External IPFIX sink (spec §4.6 "External IPFIX").

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use exponential_backoff::Backoff;
use log::{debug, info, warn};
use rustls::pki_types::ServerName;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::aggregation::ExportableRecord;
use crate::config::options::{FlowCollectorOptions, Options};
use crate::error::AggregatorError;
use crate::ipfix::canonical::{canonical_fields, CANONICAL_IPV4_TEMPLATE_ID, CANONICAL_IPV6_TEMPLATE_ID};
use crate::ipfix::codec::encode_message;
use crate::tls;

enum Transport {
    Udp(UdpSocket),
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

pub struct IpfixExporter {
    destination: String,
    proto: DestinationProto,
    server_name: String,
    tls_config: Option<Arc<rustls::ClientConfig>>,
    template_refresh_timeout: Duration,
    max_msg_size: usize,
    transport: Option<Transport>,
    backoff: Backoff,
    backoff_attempt: u32,
    backing_off_until: Option<Instant>,
    last_template_sent: Option<Instant>,
    sequence_number: u32,
    pending: Vec<ExportableRecord>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum DestinationProto {
    Tcp,
    Udp,
    Tls,
}

/// Spec §6: the export destination is `IP:port[:proto]`. The optional
/// trailing `:tcp`/`:udp` selects this sink's own transport and has nothing
/// to do with the ingest listener's `aggregatorTransportProtocol`.
fn parse_destination(raw: &str) -> (String, Option<DestinationProto>) {
    match raw.rsplit_once(':') {
        Some((host_port, "tcp")) => (host_port.to_string(), Some(DestinationProto::Tcp)),
        Some((host_port, "udp")) => (host_port.to_string(), Some(DestinationProto::Udp)),
        _ => (raw.to_string(), None),
    }
}

fn host_only(destination: &str) -> String {
    destination.rsplit_once(':').map(|(host, _)| host.trim_start_matches('[').trim_end_matches(']').to_string()).unwrap_or_else(|| destination.to_string())
}

fn resolve_tls_config(opts: &FlowCollectorOptions) -> Option<Arc<rustls::ClientConfig>> {
    if !opts.tls.enable {
        return None;
    }
    match tls::client_config(&opts.tls) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            warn!("IPFIX exporter TLS configuration invalid, connections will fail until corrected: {e}");
            None
        }
    }
}

impl IpfixExporter {
    pub fn new(options: &Options) -> Self {
        let opts: &FlowCollectorOptions = &options.flow_collector;
        let (destination, suffix_proto) = parse_destination(&opts.address);
        let proto = if opts.tls.enable { DestinationProto::Tls } else { suffix_proto.unwrap_or(DestinationProto::Tcp) };
        let server_name = opts.tls.server_name.clone().unwrap_or_else(|| host_only(&destination));
        IpfixExporter {
            destination,
            proto,
            server_name,
            tls_config: resolve_tls_config(opts),
            template_refresh_timeout: opts.template_refresh_timeout,
            max_msg_size: opts.max_ipfix_msg_size.max(1) as usize,
            transport: None,
            backoff: Backoff::new(8, Duration::from_millis(200), Duration::from_secs(30)),
            backoff_attempt: 0,
            backing_off_until: None,
            last_template_sent: None,
            sequence_number: 0,
            pending: Vec::new(),
        }
    }

    fn in_backoff(&self) -> bool {
        self.backing_off_until.is_some_and(|deadline| Instant::now() < deadline)
    }

    fn enter_backoff(&mut self) {
        self.backoff_attempt += 1;
        let delay = self.backoff.iter().nth(self.backoff_attempt as usize - 1).unwrap_or(Duration::from_secs(30));
        self.backing_off_until = Some(Instant::now() + delay);
        self.transport = None;
        warn!("IPFIX exporter to {} backing off for {:?}", self.destination, delay);
    }

    async fn ensure_connected(&mut self) -> Result<(), AggregatorError> {
        if self.transport.is_some() {
            return Ok(());
        }
        let result = match self.proto {
            DestinationProto::Udp => self.connect_udp().await.map(Transport::Udp),
            DestinationProto::Tcp => TcpStream::connect(&self.destination).await.map(Transport::Tcp),
            DestinationProto::Tls => self.connect_tls().await,
        };
        let transport = match result {
            Ok(t) => t,
            Err(e) => {
                self.enter_backoff();
                return Err(io_err(&self.destination, e));
            }
        };
        self.transport = Some(transport);
        self.backoff_attempt = 0;
        self.backing_off_until = None;
        self.last_template_sent = None;
        info!("IPFIX exporter connected to {}", self.destination);
        Ok(())
    }

    async fn connect_udp(&self) -> std::io::Result<UdpSocket> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(&self.destination).await?;
        Ok(socket)
    }

    async fn connect_tls(&self) -> std::io::Result<Transport> {
        let config = self
            .tls_config
            .clone()
            .ok_or_else(|| std::io::Error::other(format!("no valid TLS configuration for {}", self.destination)))?;
        let tcp = TcpStream::connect(&self.destination).await?;
        let server_name = ServerName::try_from(self.server_name.clone()).map_err(std::io::Error::other)?;
        let stream = TlsConnector::from(config).connect(server_name, tcp).await?;
        Ok(Transport::Tls(Box::new(stream)))
    }

    async fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match self.transport.as_mut().expect("ensure_connected called first") {
            Transport::Udp(socket) => {
                socket.send(bytes).await?;
            }
            Transport::Tcp(stream) => {
                stream.write_all(bytes).await?;
            }
            Transport::Tls(stream) => {
                stream.write_all(bytes).await?;
            }
        }
        Ok(())
    }

    fn needs_template_resend(&self) -> bool {
        match self.proto {
            DestinationProto::Udp => match self.last_template_sent {
                Some(t) => t.elapsed() >= self.template_refresh_timeout,
                None => true,
            },
            DestinationProto::Tcp | DestinationProto::Tls => self.last_template_sent.is_none(),
        }
    }

    async fn send_batch(&mut self) -> Result<(), AggregatorError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.ensure_connected().await?;

        let mut by_family: (Vec<&ExportableRecord>, Vec<&ExportableRecord>) = (Vec::new(), Vec::new());
        for record in &self.pending {
            if record.fields.is_ipv6() {
                by_family.1.push(record);
            } else {
                by_family.0.push(record);
            }
        }

        for (template_id, is_ipv6, records) in [(CANONICAL_IPV4_TEMPLATE_ID, false, &by_family.0), (CANONICAL_IPV6_TEMPLATE_ID, true, &by_family.1)] {
            if records.is_empty() {
                continue;
            }
            let include_template = self.needs_template_resend();
            let fields = canonical_fields(is_ipv6);
            let owned: Vec<_> = records.iter().map(|r| r.fields.clone()).collect();
            self.sequence_number = self.sequence_number.wrapping_add(1);
            let export_time = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs() as u32).unwrap_or(0);
            let msg = encode_message(1, self.sequence_number, export_time, template_id, fields, include_template, &owned);
            if msg.len() > self.max_msg_size {
                debug!("IPFIX batch to {} exceeds maxIPFIXMsgSize ({} > {}), sending anyway", self.destination, msg.len(), self.max_msg_size);
            }
            if let Err(e) = self.send(&msg).await {
                self.enter_backoff();
                return Err(io_err(&self.destination, e));
            }
            self.last_template_sent = Some(Instant::now());
        }

        self.pending.clear();
        Ok(())
    }
}

fn io_err(addr: &str, source: std::io::Error) -> AggregatorError {
    AggregatorError::TransientNetwork { addr: addr.to_string(), source }
}

#[async_trait]
impl super::Exporter for IpfixExporter {
    fn name(&self) -> &'static str {
        "ipfix"
    }

    async fn start(&mut self) -> Result<(), AggregatorError> {
        self.ensure_connected().await
    }

    async fn stop(&mut self) {
        let _ = self.flush().await;
        self.transport = None;
    }

    async fn add_record(&mut self, record: &ExportableRecord) -> Result<(), AggregatorError> {
        if self.in_backoff() {
            return Err(AggregatorError::Backoff);
        }
        self.pending.push(ExportableRecord {
            fields: record.fields.clone(),
            record_time: record.record_time,
            exporter_address: record.exporter_address,
            observation_domain_id: record.observation_domain_id,
            is_final: record.is_final,
        });
        if self.pending.len() >= 64 {
            self.send_batch().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), AggregatorError> {
        if self.in_backoff() {
            return Ok(());
        }
        self.send_batch().await
    }

    async fn update_options(&mut self, options: &Options) {
        let opts = &options.flow_collector;
        self.template_refresh_timeout = opts.template_refresh_timeout;
        self.max_msg_size = opts.max_ipfix_msg_size.max(1) as usize;

        let (destination, suffix_proto) = parse_destination(&opts.address);
        let proto = if opts.tls.enable { DestinationProto::Tls } else { suffix_proto.unwrap_or(DestinationProto::Tcp) };
        let server_name = opts.tls.server_name.clone().unwrap_or_else(|| host_only(&destination));

        if destination != self.destination || proto != self.proto || server_name != self.server_name {
            self.transport = None;
            self.last_template_sent = None;
        }
        self.destination = destination;
        self.proto = proto;
        self.server_name = server_name;
        self.tls_config = resolve_tls_config(opts);
    }
}
