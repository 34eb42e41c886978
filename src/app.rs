//! Wires every component together (spec §5 "concurrency & resource model"):
//! one `tokio::task::JoinHandle` per actor, a single `CancellationToken`
//! driving shutdown, bounded channels between every stage.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::aggregation::ExportableRecord;
use crate::certs::{self, ClusterCerts};
use crate::config::options::{AggregatorTransportProtocol, Mode, Options};
use crate::config::watcher::{ConfigUpdate, ConfigWatcher};
use crate::enrich;
use crate::error::AggregatorError;
use crate::exporter::ExporterManager;
use crate::metrics::Metrics;
use crate::pipeline::{IngestedRecord, CHANNEL_CAPACITY};
use crate::podstore::PodStore;
use crate::{aggregation, collector, grpc, k8s, preprocessor};

/// Upper bound on how long shutdown is allowed to take once cancellation is
/// requested (spec §5 "A bounded shutdown deadline (default 30 s) applies").
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Pod entries are GC'd this long after their endTime (spec §3).
const POD_GC_THRESHOLD: Duration = Duration::from_secs(300);

/// Margin of tolerance for clock skew between a node's agent and the pod
/// watcher's view of startTime (spec §4.3).
const CLOCK_SKEW_MARGIN: Duration = Duration::from_secs(30);

pub async fn run(config_path: std::path::PathBuf) -> Result<(), AggregatorError> {
    let initial_raw = std::fs::read_to_string(&config_path)
        .map_err(|e| AggregatorError::ConfigInvalid(format!("cannot read {}: {e}", config_path.display())))?;
    let options = Options::parse(&initial_raw)?;

    let metrics = Arc::new(Metrics::new());
    let cancel = CancellationToken::new();
    let mut handles = Vec::new();

    let certs = certs::generate(&options.flow_aggregator_address, &service_dns_names())?;
    let namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| "kube-system".to_string());

    let kube_client = match kube::Client::try_default().await {
        Ok(client) => Some(client),
        Err(e) => {
            warn!("Could not build a Kubernetes client, pod enrichment and cert publishing are disabled: {}", e);
            None
        }
    };

    if let Some(client) = &kube_client {
        if let Err(e) = k8s::secrets::publish_ca_configmap(client.clone(), &namespace, &certs.ca.cert_pem).await {
            error!("Failed to publish CA ConfigMap: {}", e);
        }
        if let Err(e) = k8s::secrets::publish_client_secret(client.clone(), &namespace, &certs).await {
            error!("Failed to publish client Secret: {}", e);
        }
        if let Err(e) = k8s::secrets::publish_config_configmap(client.clone(), &namespace, &initial_raw).await {
            error!("Failed to publish configuration ConfigMap: {}", e);
        }
    }

    let pod_store = Arc::new(PodStore::new(CLOCK_SKEW_MARGIN));
    if let Some(client) = kube_client.clone() {
        let pod_store = pod_store.clone();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            crate::podstore::watcher::run(client, pod_store, POD_GC_THRESHOLD, cancel).await;
        }));
    } else {
        pod_store.mark_synced();
    }

    let (ingest_tx, ingest_rx) = mpsc::channel::<IngestedRecord>(CHANNEL_CAPACITY);
    spawn_collector(&options, &certs, ingest_tx.clone(), metrics.clone(), cancel.clone(), &mut handles)?;
    spawn_grpc(&options, &certs, ingest_tx, metrics.clone(), cancel.clone(), &mut handles);

    let (normalized_tx, normalized_rx) = mpsc::channel::<IngestedRecord>(CHANNEL_CAPACITY);
    {
        let metrics = metrics.clone();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            preprocessor::run(ingest_rx, normalized_tx, metrics, cancel).await;
        }));
    }

    let (export_tx, export_rx) = mpsc::channel::<ExportableRecord>(CHANNEL_CAPACITY);
    let enricher_options = enrich::options_from(options.record_contents.pod_labels, options.cluster_id.clone());

    {
        let pod_store = pod_store.clone();
        let cancel = cancel.clone();
        enrich::wait_for_pod_sync(&pod_store, &cancel).await;
    }

    match options.mode {
        Mode::Proxy => {
            let pod_store = pod_store.clone();
            let cancel = cancel.clone();
            let tx = export_tx.clone();
            handles.push(tokio::spawn(async move {
                enrich::run_proxy(normalized_rx, tx, pod_store, enricher_options, cancel).await;
            }));
        }
        Mode::Aggregate => {
            let (enriched_tx, enriched_rx) = mpsc::channel::<IngestedRecord>(CHANNEL_CAPACITY);
            {
                let pod_store = pod_store.clone();
                let cancel = cancel.clone();
                handles.push(tokio::spawn(async move {
                    enrich::run(normalized_rx, enriched_tx, pod_store, enricher_options, cancel).await;
                }));
            }
            let active_timeout = options.active_flow_record_timeout;
            let inactive_timeout = options.inactive_flow_record_timeout;
            let metrics = metrics.clone();
            let cancel = cancel.clone();
            let tx = export_tx.clone();
            handles.push(tokio::spawn(async move {
                aggregation::run(enriched_rx, tx, active_timeout, inactive_timeout, metrics, cancel).await;
            }));
        }
    }
    drop(export_tx);

    let manager = Arc::new(ExporterManager::new(metrics.clone()));
    let (config_tx, config_rx) = mpsc::channel::<ConfigUpdate>(4);
    {
        let manager = manager.clone();
        let cancel = cancel.clone();
        let current = options.clone();
        handles.push(tokio::spawn(async move {
            crate::exporter::run(export_rx, manager, config_rx, current, cancel).await;
        }));
    }

    if options.api_server.api_port > 0 {
        let addr = SocketAddr::new(IpAddr::from([0, 0, 0, 0]), options.api_server.api_port);
        let metrics = metrics.clone();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = crate::metrics::serve(addr, metrics, cancel).await {
                error!("Metrics server exited: {}", e);
            }
        }));
    }

    {
        let watcher = ConfigWatcher::new(config_path, initial_raw);
        let cancel = cancel.clone();
        let config_tx = config_tx.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = watcher.run(config_tx, cancel.clone()).await {
                error!("Config watcher failed irrecoverably: {}", e);
                cancel.cancel();
            }
        }));
    }

    wait_for_shutdown_signal().await;
    info!("Shutdown signal received, stopping all tasks");
    cancel.cancel();
    drop(config_tx);

    let join_all = futures_join_all(handles);
    if tokio::time::timeout(SHUTDOWN_DEADLINE, join_all).await.is_err() {
        warn!("Shutdown deadline of {:?} exceeded, abandoning remaining tasks", SHUTDOWN_DEADLINE);
    }

    Ok(())
}

async fn futures_join_all(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}

fn spawn_collector(
    options: &Options,
    certs: &ClusterCerts,
    tx: mpsc::Sender<IngestedRecord>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
    handles: &mut Vec<tokio::task::JoinHandle<()>>,
) -> Result<(), AggregatorError> {
    if options.aggregator_transport_protocol == AggregatorTransportProtocol::None {
        return Ok(());
    }
    let addr: SocketAddr = options
        .flow_aggregator_address
        .parse()
        .map_err(|e| AggregatorError::ConfigInvalid(format!("invalid flowAggregatorAddress {}: {e}", options.flow_aggregator_address)))?;

    match options.aggregator_transport_protocol {
        AggregatorTransportProtocol::Udp => {
            let template_refresh = options.flow_collector.template_refresh_timeout;
            handles.push(tokio::spawn(async move {
                if let Err(e) = collector::udp::run(addr, template_refresh, tx, metrics, cancel).await {
                    error!("UDP collector exited: {}", e);
                }
            }));
        }
        AggregatorTransportProtocol::Tcp => {
            handles.push(tokio::spawn(async move {
                if let Err(e) = collector::tcp::run(addr, tx, metrics, cancel).await {
                    error!("TCP collector exited: {}", e);
                }
            }));
        }
        AggregatorTransportProtocol::Tls => {
            let acceptor = crate::tls::acceptor(certs)?;
            handles.push(tokio::spawn(async move {
                if let Err(e) = collector::tls::run(addr, acceptor, tx, metrics, cancel).await {
                    error!("TLS collector exited: {}", e);
                }
            }));
        }
        AggregatorTransportProtocol::None => unreachable!(),
    }
    Ok(())
}

fn spawn_grpc(
    options: &Options,
    certs: &ClusterCerts,
    tx: mpsc::Sender<IngestedRecord>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
    handles: &mut Vec<tokio::task::JoinHandle<()>>,
) {
    let host: IpAddr = options
        .flow_aggregator_address
        .parse::<SocketAddr>()
        .map(|a| a.ip())
        .unwrap_or_else(|_| IpAddr::from([0, 0, 0, 0]));
    let addr = SocketAddr::new(host, grpc::GRPC_PORT);
    let identity = crate::tls::tonic_identity(certs);
    let client_ca = crate::tls::tonic_client_ca(certs);

    handles.push(tokio::spawn(async move {
        if let Err(e) = grpc::run(addr, identity, client_ca, tx, metrics, cancel).await {
            error!("gRPC ingest exited: {}", e);
        }
    }));
}

fn service_dns_names() -> Vec<String> {
    vec!["flow-aggregator.kube-system.svc".to_string(), "flow-aggregator.kube-system.svc.cluster.local".to_string()]
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
