//! Kubernetes pod watcher feeding `PodStore` (spec §4.3 "populated from
//! Kubernetes pod events"). Grounded in the pack's Kubernetes manifests
//! under `other_examples/` for the Pod shape; the watch itself uses `kube`'s
//! `runtime::watcher` helper the way `estuary-flow` uses `kube::Client` for
//! its own control-plane reads.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client};
use log::{error, info, warn};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use super::{PodSnapshotEntry, PodStore};

const GC_INTERVAL: Duration = Duration::from_secs(60);

pub async fn run(client: Client, store: Arc<PodStore>, gc_threshold: Duration, cancel: CancellationToken) {
    let api: Api<Pod> = Api::all(client);
    let mut stream = Box::pin(watcher::watcher(api, watcher::Config::default()).default_backoff());

    let mut gc_tick = tokio::time::interval(GC_INTERVAL);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = gc_tick.tick() => store.sweep(SystemTime::now(), gc_threshold),
            event = stream.next() => {
                match event {
                    Some(Ok(event)) => handle_event(event, &store),
                    Some(Err(e)) => warn!("Pod watch stream error: {}", e),
                    None => {
                        error!("Pod watch stream ended");
                        return;
                    }
                }
            }
        }
    }
}

fn handle_event(event: Event<Pod>, store: &PodStore) {
    match event {
        Event::Applied(pod) => apply_pod(pod, store),
        Event::Deleted(pod) => delete_pod(pod, store),
        Event::Restarted(pods) => {
            for pod in pods {
                apply_pod(pod, store);
            }
            info!("Pod watcher completed initial sync");
            store.mark_synced();
        }
    }
}

fn apply_pod(pod: Pod, store: &PodStore) {
    let Some(status) = pod.status.as_ref() else { return };
    let Some(pod_ip) = status.pod_ip.as_ref().and_then(|ip| ip.parse::<IpAddr>().ok()) else { return };
    let Some(meta_name) = pod.metadata.name.clone() else { return };
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
    let node_name = pod.spec.as_ref().and_then(|s| s.node_name.clone()).unwrap_or_default();
    let labels = pod.metadata.labels.clone().unwrap_or_default().into_iter().collect();
    let start_time = pod
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|t| SystemTime::from(t.0))
        .unwrap_or_else(SystemTime::now);

    store.upsert(PodSnapshotEntry { ip: pod_ip, pod_name: meta_name, pod_namespace: namespace, node_name, labels, start_time, end_time: None });
}

fn delete_pod(pod: Pod, store: &PodStore) {
    let Some(status) = pod.status.as_ref() else { return };
    let Some(pod_ip) = status.pod_ip.as_ref().and_then(|ip| ip.parse::<IpAddr>().ok()) else { return };
    let Some(name) = pod.metadata.name.clone() else { return };
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
    store.close(pod_ip, &name, &namespace, SystemTime::now());
}
