//! Publishes C8's certificate material and the live configuration to
//! well-known Kubernetes objects (spec §4.8 step 4, §6 "Persisted state").
//! Applied with server-side apply so re-running at startup after a restart
//! converges rather than erroring on an existing object.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, Patch, PatchParams};
use kube::Client;

use crate::certs::ClusterCerts;
use crate::error::AggregatorError;

const FIELD_MANAGER: &str = "flow-aggregator";

pub const CA_CONFIGMAP_NAME: &str = "flow-aggregator-ca";
pub const CLIENT_SECRET_NAME: &str = "flow-aggregator-client-tls";
pub const CONFIG_CONFIGMAP_NAME: &str = "flow-aggregator-configuration";

fn apply_params() -> PatchParams {
    PatchParams::apply(FIELD_MANAGER).force()
}

/// Publishes the CA certificate so node-local agents can fetch it to verify
/// the aggregator's server cert (spec §4.8 step 4).
pub async fn publish_ca_configmap(client: Client, namespace: &str, ca_cert_pem: &str) -> Result<(), AggregatorError> {
    let api: Api<ConfigMap> = Api::namespaced(client, namespace);
    let mut data = BTreeMap::new();
    data.insert("ca.crt".to_string(), ca_cert_pem.to_string());
    let configmap = ConfigMap {
        metadata: kube::api::ObjectMeta { name: Some(CA_CONFIGMAP_NAME.to_string()), ..Default::default() },
        data: Some(data),
        ..Default::default()
    };
    api.patch(CA_CONFIGMAP_NAME, &apply_params(), &Patch::Apply(&configmap)).await?;
    Ok(())
}

/// Publishes the client key+cert so agents can authenticate the gRPC ingest
/// and mTLS collector endpoint (spec §4.8 step 4).
pub async fn publish_client_secret(client: Client, namespace: &str, certs: &ClusterCerts) -> Result<(), AggregatorError> {
    let api: Api<Secret> = Api::namespaced(client, namespace);
    let mut string_data = BTreeMap::new();
    string_data.insert("tls.crt".to_string(), certs.client.cert_pem.clone());
    string_data.insert("tls.key".to_string(), certs.client.key_pem.clone());
    string_data.insert("ca.crt".to_string(), certs.ca.cert_pem.clone());
    let secret = Secret {
        metadata: kube::api::ObjectMeta { name: Some(CLIENT_SECRET_NAME.to_string()), ..Default::default() },
        string_data: Some(string_data),
        type_: Some("kubernetes.io/tls".to_string()),
        ..Default::default()
    };
    api.patch(CLIENT_SECRET_NAME, &apply_params(), &Patch::Apply(&secret)).await?;
    Ok(())
}

/// Publishes the current effective configuration for operator visibility
/// (spec §6 "a ConfigMap holding the current flow-aggregator configuration").
pub async fn publish_config_configmap(client: Client, namespace: &str, config_yaml: &str) -> Result<(), AggregatorError> {
    let api: Api<ConfigMap> = Api::namespaced(client, namespace);
    let mut data = BTreeMap::new();
    data.insert("flow-aggregator.conf".to_string(), config_yaml.to_string());
    let configmap = ConfigMap {
        metadata: kube::api::ObjectMeta { name: Some(CONFIG_CONFIGMAP_NAME.to_string()), ..Default::default() },
        data: Some(data),
        ..Default::default()
    };
    api.patch(CONFIG_CONFIGMAP_NAME, &apply_params(), &Patch::Apply(&configmap)).await?;
    Ok(())
}
