//! Self-signed CA/server/client certificate lifecycle (spec §4.8, C8).
//! Runs once at startup; rotation is out of scope, a restart regenerates
//! everything from scratch.

use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, KeyUsagePurpose};

use crate::error::AggregatorError;

/// A generated cert/key pair in both DER (for rustls/tonic) and PEM (for
/// publishing to a ConfigMap/Secret) form.
pub struct CertMaterial {
    pub cert_der: Vec<u8>,
    pub cert_pem: String,
    pub key_der: Vec<u8>,
    pub key_pem: String,
}

pub struct ClusterCerts {
    pub ca: CertMaterial,
    pub server: CertMaterial,
    pub client: CertMaterial,
}

fn cert_err(context: &str, e: rcgen::Error) -> AggregatorError {
    AggregatorError::CertGeneration(format!("{context}: {e}"))
}

fn ca_params() -> Result<CertificateParams, rcgen::Error> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "flow-aggregator-ca");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    Ok(params)
}

fn leaf_params(common_name: &str, sans: Vec<String>) -> Result<CertificateParams, rcgen::Error> {
    let mut params = CertificateParams::new(sans)?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;
    params.is_ca = IsCa::NoCa;
    Ok(params)
}

/// Generates the CA, server (SAN = `flow_aggregator_address` and the service
/// DNS names), and client certificates for one run (spec §4.8 steps 1-3).
pub fn generate(flow_aggregator_address: &str, service_dns_names: &[String]) -> Result<ClusterCerts, AggregatorError> {
    let ca_key = KeyPair::generate().map_err(|e| cert_err("generating CA key", e))?;
    let ca_cert = ca_params()
        .map_err(|e| cert_err("building CA params", e))?
        .self_signed(&ca_key)
        .map_err(|e| cert_err("self-signing CA cert", e))?;
    let ca = CertMaterial {
        cert_der: ca_cert.der().to_vec(),
        cert_pem: ca_cert.pem(),
        key_der: ca_key.serialize_der(),
        key_pem: ca_key.serialize_pem(),
    };

    let mut server_sans = service_dns_names.to_vec();
    server_sans.push(flow_aggregator_address.to_string());
    let server_key = KeyPair::generate().map_err(|e| cert_err("generating server key", e))?;
    let server_cert = leaf_params("flow-aggregator", server_sans)
        .map_err(|e| cert_err("building server params", e))?
        .signed_by(&server_key, &ca_cert, &ca_key)
        .map_err(|e| cert_err("signing server cert", e))?;
    let server = CertMaterial {
        cert_der: server_cert.der().to_vec(),
        cert_pem: server_cert.pem(),
        key_der: server_key.serialize_der(),
        key_pem: server_key.serialize_pem(),
    };

    let client_key = KeyPair::generate().map_err(|e| cert_err("generating client key", e))?;
    let client_cert = leaf_params("flow-aggregator-client", Vec::new())
        .map_err(|e| cert_err("building client params", e))?
        .signed_by(&client_key, &ca_cert, &ca_key)
        .map_err(|e| cert_err("signing client cert", e))?;
    let client = CertMaterial {
        cert_der: client_cert.der().to_vec(),
        cert_pem: client_cert.pem(),
        key_der: client_key.serialize_der(),
        key_pem: client_key.serialize_pem(),
    };

    Ok(ClusterCerts { ca, server, client })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_three_distinct_certs() {
        let certs = generate("flow-aggregator.kube-system.svc", &["flow-aggregator.kube-system.svc.cluster.local".to_string()]).unwrap();
        assert_ne!(certs.ca.cert_pem, certs.server.cert_pem);
        assert_ne!(certs.server.cert_pem, certs.client.cert_pem);
        assert!(certs.ca.cert_pem.starts_with("-----BEGIN CERTIFICATE-----"));
    }
}
