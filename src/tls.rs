//! rustls/tonic configuration helpers bridging C8's generated certificates
//! (`certs.rs`) into the collector's mTLS listener and the gRPC ingest's mTLS
//! server (spec §4.1, §4.8), plus the client-side TLS config the external
//! IPFIX sink builds from its own configured CA/cert/key (spec §6).

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, Error as RustlsError, RootCertStore, ServerConfig, SignatureScheme};
use rustls_pemfile::Item;
use tokio_rustls::TlsAcceptor;

use crate::certs::{CertMaterial, ClusterCerts};
use crate::config::options::TlsOptions;
use crate::error::AggregatorError;

fn cert_chain(material: &CertMaterial) -> Vec<rustls::pki_types::CertificateDer<'static>> {
    vec![rustls::pki_types::CertificateDer::from(material.cert_der.clone())]
}

fn private_key(material: &CertMaterial) -> Result<rustls::pki_types::PrivateKeyDer<'static>, AggregatorError> {
    private_key_from_pem(&material.key_pem)
}

fn private_key_from_pem(pem: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>, AggregatorError> {
    let mut reader = pem.as_bytes();
    match rustls_pemfile::read_one(&mut reader).map_err(AggregatorError::Io)? {
        Some(Item::Pkcs8Key(key)) => Ok(rustls::pki_types::PrivateKeyDer::Pkcs8(key)),
        Some(Item::Pkcs1Key(key)) => Ok(rustls::pki_types::PrivateKeyDer::Pkcs1(key)),
        _ => Err(AggregatorError::CertGeneration("key is not a recognized PKCS#8/PKCS#1 key".into())),
    }
}

/// Builds the mTLS acceptor the collector's TLS listener hands every
/// accepted connection to: server identity from C8, client certs verified
/// against the same CA (spec §4.1 "requires client certs signed by the same
/// CA").
pub fn acceptor(certs: &ClusterCerts) -> Result<TlsAcceptor, AggregatorError> {
    let mut roots = RootCertStore::empty();
    roots
        .add(rustls::pki_types::CertificateDer::from(certs.ca.cert_der.clone()))
        .map_err(|e| AggregatorError::CertGeneration(format!("adding CA to root store: {e}")))?;

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| AggregatorError::CertGeneration(format!("building client verifier: {e}")))?;

    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(cert_chain(&certs.server), private_key(&certs.server)?)
        .map_err(|e| AggregatorError::CertGeneration(format!("building server TLS config: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// The identity/CA pair the gRPC ingest's `tonic::transport::ServerTlsConfig`
/// needs (spec §6 "Internal RPC... mTLS"). tonic speaks PEM, not rustls
/// types, so this hands over the PEM form directly rather than re-deriving
/// it from the rustls config above.
pub fn tonic_identity(certs: &ClusterCerts) -> tonic::transport::Identity {
    tonic::transport::Identity::from_pem(certs.server.cert_pem.clone(), certs.server.key_pem.clone())
}

pub fn tonic_client_ca(certs: &ClusterCerts) -> tonic::transport::Certificate {
    tonic::transport::Certificate::from_pem(certs.ca.cert_pem.clone())
}

fn load_cert_chain(path: &std::path::Path) -> Result<Vec<CertificateDer<'static>>, AggregatorError> {
    let bytes = std::fs::read(path).map_err(AggregatorError::Io)?;
    let mut reader = bytes.as_slice();
    rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(AggregatorError::Io)
}

fn load_private_key(path: &std::path::Path) -> Result<PrivateKeyDer<'static>, AggregatorError> {
    let pem = std::fs::read_to_string(path).map_err(AggregatorError::Io)?;
    private_key_from_pem(&pem)
}

/// Always reports the peer's certificate as valid. Used only when
/// `flowCollector.tls.insecureSkipVerify` is set (spec §6).
#[derive(Debug)]
struct NoServerAuth;

impl ServerCertVerifier for NoServerAuth {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(&self, _message: &[u8], _cert: &CertificateDer<'_>, _dss: &DigitallySignedStruct) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(&self, _message: &[u8], _cert: &CertificateDer<'_>, _dss: &DigitallySignedStruct) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider().signature_verification_algorithms.supported_schemes()
    }
}

/// Builds the client TLS config for the external IPFIX sink (spec §6 "optional
/// TLS with optional mTLS"). Unlike [`acceptor`], this reads trust material
/// from the paths the operator configured rather than from C8's self-issued
/// cluster CA - the external collector is not expected to trust our CA.
pub fn client_config(opts: &TlsOptions) -> Result<Arc<ClientConfig>, AggregatorError> {
    let verifier_builder = if opts.insecure_skip_verify {
        ClientConfig::builder().dangerous().with_custom_certificate_verifier(Arc::new(NoServerAuth))
    } else {
        let ca_path = opts
            .ca_cert
            .as_ref()
            .ok_or_else(|| AggregatorError::ConfigInvalid("flowCollector.tls.caCert is required unless insecureSkipVerify is set".into()))?;
        let mut roots = RootCertStore::empty();
        for cert in load_cert_chain(ca_path)? {
            roots.add(cert).map_err(|e| AggregatorError::CertGeneration(format!("adding configured CA to root store: {e}")))?;
        }
        ClientConfig::builder().with_root_certificates(roots)
    };

    let config = match (&opts.cert, &opts.key) {
        (Some(cert_path), Some(key_path)) => verifier_builder
            .with_client_auth_cert(load_cert_chain(cert_path)?, load_private_key(key_path)?)
            .map_err(|e| AggregatorError::CertGeneration(format!("building client TLS config: {e}")))?,
        _ => verifier_builder.with_no_client_auth(),
    };

    Ok(Arc::new(config))
}
