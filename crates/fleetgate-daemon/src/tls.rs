//! mTLS plumbing for the device gateway.
//!
//! The gateway terminates TLS itself: client certificates are verified
//! against `certs/cas.pem` when presented, and the accepted peer's
//! identity (CN as device uuid, `businessCategory` RDN for the production
//! flag, SPKI as PEM) is attached to every request on that connection.

use std::sync::Arc;

use axum::Extension;
use axum::Router;
use base64::Engine;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::service::TowerToHyperService;
use rustls::pki_types::CertificateDer;
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::gateway::PeerIdentity;

/// `businessCategory` (X.520), not parsed into a named accessor by the
/// subject API.
const BUSINESS_CATEGORY_OID: x509_parser::der_parser::Oid<'static> =
    x509_parser::der_parser::oid!(2.5.4.15);
const BUSINESS_CATEGORY_PRODUCTION: &str = "production";

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("unable to read {name}: {source}")]
    ReadFile {
        name: &'static str,
        #[source]
        source: fleetgate_core::fs::FsError,
    },

    #[error("malformed PEM data in {0}")]
    MalformedPem(&'static str),

    #[error("TLS configuration error: {0}")]
    Config(String),

    #[error("unable to parse peer certificate: {0}")]
    PeerCert(String),
}

/// Builds the gateway's server config: our key pair plus verify-if-given
/// client auth against the factory CAs.
pub fn load_server_config(
    certs: &fleetgate_core::fs::CertsFsHandle,
) -> Result<rustls::ServerConfig, TlsError> {
    let cas_pem = certs
        .read_file(fleetgate_core::fs::CERTS_CAS_PEM_FILE)
        .map_err(|source| TlsError::ReadFile {
            name: "cas.pem",
            source,
        })?;
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut cas_pem.as_slice()) {
        let cert = cert.map_err(|_| TlsError::MalformedPem("cas.pem"))?;
        roots
            .add(cert)
            .map_err(|e| TlsError::Config(format!("unable to add CA cert: {e}")))?;
    }

    let chain_pem = certs
        .read_file(fleetgate_core::fs::CERTS_TLS_PEM_FILE)
        .map_err(|source| TlsError::ReadFile {
            name: "tls.pem",
            source,
        })?;
    let chain = rustls_pemfile::certs(&mut chain_pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| TlsError::MalformedPem("tls.pem"))?;

    let key_pem = certs
        .read_file(fleetgate_core::fs::CERTS_TLS_KEY_FILE)
        .map_err(|source| TlsError::ReadFile {
            name: "tls.key",
            source,
        })?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|_| TlsError::MalformedPem("tls.key"))?
        .ok_or(TlsError::MalformedPem("tls.key"))?;

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .allow_unauthenticated()
        .build()
        .map_err(|e| TlsError::Config(format!("unable to build client verifier: {e}")))?;

    rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(chain, key)
        .map_err(|e| TlsError::Config(format!("unable to load server key pair: {e}")))
}

/// Extracts the device identity from a peer certificate.
pub fn peer_identity(cert: &CertificateDer<'_>) -> Result<PeerIdentity, TlsError> {
    let (_, parsed) = X509Certificate::from_der(cert.as_ref())
        .map_err(|e| TlsError::PeerCert(e.to_string()))?;

    let uuid = parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
        .ok_or_else(|| TlsError::PeerCert("certificate carries no CN".into()))?;

    let business_category = parsed
        .subject()
        .iter_attributes()
        .find(|attr| *attr.attr_type() == BUSINESS_CATEGORY_OID)
        .and_then(|attr| attr.as_str().ok());
    let is_prod = business_category == Some(BUSINESS_CATEGORY_PRODUCTION);

    let pubkey_pem = pem_encode("PUBLIC KEY", parsed.public_key().raw);

    Ok(PeerIdentity {
        uuid,
        is_prod,
        pubkey_pem,
    })
}

fn pem_encode(label: &str, der: &[u8]) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(der);
    let mut out = format!("-----BEGIN {label}-----\n");
    for chunk in encoded.as_bytes().chunks(64) {
        out.push_str(std::str::from_utf8(chunk).unwrap_or(""));
        out.push('\n');
    }
    out.push_str("-----END ");
    out.push_str(label);
    out.push_str("-----\n");
    out
}

/// Accept loop of the gateway. Each connection gets its peer identity
/// stamped onto the router as an extension; handshake or identity
/// failures drop the connection (a device without a usable certificate
/// has nothing to say here).
pub async fn serve_mtls(
    listener: TcpListener,
    tls_config: Arc<rustls::ServerConfig>,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) {
    let acceptor = TlsAcceptor::from(tls_config);
    let mut connections = tokio::task::JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "failed to accept gateway connection");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let router = router.clone();
                let mut conn_shutdown = shutdown.clone();
                connections.spawn(async move {
                    let tls = match acceptor.accept(stream).await {
                        Ok(tls) => tls,
                        Err(e) => {
                            debug!(peer = %peer_addr, error = %e, "gateway TLS handshake failed");
                            return;
                        }
                    };

                    let identity = tls
                        .get_ref()
                        .1
                        .peer_certificates()
                        .and_then(|certs| certs.first())
                        .map(peer_identity);
                    let router = match identity {
                        Some(Ok(identity)) => router.layer(Extension(identity)),
                        Some(Err(e)) => {
                            warn!(peer = %peer_addr, error = %e, "unable to extract device identity");
                            router
                        }
                        None => router,
                    };

                    let service = TowerToHyperService::new(router);
                    let builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
                    let conn = builder.serve_connection(TokioIo::new(tls), service);
                    tokio::select! {
                        res = conn => {
                            if let Err(e) = res {
                                debug!(peer = %peer_addr, error = %e, "gateway connection ended with error");
                            }
                        }
                        _ = conn_shutdown.changed() => {}
                    }
                });
            }
        }
    }

    // Drain in-flight connections; the caller bounds the overall shutdown.
    while connections.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pem_encoding_wraps_lines() {
        let pem = pem_encode("PUBLIC KEY", &[0u8; 100]);
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----\n"));
        assert!(pem.ends_with("-----END PUBLIC KEY-----\n"));
        for line in pem.lines().filter(|l| !l.starts_with("-----")) {
            assert!(line.len() <= 64);
        }
    }

    #[test]
    fn identity_from_generated_certificate() {
        let mut params = rcgen::CertificateParams::new(vec![]).unwrap();
        params.distinguished_name = rcgen::DistinguishedName::new();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "device-uuid-1");
        params.distinguished_name.push(
            rcgen::DnType::CustomDnType(vec![2, 5, 4, 15]),
            rcgen::DnValue::Utf8String(BUSINESS_CATEGORY_PRODUCTION.to_string()),
        );
        let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let cert = params.self_signed(&key).unwrap();

        let identity = peer_identity(cert.der()).unwrap();
        assert_eq!(identity.uuid, "device-uuid-1");
        assert!(identity.is_prod);
        assert!(identity.pubkey_pem.starts_with("-----BEGIN PUBLIC KEY-----"));
    }

    #[test]
    fn non_production_category_is_ci() {
        let mut params = rcgen::CertificateParams::new(vec![]).unwrap();
        params.distinguished_name = rcgen::DistinguishedName::new();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "device-uuid-2");
        let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let cert = params.self_signed(&key).unwrap();

        let identity = peer_identity(cert.der()).unwrap();
        assert!(!identity.is_prod);
    }
}
