// TLS profile plumbing
//
// Builds rustls server/client configurations from a TlsProfile. The same
// profile drives both directions: the acceptor presents the identity and
// optionally demands client certificates; the connector trusts the
// configured anchors and presents the identity under mutual TLS.

use crate::config::TlsProfile;
use crate::error::{ClusterError, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| ClusterError::Tls(format!("cannot open {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ClusterError::Tls(format!("bad certificate in {}: {}", path, e)))?;
    if certs.is_empty() {
        return Err(ClusterError::Tls(format!("no certificates in {}", path)));
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| ClusterError::Tls(format!("cannot open {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ClusterError::Tls(format!("bad private key in {}: {}", path, e)))?
        .ok_or_else(|| ClusterError::Tls(format!("no private key in {}", path)))
}

fn load_roots(path: &str) -> Result<RootCertStore> {
    let mut store = RootCertStore::empty();
    for cert in load_certs(path)? {
        store
            .add(cert)
            .map_err(|e| ClusterError::Tls(format!("bad trust anchor in {}: {}", path, e)))?;
    }
    Ok(store)
}

/// Server-side TLS from the profile.
pub fn build_acceptor(profile: &TlsProfile) -> Result<TlsAcceptor> {
    let certs = load_certs(&profile.identity_cert)?;
    let key = load_key(&profile.identity_key)?;

    let builder = rustls::ServerConfig::builder();
    let config = if profile.require_client_auth {
        let roots = load_roots(&profile.trust_anchors)?;
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| ClusterError::Tls(e.to_string()))?;
        builder
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
    } else {
        builder.with_no_client_auth().with_single_cert(certs, key)
    }
    .map_err(|e| ClusterError::Tls(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Client-side TLS from the profile.
pub fn build_connector(profile: &TlsProfile) -> Result<TlsConnector> {
    let roots = load_roots(&profile.trust_anchors)?;
    let builder = rustls::ClientConfig::builder().with_root_certificates(roots);

    let config = if profile.require_client_auth {
        let certs = load_certs(&profile.identity_cert)?;
        let key = load_key(&profile.identity_key)?;
        builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| ClusterError::Tls(e.to_string()))?
    } else {
        builder.with_no_client_auth()
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// SNI name for an outbound handshake.
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|e| ClusterError::Tls(format!("invalid server name '{}': {}", host, e)))
}
