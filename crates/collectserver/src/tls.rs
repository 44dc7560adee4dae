// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mutual TLS for the TCP collector.
//!
//! A single CA certificate and its key serve two roles: the certificate the server presents,
//! and the only trust anchor for client certificates. Clients must present a certificate
//! chaining to it.

use std::path::Path;
use std::sync::Arc;

use rustls::crypto::ring;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use tracing::debug;

pub use rustls::ServerConfig;

use crate::errors::TlsError;

/// Builds a server config from a CA certificate and key, PEM or DER encoded.
pub fn load_server_config(ca_pem: &Path, ca_key: &Path) -> Result<Arc<ServerConfig>, TlsError> {
    let cert_bytes = read(ca_pem)?;
    let key_bytes = read(ca_key)?;
    let config = server_config(&cert_bytes, &key_bytes)?;
    debug!("Loaded TLS CA from {:?}", ca_pem);
    Ok(config)
}

pub fn server_config(ca_cert: &[u8], ca_key: &[u8]) -> Result<Arc<ServerConfig>, TlsError> {
    let cert = parse_certificate(ca_cert)?;
    let key = parse_private_key(ca_key)?;

    let mut roots = RootCertStore::empty();
    roots
        .add(cert.clone())
        .map_err(|e| TlsError::Certificate(e.to_string()))?;

    let provider = Arc::new(ring::default_provider());
    let verifier =
        WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
            .build()
            .map_err(|e| TlsError::Certificate(e.to_string()))?;

    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(verifier)
        .with_single_cert(vec![cert], key)?;
    Ok(Arc::new(config))
}

fn read(path: &Path) -> Result<Vec<u8>, TlsError> {
    std::fs::read(path).map_err(|source| TlsError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_certificate(bytes: &[u8]) -> Result<CertificateDer<'static>, TlsError> {
    match CertificateDer::from_pem_slice(bytes) {
        Ok(cert) => Ok(cert),
        Err(_) if looks_like_der(bytes) => Ok(CertificateDer::from(bytes.to_vec())),
        Err(e) => Err(TlsError::Certificate(e.to_string())),
    }
}

fn parse_private_key(bytes: &[u8]) -> Result<PrivateKeyDer<'static>, TlsError> {
    match PrivateKeyDer::from_pem_slice(bytes) {
        Ok(key) => Ok(key),
        Err(_) if looks_like_der(bytes) => PrivateKeyDer::try_from(bytes.to_vec())
            .map_err(|e| TlsError::PrivateKey(e.to_string())),
        Err(e) => Err(TlsError::PrivateKey(e.to_string())),
    }
}

// DER always opens with a SEQUENCE tag.
fn looks_like_der(bytes: &[u8]) -> bool {
    bytes.first() == Some(&0x30)
}
