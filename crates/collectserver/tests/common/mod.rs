// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use collectserver::batch::Batch;
use collectserver::errors::SinkError;
use collectserver::sink::Sink;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Polls `check` until it holds, failing the test after five seconds.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

#[derive(Default)]
pub struct RecordingSink {
    delivered: Mutex<Vec<Batch>>,
    notify: Notify,
}

impl RecordingSink {
    pub fn batches(&self) -> Vec<Batch> {
        self.delivered.lock().unwrap().clone()
    }

    pub async fn wait_for(&self, count: usize) -> Vec<Batch> {
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let notified = self.notify.notified();
                let batches = self.batches();
                if batches.len() >= count {
                    return batches;
                }
                notified.await;
            }
        })
        .await;
        waited.unwrap_or_else(|_| panic!("timed out waiting for {count} batches"))
    }
}

#[async_trait]
impl Sink for RecordingSink {
    async fn deliver(&self, batch: &Batch) -> Result<(), SinkError> {
        self.delivered.lock().unwrap().push(batch.clone());
        self.notify.notify_waiters();
        Ok(())
    }
}

pub struct Identity {
    pub cert: CertificateDer<'static>,
    pub key: PrivateKeyDer<'static>,
}

/// A CA written to disk, a client identity it signed, and one signed by an unrelated CA.
pub struct TlsMaterials {
    pub ca_pem: PathBuf,
    pub ca_key: PathBuf,
    pub client: Identity,
    pub stranger: Identity,
    _dir: tempfile::TempDir,
}

struct Authority {
    cert: rcgen::Certificate,
    key: KeyPair,
}

fn authority(name: &str) -> Authority {
    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, name);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let key = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    Authority { cert, key }
}

fn client_identity(issuer: &Authority, name: &str) -> Identity {
    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, name);
    params.is_ca = IsCa::NoCa;
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    let key = KeyPair::generate().unwrap();
    let cert = params.signed_by(&key, &issuer.cert, &issuer.key).unwrap();
    Identity {
        cert: cert.der().clone(),
        key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
    }
}

pub fn generate_tls_materials() -> TlsMaterials {
    let dir = tempfile::tempdir().unwrap();
    let ca = authority("collectserver-test-ca");
    let other = authority("someone-else");

    let ca_pem = dir.path().join("ca.pem");
    let ca_key = dir.path().join("ca.key");
    std::fs::write(&ca_pem, ca.cert.pem()).unwrap();
    std::fs::write(&ca_key, ca.key.serialize_pem()).unwrap();

    TlsMaterials {
        ca_pem,
        ca_key,
        client: client_identity(&ca, "client"),
        stranger: client_identity(&other, "stranger"),
        _dir: dir,
    }
}

/// The server presents its CA certificate, so clients skip server verification.
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

pub fn client_config(identity: Option<&Identity>) -> Arc<ClientConfig> {
    let provider = Arc::new(ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .unwrap()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)));
    let config = match identity {
        Some(id) => builder
            .with_client_auth_cert(vec![id.cert.clone()], id.key.clone_key())
            .unwrap(),
        None => builder.with_no_client_auth(),
    };
    Arc::new(config)
}

pub async fn tls_connect(
    addr: std::net::SocketAddr,
    identity: Option<&Identity>,
) -> std::io::Result<TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(addr).await?;
    let server_name = ServerName::try_from("localhost").unwrap();
    TlsConnector::from(client_config(identity))
        .connect(server_name, tcp)
        .await
}
