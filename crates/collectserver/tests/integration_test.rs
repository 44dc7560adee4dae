// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use collectserver::flusher::RetryStrategy;
use collectserver::journal::Journal;
use collectserver::sink::{HttpSink, HttpSinkConfig};
use collectserver::stats::Stats;
use collectserver::{error_channel, tls, Batcher, BatcherConfig, Collector, Event, Protocol};
use common::{eventually, generate_tls_materials, tls_connect, RecordingSink};
use mockito::{Matcher, Server};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn batcher_config(dir: &tempfile::TempDir) -> BatcherConfig {
    BatcherConfig {
        data_dir: dir.path().to_path_buf(),
        retry_strategy: RetryStrategy::Immediate,
        ..BatcherConfig::default()
    }
}

async fn tls_collector(
    stats: &Arc<Stats>,
) -> (
    Collector,
    mpsc::Receiver<Event>,
    CancellationToken,
    common::TlsMaterials,
) {
    let materials = generate_tls_materials();
    let server_config = tls::load_server_config(&materials.ca_pem, &materials.ca_key).unwrap();
    let (tx, rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let mut collector = Collector::new("tcp", "127.0.0.1:0", Some(server_config))
        .unwrap()
        .with_stats(Arc::clone(stats));
    collector.start(tx, cancel.clone()).await.unwrap();
    (collector, rx, cancel, materials)
}

#[tokio::test]
async fn udp_datagrams_reach_http_sink() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/ingest")
        .match_body(Matcher::Regex(r#""payload":"<13>one".*"payload":"<13>two""#.to_string()))
        .with_status(202)
        .expect(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let stats = Arc::new(Stats::default());
    let (errors, _drain) = error_channel(64, Arc::clone(&stats));
    let sink = HttpSink::new(HttpSinkConfig {
        url: format!("{}/ingest", server.url()),
        timeout: Duration::from_secs(2),
        compression_level: None,
    })
    .unwrap();
    let batcher = Batcher::new(
        BatcherConfig {
            batch_size: 2,
            ..batcher_config(&dir)
        },
        Arc::new(sink),
        Arc::clone(&stats),
    );
    let cancel = CancellationToken::new();
    let mut collector = Collector::new("UDP", "127.0.0.1:0", None)
        .unwrap()
        .with_stats(Arc::clone(&stats));
    collector
        .start(batcher.sender(), cancel.clone())
        .await
        .unwrap();
    let handle = batcher.start(errors).await.unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"<13>one", collector.addr()).await.unwrap();
    client.send_to(b"<13>two", collector.addr()).await.unwrap();

    eventually("batch delivered", || {
        stats.batches_delivered.load(Ordering::Relaxed) == 1
    })
    .await;
    mock.assert_async().await;

    cancel.cancel();
    collector.stopped().await;
    assert!(handle.shutdown().await);
    assert!(Journal::open(dir.path()).await.unwrap().list().await.unwrap().is_empty());
}

#[tokio::test]
async fn tls_client_signed_by_ca_is_accepted() {
    let stats = Arc::new(Stats::default());
    let (mut collector, mut rx, cancel, materials) = tls_collector(&stats).await;

    let mut client = tls_connect(collector.addr(), Some(&materials.client))
        .await
        .unwrap();
    client.write_all(b"<14>over tls\n").await.unwrap();
    client.flush().await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.payload(), b"<14>over tls");
    assert_eq!(event.protocol(), Protocol::Tcp);
    assert_eq!(stats.tls_handshake_failures.load(Ordering::Relaxed), 0);

    cancel.cancel();
    collector.stopped().await;
}

#[tokio::test]
async fn tls_client_without_certificate_is_rejected() {
    let stats = Arc::new(Stats::default());
    let (mut collector, mut rx, cancel, _materials) = tls_collector(&stats).await;

    // Under TLS 1.3 the client may finish its side before the server rejects it.
    if let Ok(mut client) = tls_connect(collector.addr(), None).await {
        let _ = client.write_all(b"should never arrive\n").await;
        let _ = client.flush().await;
    }

    eventually("handshake failure", || {
        stats.tls_handshake_failures.load(Ordering::Relaxed) == 1
    })
    .await;
    assert!(tokio::time::timeout(Duration::from_millis(200), rx.recv())
        .await
        .is_err());

    cancel.cancel();
    collector.stopped().await;
}

#[tokio::test]
async fn tls_client_signed_by_other_ca_is_rejected() {
    let stats = Arc::new(Stats::default());
    let (mut collector, mut rx, cancel, materials) = tls_collector(&stats).await;

    if let Ok(mut client) = tls_connect(collector.addr(), Some(&materials.stranger)).await {
        let _ = client.write_all(b"should never arrive\n").await;
        let _ = client.flush().await;
    }

    eventually("handshake failure", || {
        stats.tls_handshake_failures.load(Ordering::Relaxed) == 1
    })
    .await;
    assert!(tokio::time::timeout(Duration::from_millis(200), rx.recv())
        .await
        .is_err());

    cancel.cancel();
    collector.stopped().await;
}

#[tokio::test]
async fn plain_tcp_accepts_any_client() {
    let (tx, mut rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let mut collector = Collector::new("tcp", "127.0.0.1:0", None).unwrap();
    collector.start(tx, cancel.clone()).await.unwrap();

    let mut client = TcpStream::connect(collector.addr()).await.unwrap();
    client.write_all(b"anyone\n").await.unwrap();
    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.payload(), b"anyone");

    cancel.cancel();
    collector.stopped().await;
}

#[tokio::test]
async fn shutdown_flushes_open_batch() {
    let dir = tempfile::tempdir().unwrap();
    let stats = Arc::new(Stats::default());
    let (errors, _drain) = error_channel(64, Arc::clone(&stats));
    let sink = Arc::new(RecordingSink::default());
    let batcher = Batcher::new(
        BatcherConfig {
            batch_size: 100,
            flush_interval: Duration::from_secs(3600),
            ..batcher_config(&dir)
        },
        sink.clone(),
        Arc::clone(&stats),
    );
    let cancel = CancellationToken::new();
    let mut collector = Collector::new("tcp", "127.0.0.1:0", None)
        .unwrap()
        .with_stats(Arc::clone(&stats));
    collector
        .start(batcher.sender(), cancel.clone())
        .await
        .unwrap();
    let handle = batcher.start(errors).await.unwrap();

    let mut client = TcpStream::connect(collector.addr()).await.unwrap();
    client.write_all(b"a\nb\nc\n").await.unwrap();
    eventually("three tcp events", || {
        stats.tcp_events.load(Ordering::Relaxed) == 3
    })
    .await;

    cancel.cancel();
    collector.stopped().await;
    assert!(handle.shutdown().await);

    let delivered = sink.batches();
    assert_eq!(delivered.len(), 1);
    let payloads: Vec<&[u8]> = delivered[0].events().iter().map(Event::payload).collect();
    assert_eq!(payloads, vec![&b"a"[..], b"b", b"c"]);
}

#[tokio::test]
async fn undeliverable_batches_are_replayed_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = Server::new_async().await;
    let url = format!("{}/ingest", server.url());
    let http_sink = |url: &str| {
        Arc::new(
            HttpSink::new(HttpSinkConfig {
                url: url.to_string(),
                timeout: Duration::from_secs(2),
                compression_level: None,
            })
            .unwrap(),
        )
    };

    // First run: the sink rejects everything.
    let failing = server
        .mock("POST", "/ingest")
        .with_status(503)
        .expect_at_least(2)
        .create_async()
        .await;
    let stats = Arc::new(Stats::default());
    let (errors, _drain) = error_channel(64, Arc::clone(&stats));
    let batcher = Batcher::new(
        BatcherConfig {
            batch_size: 1,
            retry_strategy: RetryStrategy::LinearBackoff(Duration::from_secs(3600)),
            ..batcher_config(&dir)
        },
        http_sink(&url),
        Arc::clone(&stats),
    );
    let tx = batcher.sender();
    let handle = batcher.start(errors).await.unwrap();
    let source = "192.0.2.7:601".parse().unwrap();
    tx.send(Event::new(Protocol::Tcp, source, b"first".to_vec()))
        .await
        .unwrap();
    tx.send(Event::new(Protocol::Tcp, source, b"second".to_vec()))
        .await
        .unwrap();
    eventually("two failed deliveries", || {
        stats.delivery_failures.load(Ordering::Relaxed) == 2
    })
    .await;
    drop(tx);
    assert!(handle.shutdown().await);
    failing.assert_async().await;
    failing.remove_async().await;

    let journal = Journal::open(dir.path()).await.unwrap();
    assert_eq!(journal.list().await.unwrap(), vec![1, 2]);
    let before = journal.read(1).await.unwrap().unwrap();
    assert_eq!(before.attempts(), 1);
    assert_eq!(before.events()[0].payload(), b"first");

    // Second run: the startup sweep delivers both records.
    let accepting = server
        .mock("POST", "/ingest")
        .with_status(200)
        .expect(2)
        .create_async()
        .await;
    let stats = Arc::new(Stats::default());
    let (errors, _drain) = error_channel(64, Arc::clone(&stats));
    let batcher = Batcher::new(batcher_config(&dir), http_sink(&url), Arc::clone(&stats));
    let handle = batcher.start(errors).await.unwrap();
    eventually("journal replayed", || {
        stats.records_recovered.load(Ordering::Relaxed) == 2
    })
    .await;
    assert!(handle.shutdown().await);
    accepting.assert_async().await;
    assert!(journal.list().await.unwrap().is_empty());
}
