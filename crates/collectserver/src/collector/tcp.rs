// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! TCP collector: one task per connection, newline-delimited frames, optional mutual TLS.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::constants::{
    MAX_FRAME_SIZE, TCP_READ_BUFFER_SIZE, TCP_READ_TIMEOUT, TLS_HANDSHAKE_TIMEOUT,
};
use crate::errors::CollectorError;
use crate::event::{Event, EventSender, Protocol};
use crate::stats::{incr, Stats};

pub struct TcpCollector {
    addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    stats: Arc<Stats>,
    read_timeout: Duration,
    handshake_timeout: Duration,
    local_addr: Option<SocketAddr>,
    task: Option<JoinHandle<()>>,
}

impl TcpCollector {
    pub fn new(addr: SocketAddr, tls: Option<Arc<rustls::ServerConfig>>) -> Self {
        TcpCollector {
            addr,
            tls: tls.map(TlsAcceptor::from),
            stats: Arc::new(Stats::default()),
            read_timeout: TCP_READ_TIMEOUT,
            handshake_timeout: TLS_HANDSHAKE_TIMEOUT,
            local_addr: None,
            task: None,
        }
    }

    #[must_use]
    pub fn with_stats(mut self, stats: Arc<Stats>) -> Self {
        self.stats = stats;
        self
    }

    /// Idle time after which a silent connection is closed.
    #[must_use]
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    #[must_use]
    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.local_addr.unwrap_or(self.addr)
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub async fn start(
        &mut self,
        output: EventSender,
        cancel: CancellationToken,
    ) -> Result<(), CollectorError> {
        if self.task.is_some() {
            return Err(CollectorError::AlreadyStarted(Protocol::Tcp));
        }
        let bind_error = |source| CollectorError::Bind {
            protocol: Protocol::Tcp,
            addr: self.addr,
            source,
        };
        let listener = TcpListener::bind(self.addr).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;
        info!(
            "TCP collector listening on {} (tls: {})",
            local_addr,
            self.tls.is_some()
        );

        let handler = Arc::new(ConnectionHandler {
            tls: self.tls.clone(),
            stats: Arc::clone(&self.stats),
            read_timeout: self.read_timeout,
            handshake_timeout: self.handshake_timeout,
        });
        self.local_addr = Some(local_addr);
        self.task = Some(tokio::spawn(accept_loop(listener, handler, output, cancel)));
        Ok(())
    }

    pub async fn stopped(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("TCP collector task failed: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for TcpCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpCollector")
            .field("addr", &self.addr())
            .field("tls", &self.tls.is_some())
            .field("running", &self.task.is_some())
            .finish()
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<ConnectionHandler>,
    output: EventSender,
    cancel: CancellationToken,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    incr(&handler.stats.tcp_connections);
                    debug!("Accepted TCP connection from {}", peer);
                    connections.spawn(Arc::clone(&handler).serve(
                        stream,
                        peer,
                        output.clone(),
                        cancel.clone(),
                    ));
                }
                Err(e) => {
                    let Some(pause) = super::accept_error_backoff(&e) else {
                        debug!("TCP accept failed: {}", e);
                        continue;
                    };
                    warn!("TCP accept failed, retrying in {:?}: {}", pause, e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
            },
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                log_join_result(finished);
            }
        }
    }

    drop(listener);
    while let Some(finished) = connections.join_next().await {
        log_join_result(finished);
    }
    debug!("TCP collector stopped");
}

fn log_join_result(finished: Result<(), tokio::task::JoinError>) {
    if let Err(e) = finished {
        if e.is_panic() {
            error!("TCP connection task panicked: {}", e);
        }
    }
}

struct ConnectionHandler {
    tls: Option<TlsAcceptor>,
    stats: Arc<Stats>,
    read_timeout: Duration,
    handshake_timeout: Duration,
}

impl ConnectionHandler {
    async fn serve(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        output: EventSender,
        cancel: CancellationToken,
    ) {
        let Some(acceptor) = &self.tls else {
            self.read_frames(stream, peer, &output, &cancel).await;
            return;
        };

        let handshake = tokio::time::timeout(self.handshake_timeout, acceptor.accept(stream));
        let tls_stream = tokio::select! {
            _ = cancel.cancelled() => return,
            result = handshake => match result {
                Ok(Ok(tls_stream)) => tls_stream,
                Ok(Err(e)) => {
                    incr(&self.stats.tls_handshake_failures);
                    warn!("TLS handshake with {} failed: {}", peer, e);
                    return;
                }
                Err(_) => {
                    incr(&self.stats.tls_handshake_failures);
                    warn!(
                        "TLS handshake with {} timed out after {:?}",
                        peer, self.handshake_timeout
                    );
                    return;
                }
            },
        };
        self.read_frames(tls_stream, peer, &output, &cancel).await;
    }

    /// Reads until EOF, idle timeout, read error or cancellation, publishing one event per
    /// frame. Whatever is buffered when the connection ends is published as a last frame.
    async fn read_frames<R: AsyncRead + Unpin>(
        &self,
        mut reader: R,
        peer: SocketAddr,
        output: &EventSender,
        cancel: &CancellationToken,
    ) {
        let mut buf = [0u8; TCP_READ_BUFFER_SIZE];
        let mut framer = LineFramer::default();
        let mut frames = Vec::new();

        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = tokio::time::timeout(self.read_timeout, reader.read(&mut buf)) => read,
            };
            match read {
                Ok(Ok(0)) => {
                    trace!("Connection from {} closed by peer", peer);
                    break;
                }
                Ok(Ok(n)) => framer.push(&buf[..n], &mut frames),
                Ok(Err(e)) => {
                    incr(&self.stats.tcp_read_errors);
                    debug!("Read from {} failed: {}", peer, e);
                    break;
                }
                Err(_) => {
                    debug!(
                        "Connection from {} idle for {:?}, closing",
                        peer, self.read_timeout
                    );
                    break;
                }
            }
            if !self.publish(frames.drain(..), peer, output).await {
                return;
            }
        }

        if let Some(rest) = framer.finish() {
            self.publish(std::iter::once(rest), peer, output).await;
        }
    }

    /// Returns false once the event channel is closed.
    async fn publish(
        &self,
        frames: impl Iterator<Item = Vec<u8>>,
        peer: SocketAddr,
        output: &EventSender,
    ) -> bool {
        for frame in frames {
            incr(&self.stats.tcp_events);
            if output.send(Event::new(Protocol::Tcp, peer, frame)).await.is_err() {
                debug!("Event channel closed, dropping connection from {}", peer);
                return false;
            }
        }
        true
    }
}

/// Splits a byte stream on `\n`. A trailing `\r` is stripped, empty lines are skipped, and a
/// line that grows past [`MAX_FRAME_SIZE`] is cut into frames of that size.
#[derive(Debug, Default)]
struct LineFramer {
    pending: Vec<u8>,
}

impl LineFramer {
    fn push(&mut self, mut data: &[u8], out: &mut Vec<Vec<u8>>) {
        while let Some(pos) = data.iter().position(|&b| b == b'\n') {
            self.pending.extend_from_slice(&data[..pos]);
            self.cut_oversized(out);
            let mut line = std::mem::take(&mut self.pending);
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if !line.is_empty() {
                out.push(line);
            }
            data = &data[pos + 1..];
        }
        self.pending.extend_from_slice(data);
        self.cut_oversized(out);
    }

    fn cut_oversized(&mut self, out: &mut Vec<Vec<u8>>) {
        while self.pending.len() > MAX_FRAME_SIZE {
            let rest = self.pending.split_off(MAX_FRAME_SIZE);
            out.push(std::mem::replace(&mut self.pending, rest));
        }
    }

    fn finish(&mut self) -> Option<Vec<u8>> {
        let mut rest = std::mem::take(&mut self.pending);
        if rest.last() == Some(&b'\r') {
            rest.pop();
        }
        (!rest.is_empty()).then_some(rest)
    }
}
