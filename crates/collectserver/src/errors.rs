// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types, and the asynchronous channel runtime failures are reported on.
//!
//! Only configuration and bind failures are returned to callers. Everything that goes wrong
//! once the pipeline runs (sink failures, journal trouble, lost batches) is sent to an
//! [`ErrorReporter`] and logged by the [`ErrorDrain`] task. Reporting never blocks: when the
//! channel is full the error is dropped and counted.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::event::Protocol;
use crate::stats::{incr, Stats};

#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("unsupported collector protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("failed to resolve {protocol} address {addr}: {source}")]
    AddressResolution {
        protocol: Protocol,
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("TLS is not supported by the {0} collector")]
    TlsNotSupported(Protocol),

    #[error("failed to bind {protocol} collector to {addr}: {source}")]
    Bind {
        protocol: Protocol,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("{0} collector already started")]
    AlreadyStarted(Protocol),
}

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid CA certificate: {0}")]
    Certificate(String),

    #[error("invalid CA private key: {0}")]
    PrivateKey(String),

    #[error("failed to build TLS configuration: {0}")]
    Config(#[from] rustls::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("journal I/O on {path:?} failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize journal record: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("corrupt journal record {path:?}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl JournalError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        JournalError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("sink unreachable: {0}")]
    Unreachable(String),

    #[error("sink rejected batch with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("sink did not answer within {0:?}")]
    Timeout(Duration),

    #[error("failed to prepare payload: {0}")]
    Payload(String),
}

#[derive(Debug, thiserror::Error)]
pub enum BatcherError {
    #[error("invalid batcher configuration: {0}")]
    InvalidConfig(String),

    #[error("data directory {path:?} is not usable: {source}")]
    DataDir {
        path: PathBuf,
        #[source]
        source: JournalError,
    },

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error("delivery of batch {batch_id} failed (attempt {attempts}): {source}")]
    Delivery {
        batch_id: u64,
        attempts: u32,
        #[source]
        source: SinkError,
    },

    #[error("batch {batch_id} with {events} events was lost: {source}")]
    BatchLost {
        batch_id: u64,
        events: usize,
        #[source]
        source: JournalError,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("failed to resolve monitor address {addr}: {source}")]
    AddressResolution {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind monitor endpoint to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Creates the runtime error channel: cheap-to-clone reporters and the single drain.
pub fn error_channel(capacity: usize, stats: Arc<Stats>) -> (ErrorReporter, ErrorDrain) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ErrorReporter { tx, stats }, ErrorDrain { rx })
}

#[derive(Clone, Debug)]
pub struct ErrorReporter {
    tx: mpsc::Sender<BatcherError>,
    stats: Arc<Stats>,
}

impl ErrorReporter {
    /// Queues `err` for the drain. Never waits; a full or closed channel drops the error.
    /// A dropped `BatchLost` is logged here instead, so data loss is never silent.
    pub fn report(&self, err: BatcherError) {
        if let Err(e) = self.tx.try_send(err) {
            incr(&self.stats.errors_dropped);
            let (reason, err) = match e {
                mpsc::error::TrySendError::Full(err) => ("full", err),
                mpsc::error::TrySendError::Closed(err) => ("closed", err),
            };
            if matches!(err, BatcherError::BatchLost { .. }) {
                log_error(&err);
            } else {
                debug!("Error channel {reason}, dropping: {err}");
            }
        }
    }
}

/// Consumer side of the error channel.
pub struct ErrorDrain {
    rx: mpsc::Receiver<BatcherError>,
}

impl ErrorDrain {
    /// Takes the next reported error, for callers that consume the channel themselves.
    pub async fn next(&mut self) -> Option<BatcherError> {
        self.rx.recv().await
    }

    /// Logs errors until every reporter is gone or `cancel` fires. On cancellation, errors
    /// already queued are still logged.
    pub async fn run(mut self, cancel: CancellationToken) {
        debug!("Error drain started");
        loop {
            tokio::select! {
                maybe_err = self.rx.recv() => match maybe_err {
                    Some(err) => log_error(&err),
                    None => break,
                },
                () = cancel.cancelled() => {
                    self.rx.close();
                    while let Some(err) = self.rx.recv().await {
                        log_error(&err);
                    }
                    break;
                }
            }
        }
        debug!("Error drain stopped");
    }
}

fn log_error(err: &BatcherError) {
    match err {
        BatcherError::BatchLost { .. } => error!("DATA LOSS: {err}"),
        BatcherError::Delivery { .. } => warn!("{err}"),
        _ => error!("{err}"),
    }
}
