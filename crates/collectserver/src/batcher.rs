// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The batching engine.
//!
//! Collectors publish on the channel returned by [`Batcher::sender`]. A single accumulation
//! task owns the open batch, seals it on size or timer, and hands sealed batches to the
//! [`Flusher`]. A second task runs the journal recovery sweep, once at startup and then every
//! `sweep_interval`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::batch::{Accumulator, Batch, SealReason};
use crate::constants::{
    DEFAULT_BATCH_DURATION, DEFAULT_BATCH_SIZE, DEFAULT_DATA_DIR, DEFAULT_DELIVERY_TIMEOUT,
    DEFAULT_MAX_PENDING, DEFAULT_SHUTDOWN_GRACE, DEFAULT_SWEEP_INTERVAL, EVENT_CHANNEL_CAPACITY,
};
use crate::errors::{BatcherError, ErrorReporter};
use crate::event::{EventReceiver, EventSender};
use crate::flusher::{log_recovered, Admission, Flusher, FlusherConfig, Origin, RetryStrategy};
use crate::journal::Journal;
use crate::sink::Sink;
use crate::stats::{incr, Stats};

#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Events per batch; the event that reaches it seals the batch.
    pub batch_size: usize,
    /// Maximum age of an open batch, counted from its first event.
    pub flush_interval: Duration,
    /// Maximum number of batches being delivered at once.
    pub max_pending: usize,
    /// Root of the overflow journal.
    pub data_dir: PathBuf,
    pub channel_capacity: usize,
    pub sweep_interval: Duration,
    pub delivery_timeout: Duration,
    pub shutdown_grace: Duration,
    pub retry_strategy: RetryStrategy,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        BatcherConfig {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_BATCH_DURATION,
            max_pending: DEFAULT_MAX_PENDING,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            channel_capacity: EVENT_CHANNEL_CAPACITY,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            retry_strategy: RetryStrategy::default(),
        }
    }
}

impl BatcherConfig {
    pub fn validate(&self) -> Result<(), BatcherError> {
        let invalid = |msg: &str| Err(BatcherError::InvalidConfig(msg.to_string()));
        if self.batch_size == 0 {
            return invalid("batch size must be at least 1");
        }
        if self.max_pending == 0 {
            return invalid("max pending must be at least 1");
        }
        if self.flush_interval.is_zero() {
            return invalid("flush interval must be greater than zero");
        }
        if self.sweep_interval.is_zero() {
            return invalid("sweep interval must be greater than zero");
        }
        Ok(())
    }
}

pub struct Batcher {
    config: BatcherConfig,
    sink: Arc<dyn Sink>,
    stats: Arc<Stats>,
    tx: EventSender,
    rx: EventReceiver,
}

impl Batcher {
    pub fn new(config: BatcherConfig, sink: Arc<dyn Sink>, stats: Arc<Stats>) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        Batcher {
            config,
            sink,
            stats,
            tx,
            rx,
        }
    }

    /// The write end of the event channel. Producers wait when it is full.
    pub fn sender(&self) -> EventSender {
        self.tx.clone()
    }

    /// Opens the journal, then starts the accumulation loop and the recovery sweep. Only an
    /// invalid configuration or an unusable data directory fails here; everything later is
    /// reported on `errors`.
    pub async fn start(self, errors: ErrorReporter) -> Result<BatcherHandle, BatcherError> {
        self.config.validate()?;
        let Batcher {
            config,
            sink,
            stats,
            tx,
            rx,
        } = self;
        drop(tx);

        let data_dir_error = |source| BatcherError::DataDir {
            path: config.data_dir.clone(),
            source,
        };
        let journal = Journal::open(&config.data_dir)
            .await
            .map_err(data_dir_error)?;
        let journaled = journal.list().await.map_err(data_dir_error)?;
        let first_id = journal
            .highest_id()
            .await
            .map_err(data_dir_error)?
            .map_or(1, |max| max + 1);
        if !journaled.is_empty() {
            info!(
                "Found {} journaled batches in {:?}, numbering continues at {}",
                journaled.len(),
                config.data_dir,
                first_id
            );
        }

        let flusher = Flusher::new(
            FlusherConfig {
                max_pending: config.max_pending,
                retry_strategy: config.retry_strategy.clone(),
                delivery_timeout: config.delivery_timeout,
            },
            sink,
            Arc::new(journal),
            errors.clone(),
            Arc::clone(&stats),
        );

        let cancel = CancellationToken::new();
        let accumulator = Accumulator::new(config.batch_size, config.flush_interval, first_id);
        let accumulation = tokio::spawn(accumulate(
            rx,
            accumulator,
            flusher.clone(),
            stats,
            cancel.clone(),
        ));
        let sweeper = tokio::spawn(sweep_loop(
            flusher.clone(),
            config.sweep_interval,
            errors,
            cancel.clone(),
        ));
        info!(
            "Batcher started (batch size {}, flush interval {:?}, max pending {})",
            config.batch_size, config.flush_interval, config.max_pending
        );

        Ok(BatcherHandle {
            cancel,
            accumulation,
            sweeper,
            flusher,
            shutdown_grace: config.shutdown_grace,
        })
    }
}

pub struct BatcherHandle {
    cancel: CancellationToken,
    accumulation: JoinHandle<()>,
    sweeper: JoinHandle<()>,
    flusher: Flusher,
    shutdown_grace: Duration,
}

impl BatcherHandle {
    pub fn flusher(&self) -> &Flusher {
        &self.flusher
    }

    /// Seals and admits the open batch (including events still queued on the channel), stops
    /// the sweep, then gives running deliveries the shutdown grace period. Returns false if
    /// deliveries were still running when it expired; those batches stay journaled.
    pub async fn shutdown(self) -> bool {
        self.cancel.cancel();
        if let Err(e) = self.accumulation.await {
            error!("Accumulation loop failed: {}", e);
        }
        if let Err(e) = self.sweeper.await {
            error!("Recovery sweep failed: {}", e);
        }
        let drained = self.flusher.shutdown(self.shutdown_grace).await;
        info!("Batcher stopped");
        drained
    }
}

async fn accumulate(
    mut rx: EventReceiver,
    mut acc: Accumulator,
    flusher: Flusher,
    stats: Arc<Stats>,
    cancel: CancellationToken,
) {
    let seal = |batch: Batch, reason: SealReason| {
        incr(&stats.batches_sealed);
        debug!(
            "Sealed batch {} with {} events ({:?})",
            batch.id(),
            batch.len(),
            reason
        );
        batch
    };

    loop {
        let deadline = acc.deadline();
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = rx.recv() => {
                let Some(event) = event else {
                    debug!("All event producers are gone");
                    break;
                };
                let now = Instant::now();
                if acc.is_due(now) {
                    if let Some(batch) = acc.seal() {
                        admit(&flusher, seal(batch, SealReason::Timer)).await;
                    }
                }
                if let Some(batch) = acc.push(event, now) {
                    admit(&flusher, seal(batch, SealReason::Size)).await;
                }
            }
            () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if let Some(batch) = acc.seal() {
                    admit(&flusher, seal(batch, SealReason::Timer)).await;
                }
            }
        }
    }

    rx.close();
    while let Some(event) = rx.recv().await {
        if let Some(batch) = acc.push(event, Instant::now()) {
            admit(&flusher, seal(batch, SealReason::Size)).await;
        }
    }
    if let Some(batch) = acc.seal() {
        admit(&flusher, seal(batch, SealReason::Shutdown)).await;
    }
    debug!("Accumulation loop stopped at batch id {}", acc.next_id());
}

async fn admit(flusher: &Flusher, batch: Batch) {
    let id = batch.id();
    match flusher.admit(batch, Origin::Sealed).await {
        Admission::Admitted | Admission::Journaled => {}
        other => debug!("Batch {} not admitted: {:?}", id, other),
    }
}

async fn sweep_loop(
    flusher: Flusher,
    every: Duration,
    errors: ErrorReporter,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        match flusher.sweep(SystemTime::now()).await {
            Ok(report) => log_recovered(&report),
            Err(e) => errors.report(e.into()),
        }
    }
    debug!("Recovery sweep stopped");
}
