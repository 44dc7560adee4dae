// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery of sealed batches with bounded concurrency and journal-backed retry.
//!
//! ```text
//!   sealed batch ──> admit ──┬── slot free ──> delivery worker ──> sink
//!                            │                      │ failure
//!                            └── pending full ──> journal <──┘
//!                                                  │
//!                    recovery sweep (startup + periodic) ──> admit
//! ```
//!
//! The pending set is a semaphore with `max_pending` permits; admission never waits for one.
//! A worker writes its batch to the journal before calling the sink, so every admitted batch
//! stays durable until the sink confirms it. Each batch id can be claimed by at most one
//! worker at a time, which is what keeps the sweep and the workers off each other's records.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::batch::Batch;
use crate::constants::{DEFAULT_DELIVERY_TIMEOUT, DEFAULT_RETRY_BASE, DEFAULT_RETRY_MAX};
use crate::errors::{BatcherError, ErrorReporter, JournalError, SinkError};
use crate::journal::Journal;
use crate::sink::Sink;
use crate::stats::{incr, Stats};

/// How long a journaled batch waits, after `n` failed attempts, before the sweep retries it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryStrategy {
    Immediate,
    LinearBackoff(Duration),
    ExponentialBackoff { base: Duration, max: Duration },
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::ExponentialBackoff {
            base: DEFAULT_RETRY_BASE,
            max: DEFAULT_RETRY_MAX,
        }
    }
}

impl RetryStrategy {
    pub fn delay(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        match self {
            RetryStrategy::Immediate => Duration::ZERO,
            RetryStrategy::LinearBackoff(step) => step.saturating_mul(attempts),
            RetryStrategy::ExponentialBackoff { base, max } => base
                .saturating_mul(2u32.saturating_pow(attempts - 1))
                .min(*max),
        }
    }

    pub fn is_due(&self, batch: &Batch, now: SystemTime) -> bool {
        match batch.last_attempt() {
            None => true,
            Some(last) => last
                .checked_add(self.delay(batch.attempts()))
                .is_some_and(|due| due <= now),
        }
    }
}

/// The bounded set of batches admitted for delivery.
#[derive(Debug, Clone)]
pub struct PendingSet {
    slots: Arc<Semaphore>,
    capacity: usize,
    stats: Arc<Stats>,
}

impl PendingSet {
    pub fn new(capacity: usize, stats: Arc<Stats>) -> Self {
        PendingSet {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            stats,
        }
    }

    pub fn try_admit(&self) -> Option<PendingSlot> {
        let permit = Arc::clone(&self.slots).try_acquire_owned().ok()?;
        self.publish();
        Some(PendingSlot {
            permit: Some(permit),
            set: self.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.slots.available_permits() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn publish(&self) {
        self.stats
            .pending
            .store(self.len() as u64, std::sync::atomic::Ordering::Relaxed);
    }
}

/// Occupies one place in the pending set until dropped.
#[derive(Debug)]
pub struct PendingSlot {
    permit: Option<OwnedSemaphorePermit>,
    set: PendingSet,
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        drop(self.permit.take());
        self.set.publish();
    }
}

#[derive(Debug, Default, Clone)]
struct InFlight(Arc<Mutex<HashSet<u64>>>);

impl InFlight {
    fn claim(&self, id: u64) -> Option<Claim> {
        let mut ids = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        ids.insert(id).then(|| Claim {
            owner: self.clone(),
            id,
        })
    }

    fn contains(&self, id: u64) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id)
    }
}

/// Exclusive ownership of one batch id (and its journal record).
struct Claim {
    owner: InFlight,
    id: u64,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.owner
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// Where a batch handed to [`Flusher::admit`] comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Freshly sealed by the accumulation loop; not on disk yet.
    Sealed,
    /// Read back from the journal by the recovery sweep.
    Journal,
}

/// Outcome of [`Flusher::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Took a pending slot; a worker is delivering it.
    Admitted,
    /// Pending set full; the batch was written to the journal.
    Journaled,
    /// Pending set full; the batch stays in the journal for a later sweep.
    Deferred,
    /// Another worker already owns this batch.
    InFlight,
    /// The journal record was gone (delivered meanwhile). Nothing to do.
    Stale,
    /// Neither admitted nor journaled.
    Lost,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub admitted: usize,
    /// Records still inside their backoff window.
    pub waiting: usize,
    pub quarantined: usize,
    /// Records that could not be read this time; retried on the next sweep.
    pub unreadable: usize,
}

pub struct FlusherConfig {
    pub max_pending: usize,
    pub retry_strategy: RetryStrategy,
    pub delivery_timeout: Duration,
}

impl Default for FlusherConfig {
    fn default() -> Self {
        FlusherConfig {
            max_pending: crate::constants::DEFAULT_MAX_PENDING,
            retry_strategy: RetryStrategy::default(),
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
        }
    }
}

#[derive(Clone)]
pub struct Flusher {
    inner: Arc<Inner>,
}

struct Inner {
    sink: Arc<dyn Sink>,
    journal: Arc<Journal>,
    pending: PendingSet,
    in_flight: InFlight,
    tracker: TaskTracker,
    errors: ErrorReporter,
    stats: Arc<Stats>,
    retry_strategy: RetryStrategy,
    delivery_timeout: Duration,
}

impl Flusher {
    pub fn new(
        config: FlusherConfig,
        sink: Arc<dyn Sink>,
        journal: Arc<Journal>,
        errors: ErrorReporter,
        stats: Arc<Stats>,
    ) -> Self {
        Flusher {
            inner: Arc::new(Inner {
                sink,
                journal,
                pending: PendingSet::new(config.max_pending, Arc::clone(&stats)),
                in_flight: InFlight::default(),
                tracker: TaskTracker::new(),
                errors,
                stats,
                retry_strategy: config.retry_strategy,
                delivery_timeout: config.delivery_timeout,
            }),
        }
    }

    /// Number of batches currently admitted.
    pub fn pending(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn journal(&self) -> &Journal {
        &self.inner.journal
    }

    /// Hands `batch` to a delivery worker if a pending slot is free. Never waits for a slot:
    /// a sealed batch that cannot be admitted is journaled before this returns.
    pub async fn admit(&self, batch: Batch, origin: Origin) -> Admission {
        let Some(claim) = self.inner.in_flight.claim(batch.id()) else {
            return Admission::InFlight;
        };

        if origin == Origin::Journal {
            match self.inner.journal.contains(batch.id()).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!("Batch {} no longer journaled, skipping", batch.id());
                    return Admission::Stale;
                }
                Err(e) => {
                    self.inner.errors.report(e.into());
                    return Admission::Deferred;
                }
            }
        }

        match self.inner.pending.try_admit() {
            Some(slot) => {
                incr(&self.inner.stats.batches_admitted);
                let inner = Arc::clone(&self.inner);
                self.inner
                    .tracker
                    .spawn(inner.deliver(batch, origin, slot, claim));
                Admission::Admitted
            }
            None if origin == Origin::Journal => Admission::Deferred,
            None => self.inner.overflow(batch).await,
        }
    }

    /// Re-admits journaled batches, oldest first, until the pending set is full.
    pub async fn sweep(&self, now: SystemTime) -> Result<SweepReport, JournalError> {
        let mut report = SweepReport::default();
        for id in self.inner.journal.list().await? {
            if self.inner.pending.is_full() {
                break;
            }
            if self.inner.in_flight.contains(id) {
                continue;
            }
            let batch = match self.inner.journal.read(id).await {
                Ok(Some(batch)) => batch,
                Ok(None) => continue,
                Err(JournalError::Corrupt { path, source }) => {
                    match self.inner.journal.quarantine(id).await {
                        Ok(moved) => warn!("Quarantined unreadable journal record as {:?}", moved),
                        Err(e) => self.inner.errors.report(e.into()),
                    }
                    report.quarantined += 1;
                    self.inner
                        .errors
                        .report(JournalError::Corrupt { path, source }.into());
                    continue;
                }
                Err(e) => {
                    report.unreadable += 1;
                    self.inner.errors.report(e.into());
                    continue;
                }
            };
            if batch.id() != id {
                warn!("Journal record {id} holds batch {}, skipping", batch.id());
                continue;
            }
            if !self.inner.retry_strategy.is_due(&batch, now) {
                report.waiting += 1;
                continue;
            }
            match self.admit(batch, Origin::Journal).await {
                Admission::Admitted => report.admitted += 1,
                Admission::Deferred => break,
                _ => {}
            }
        }
        if report.admitted > 0 {
            debug!("Recovery sweep re-admitted {} batches", report.admitted);
        }
        Ok(report)
    }

    /// Stops accepting deliveries and waits up to `grace` for running ones. Returns false if
    /// some were still running; their batches remain in the journal.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.inner.tracker.close();
        if tokio::time::timeout(grace, self.inner.tracker.wait())
            .await
            .is_ok()
        {
            return true;
        }
        warn!(
            "{} deliveries still running after {:?}; their batches stay journaled",
            self.inner.tracker.len(),
            grace
        );
        false
    }
}

impl Inner {
    async fn overflow(&self, batch: Batch) -> Admission {
        match self.journal.write(&batch).await {
            Ok(()) => {
                incr(&self.stats.batches_journaled);
                debug!(
                    "Pending set full ({}), batch {} journaled",
                    self.pending.capacity(),
                    batch.id()
                );
                Admission::Journaled
            }
            Err(source) => {
                incr(&self.stats.batches_lost);
                self.errors.report(BatcherError::BatchLost {
                    batch_id: batch.id(),
                    events: batch.len(),
                    source,
                });
                Admission::Lost
            }
        }
    }

    async fn deliver(
        self: Arc<Self>,
        mut batch: Batch,
        origin: Origin,
        slot: PendingSlot,
        _claim: Claim,
    ) {
        let mut persisted = origin == Origin::Journal;
        if !persisted {
            match self.journal.write(&batch).await {
                Ok(()) => persisted = true,
                Err(e) => self.errors.report(e.into()),
            }
        }

        let result =
            match tokio::time::timeout(self.delivery_timeout, self.sink.deliver(&batch)).await {
                Ok(result) => result,
                Err(_) => Err(SinkError::Timeout(self.delivery_timeout)),
            };

        match result {
            Ok(()) => {
                incr(&self.stats.batches_delivered);
                if origin == Origin::Journal {
                    incr(&self.stats.records_recovered);
                }
                if persisted {
                    if let Err(e) = self.journal.remove(batch.id()).await {
                        self.errors.report(e.into());
                    }
                }
                drop(slot);
                debug!("Batch {} delivered ({} events)", batch.id(), batch.len());
            }
            Err(source) => {
                incr(&self.stats.delivery_failures);
                batch.record_failed_attempt(SystemTime::now());
                let journaled = self.journal.write(&batch).await;
                drop(slot);
                match journaled {
                    Ok(()) => {}
                    // The earlier record is still there, only its attempt count is stale.
                    Err(e) if persisted => self.errors.report(e.into()),
                    Err(e) => {
                        incr(&self.stats.batches_lost);
                        self.errors.report(BatcherError::BatchLost {
                            batch_id: batch.id(),
                            events: batch.len(),
                            source: e,
                        });
                    }
                }
                self.errors.report(BatcherError::Delivery {
                    batch_id: batch.id(),
                    attempts: batch.attempts(),
                    source,
                });
            }
        }
    }
}

impl std::fmt::Debug for Flusher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flusher")
            .field("pending", &self.inner.pending.len())
            .field("max_pending", &self.inner.pending.capacity())
            .finish()
    }
}

pub(crate) fn log_recovered(report: &SweepReport) {
    if report.admitted > 0 || report.quarantined > 0 || report.unreadable > 0 {
        info!(
            "Journal recovery: {} re-admitted, {} waiting for backoff, {} quarantined, {} unreadable",
            report.admitted, report.waiting, report.quarantined, report.unreadable
        );
    }
}
