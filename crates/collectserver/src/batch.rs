// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sealed batches and the accumulator that builds them.
//!
//! The [`Accumulator`] holds at most one open batch. It seals when the batch reaches the size
//! threshold or when the flush interval has elapsed since the batch was opened, whichever comes
//! first. A sealed [`Batch`] has no way to take more events.

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::event::Event;

/// A sealed, ordered group of events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    id: u64,
    created_at: SystemTime,
    attempts: u32,
    last_attempt: Option<SystemTime>,
    events: Vec<Event>,
}

impl Batch {
    pub fn new(id: u64, created_at: SystemTime, events: Vec<Event>) -> Self {
        Batch {
            id,
            created_at,
            attempts: 0,
            last_attempt: None,
            events,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Number of failed delivery attempts so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_attempt(&self) -> Option<SystemTime> {
        self.last_attempt
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub(crate) fn record_failed_attempt(&mut self, at: SystemTime) {
        self.attempts = self.attempts.saturating_add(1);
        self.last_attempt = Some(at);
    }
}

struct OpenBatch {
    deadline: Instant,
    created_at: SystemTime,
    events: Vec<Event>,
}

/// Why a batch was sealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealReason {
    Size,
    Timer,
    Shutdown,
}

pub struct Accumulator {
    batch_size: usize,
    flush_interval: Duration,
    next_id: u64,
    open: Option<OpenBatch>,
}

impl Accumulator {
    /// `first_id` is the sequence identifier given to the first sealed batch.
    pub fn new(batch_size: usize, flush_interval: Duration, first_id: u64) -> Self {
        Accumulator {
            batch_size: batch_size.max(1),
            flush_interval,
            next_id: first_id,
            open: None,
        }
    }

    /// Appends `event`, opening a batch if none is open. Returns the sealed batch when the
    /// event filled it.
    pub fn push(&mut self, event: Event, now: Instant) -> Option<Batch> {
        let open = self.open.get_or_insert_with(|| OpenBatch {
            deadline: now + self.flush_interval,
            created_at: SystemTime::now(),
            events: Vec::with_capacity(self.batch_size),
        });
        open.events.push(event);
        if open.events.len() >= self.batch_size {
            return self.seal();
        }
        None
    }

    /// When the open batch must be sealed by the timer, if a batch is open.
    pub fn deadline(&self) -> Option<Instant> {
        self.open.as_ref().map(|b| b.deadline)
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|deadline| deadline <= now)
    }

    /// Number of events in the open batch.
    pub fn open_len(&self) -> usize {
        self.open.as_ref().map_or(0, |b| b.events.len())
    }

    /// Seals the open batch. Never produces an empty batch.
    pub fn seal(&mut self) -> Option<Batch> {
        let open = self.open.take()?;
        if open.events.is_empty() {
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        Some(Batch::new(id, open.created_at, open.events))
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }
}
