// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide counters, published by the monitor endpoint under the `server` key.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Stats {
    pub tcp_connections: AtomicU64,
    pub tls_handshake_failures: AtomicU64,
    pub tcp_read_errors: AtomicU64,
    pub tcp_events: AtomicU64,
    pub udp_events: AtomicU64,
    pub udp_datagrams_dropped: AtomicU64,
    pub udp_read_errors: AtomicU64,
    pub batches_sealed: AtomicU64,
    pub batches_admitted: AtomicU64,
    pub batches_delivered: AtomicU64,
    pub batches_journaled: AtomicU64,
    pub delivery_failures: AtomicU64,
    pub batches_lost: AtomicU64,
    pub records_recovered: AtomicU64,
    pub errors_dropped: AtomicU64,
    pub pending: AtomicU64,
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub tcp_connections: u64,
    pub tls_handshake_failures: u64,
    pub tcp_read_errors: u64,
    pub tcp_events: u64,
    pub udp_events: u64,
    pub udp_datagrams_dropped: u64,
    pub udp_read_errors: u64,
    pub batches_sealed: u64,
    pub batches_admitted: u64,
    pub batches_delivered: u64,
    pub batches_journaled: u64,
    pub delivery_failures: u64,
    pub batches_lost: u64,
    pub records_recovered: u64,
    pub errors_dropped: u64,
    pub pending: u64,
}

pub(crate) fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Stats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            tcp_connections: get(&self.tcp_connections),
            tls_handshake_failures: get(&self.tls_handshake_failures),
            tcp_read_errors: get(&self.tcp_read_errors),
            tcp_events: get(&self.tcp_events),
            udp_events: get(&self.udp_events),
            udp_datagrams_dropped: get(&self.udp_datagrams_dropped),
            udp_read_errors: get(&self.udp_read_errors),
            batches_sealed: get(&self.batches_sealed),
            batches_admitted: get(&self.batches_admitted),
            batches_delivered: get(&self.batches_delivered),
            batches_journaled: get(&self.batches_journaled),
            delivery_failures: get(&self.delivery_failures),
            batches_lost: get(&self.batches_lost),
            records_recovered: get(&self.records_recovered),
            errors_dropped: get(&self.errors_dropped),
            pending: get(&self.pending),
        }
    }
}
