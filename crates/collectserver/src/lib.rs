// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Syslog-style event collection.
//!
//! Collectors ([`collector`]) read TCP and UDP traffic into [`event::Event`]s, the
//! [`batcher`] groups them into batches by size and age, and the [`flusher`] delivers batches
//! to a [`sink::Sink`] with bounded concurrency. Batches that cannot be delivered right away
//! wait in the on-disk [`journal`] until a recovery sweep picks them up again.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod batch;
pub mod batcher;
pub mod collector;
pub mod constants;
pub mod errors;
pub mod event;
pub mod flusher;
pub mod journal;
pub mod monitor;
pub mod sink;
pub mod stats;
pub mod tls;

pub use batcher::{Batcher, BatcherConfig, BatcherHandle};
pub use collector::Collector;
pub use errors::{error_channel, ErrorDrain, ErrorReporter};
pub use event::{Event, Protocol};
