// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

pub const DEFAULT_BATCH_SIZE: usize = 4;
pub const DEFAULT_BATCH_DURATION: Duration = Duration::from_millis(3000);
pub const DEFAULT_MAX_PENDING: usize = 3;
pub const DEFAULT_DATA_DIR: &str = "./temp";
pub const DEFAULT_TCP_ADDR: &str = "localhost:5514";
pub const DEFAULT_UDP_ADDR: &str = "localhost:514";
pub const DEFAULT_MONITOR_ADDR: &str = "localhost:8080";

/// Read buffer for stream connections. Messages longer than one read are reassembled by framing.
pub const TCP_READ_BUFFER_SIZE: usize = 512;
/// A connection with no data for this long is closed.
pub const TCP_READ_TIMEOUT: Duration = Duration::from_millis(1000);
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause before accepting again after a listener error such as running out of descriptors.
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);
/// Longest newline-free frame accepted before it is cut into its own event.
pub const MAX_FRAME_SIZE: usize = 8192;
/// Datagrams larger than this are truncated by the socket.
pub const UDP_BUFFER_SIZE: usize = 8192;

/// Deep on purpose; backpressure applies at the pending set, not here.
pub const EVENT_CHANNEL_CAPACITY: usize = 10_000;
pub const ERROR_CHANNEL_CAPACITY: usize = 256;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_secs(1);
pub const DEFAULT_RETRY_MAX: Duration = Duration::from_secs(300);

pub const JOURNAL_EXTENSION: &str = "batch";
pub const JOURNAL_TMP_EXTENSION: &str = "tmp";
pub const JOURNAL_CORRUPT_EXTENSION: &str = "corrupt";
pub const JOURNAL_FORMAT_VERSION: u32 = 1;
