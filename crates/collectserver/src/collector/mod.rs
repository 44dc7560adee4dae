// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Network listeners that turn raw input into [`Event`](crate::event::Event)s.
//!
//! Both variants publish onto the same [`EventSender`]. Per-connection and per-datagram
//! failures are logged and counted; only binding errors reach the caller of `start`.

mod tcp;
mod udp;

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::constants::ACCEPT_ERROR_BACKOFF;
use crate::errors::CollectorError;
use crate::event::{EventSender, Protocol};
use crate::stats::Stats;

pub use tcp::TcpCollector;
pub use udp::UdpCollector;

#[derive(Debug)]
pub enum Collector {
    Tcp(TcpCollector),
    Udp(UdpCollector),
}

impl Collector {
    /// Creates a collector for `protocol` (`"tcp"` or `"udp"`, any case) bound to `addr`.
    /// TLS is only accepted for TCP.
    pub fn new(
        protocol: &str,
        addr: &str,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> Result<Self, CollectorError> {
        let protocol: Protocol = protocol.parse()?;
        let addr = resolve(protocol, addr)?;
        match protocol {
            Protocol::Tcp => Ok(Collector::Tcp(TcpCollector::new(addr, tls))),
            Protocol::Udp if tls.is_some() => Err(CollectorError::TlsNotSupported(protocol)),
            Protocol::Udp => Ok(Collector::Udp(UdpCollector::new(addr))),
        }
    }

    #[must_use]
    pub fn with_stats(self, stats: Arc<Stats>) -> Self {
        match self {
            Collector::Tcp(c) => Collector::Tcp(c.with_stats(stats)),
            Collector::Udp(c) => Collector::Udp(c.with_stats(stats)),
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            Collector::Tcp(_) => Protocol::Tcp,
            Collector::Udp(_) => Protocol::Udp,
        }
    }

    /// The bound address once started, the configured one before.
    pub fn addr(&self) -> SocketAddr {
        match self {
            Collector::Tcp(c) => c.addr(),
            Collector::Udp(c) => c.addr(),
        }
    }

    /// Binds and starts reading in the background until `cancel` fires.
    pub async fn start(
        &mut self,
        output: EventSender,
        cancel: CancellationToken,
    ) -> Result<(), CollectorError> {
        match self {
            Collector::Tcp(c) => c.start(output, cancel).await,
            Collector::Udp(c) => c.start(output, cancel).await,
        }
    }

    /// Waits for the background task to finish after cancellation.
    pub async fn stopped(&mut self) {
        match self {
            Collector::Tcp(c) => c.stopped().await,
            Collector::Udp(c) => c.stopped().await,
        }
    }
}

/// How long an accept loop waits after `err`. Connections that died before being accepted
/// are retried at once; anything else (`EMFILE`, `ENOBUFS`) backs off.
pub(crate) fn accept_error_backoff(err: &io::Error) -> Option<Duration> {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted => None,
        _ => Some(ACCEPT_ERROR_BACKOFF),
    }
}

fn resolve(protocol: Protocol, addr: &str) -> Result<SocketAddr, CollectorError> {
    let resolution_error = |source| CollectorError::AddressResolution {
        protocol,
        addr: addr.to_string(),
        source,
    };
    addr.to_socket_addrs()
        .map_err(resolution_error)?
        .next()
        .ok_or_else(|| {
            resolution_error(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no addresses found",
            ))
        })
}
