// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::constants::UDP_BUFFER_SIZE;
use crate::errors::CollectorError;
use crate::event::{Event, EventSender, Protocol};
use crate::stats::{incr, Stats};

/// One reading loop on one socket; every datagram becomes one event.
#[derive(Debug)]
pub struct UdpCollector {
    addr: SocketAddr,
    stats: Arc<Stats>,
    local_addr: Option<SocketAddr>,
    task: Option<JoinHandle<()>>,
}

impl UdpCollector {
    pub fn new(addr: SocketAddr) -> Self {
        UdpCollector {
            addr,
            stats: Arc::new(Stats::default()),
            local_addr: None,
            task: None,
        }
    }

    #[must_use]
    pub fn with_stats(mut self, stats: Arc<Stats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.local_addr.unwrap_or(self.addr)
    }

    pub async fn start(
        &mut self,
        output: EventSender,
        cancel: CancellationToken,
    ) -> Result<(), CollectorError> {
        if self.task.is_some() {
            return Err(CollectorError::AlreadyStarted(Protocol::Udp));
        }
        let bind_error = |source| CollectorError::Bind {
            protocol: Protocol::Udp,
            addr: self.addr,
            source,
        };
        let socket = UdpSocket::bind(self.addr).await.map_err(bind_error)?;
        let local_addr = socket.local_addr().map_err(bind_error)?;
        info!("UDP collector listening on {}", local_addr);

        self.local_addr = Some(local_addr);
        self.task = Some(tokio::spawn(read_loop(
            socket,
            output,
            Arc::clone(&self.stats),
            cancel,
        )));
        Ok(())
    }

    pub async fn stopped(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("UDP collector task failed: {}", e);
            }
        }
    }
}

async fn read_loop(
    socket: UdpSocket,
    output: EventSender,
    stats: Arc<Stats>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };
        let (amt, src) = match received {
            Ok(received) => received,
            Err(e) => {
                incr(&stats.udp_read_errors);
                warn!("UDP read failed: {}", e);
                continue;
            }
        };
        if amt == 0 {
            incr(&stats.udp_datagrams_dropped);
            trace!("Dropping empty datagram from {}", src);
            continue;
        }

        incr(&stats.udp_events);
        let event = Event::new(Protocol::Udp, src, buf[..amt].to_vec());
        if output.send(event).await.is_err() {
            debug!("Event channel closed, stopping UDP collector");
            break;
        }
    }
    debug!("UDP collector stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn started() -> (UdpCollector, mpsc::Receiver<Event>, CancellationToken, Arc<Stats>) {
        let stats = Arc::new(Stats::default());
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let mut collector =
            UdpCollector::new("127.0.0.1:0".parse().unwrap()).with_stats(Arc::clone(&stats));
        collector.start(tx, cancel.clone()).await.unwrap();
        (collector, rx, cancel, stats)
    }

    #[tokio::test]
    async fn test_datagram_becomes_one_event() {
        let (mut collector, mut rx, cancel, stats) = started().await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(b"<13>hello\nworld", collector.addr())
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.protocol(), Protocol::Udp);
        assert_eq!(event.payload(), b"<13>hello\nworld");
        assert_eq!(event.source(), client.local_addr().unwrap());
        assert_eq!(stats.udp_events.load(Ordering::Relaxed), 1);

        cancel.cancel();
        collector.stopped().await;
    }

    #[tokio::test]
    async fn test_empty_datagram_is_dropped_and_loop_continues() {
        let (mut collector, mut rx, cancel, stats) = started().await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"", collector.addr()).await.unwrap();
        client.send_to(b"after", collector.addr()).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.payload(), b"after");
        assert_eq!(stats.udp_datagrams_dropped.load(Ordering::Relaxed), 1);

        cancel.cancel();
        collector.stopped().await;
    }

    #[tokio::test]
    async fn test_stops_on_cancel() {
        let (mut collector, _rx, cancel, _) = started().await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), collector.stopped())
            .await
            .expect("collector stops after cancel");
    }
}
