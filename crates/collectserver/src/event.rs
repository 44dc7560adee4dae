// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The unit of ingested data shared by every collector and the batching engine.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::SystemTime;

use derive_more::Display;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::CollectorError;

/// Write end of the engine's event queue. Every collector publishes through a clone of it.
pub type EventSender = mpsc::Sender<Event>;
pub type EventReceiver = mpsc::Receiver<Event>;

/// Transport an event arrived on.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[display("tcp")]
    Tcp,
    #[display("udp")]
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl FromStr for Protocol {
    type Err = CollectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            _ => Err(CollectorError::UnsupportedProtocol(s.to_string())),
        }
    }
}

/// One ingested record. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    received_at: SystemTime,
    source: SocketAddr,
    protocol: Protocol,
    payload: Vec<u8>,
}

impl Event {
    #[must_use]
    pub fn new(protocol: Protocol, source: SocketAddr, payload: Vec<u8>) -> Self {
        Self::with_timestamp(SystemTime::now(), protocol, source, payload)
    }

    #[must_use]
    pub fn with_timestamp(
        received_at: SystemTime,
        protocol: Protocol,
        source: SocketAddr,
        payload: Vec<u8>,
    ) -> Self {
        Event {
            received_at,
            source,
            protocol,
            payload,
        }
    }

    pub fn received_at(&self) -> SystemTime {
        self.received_at
    }

    pub fn source(&self) -> SocketAddr {
        self.source
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_parse_is_case_insensitive() {
        assert_eq!("tcp".parse::<Protocol>().ok(), Some(Protocol::Tcp));
        assert_eq!("TCP".parse::<Protocol>().ok(), Some(Protocol::Tcp));
        assert_eq!("Udp".parse::<Protocol>().ok(), Some(Protocol::Udp));
    }

    #[test]
    fn test_protocol_parse_rejects_unknown() {
        let err = "sctp".parse::<Protocol>().unwrap_err();
        assert!(matches!(err, CollectorError::UnsupportedProtocol(ref p) if p == "sctp"));
    }

    #[test]
    fn test_protocol_display() {
        assert_eq!(Protocol::Tcp.to_string(), "tcp");
        assert_eq!(Protocol::Udp.to_string(), "udp");
    }

    #[test]
    fn test_event_accessors() {
        let source: SocketAddr = "10.0.0.1:514".parse().unwrap();
        let event = Event::new(Protocol::Udp, source, b"<13>hello".to_vec());
        assert_eq!(event.source(), source);
        assert_eq!(event.protocol(), Protocol::Udp);
        assert_eq!(event.payload(), b"<13>hello");
        assert_eq!(event.len(), 9);
        assert!(!event.is_empty());
    }
}
