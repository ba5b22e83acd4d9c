//! Transport-neutral view of a device's broker: how to address it, which
//! protocol version to speak, and the session operations the connection
//! manager drives.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

use crate::errors::BrokerError;
use crate::model::{Credentials, Device, ProtocolVariant};

/// MQTT protocol revisions, in the order the fallback ladder tries them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    V311,
    V5,
    V31,
}

pub const PROTOCOL_LADDER: [ProtocolVersion; 3] =
    [ProtocolVersion::V311, ProtocolVersion::V5, ProtocolVersion::V31];

impl ProtocolVersion {
    /// Protocol level byte sent in CONNECT.
    pub fn level(&self) -> u8 {
        match self {
            ProtocolVersion::V31 => 3,
            ProtocolVersion::V311 => 4,
            ProtocolVersion::V5 => 5,
        }
    }

    pub fn ladder_index(&self) -> usize {
        PROTOCOL_LADDER
            .iter()
            .position(|v| v == self)
            .unwrap_or_default()
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVersion::V31 => f.write_str("MQTT 3.1"),
            ProtocolVersion::V311 => f.write_str("MQTT 3.1.1"),
            ProtocolVersion::V5 => f.write_str("MQTT 5"),
        }
    }
}

/// Fully resolved broker address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerUrl {
    pub variant: ProtocolVariant,
    pub host: String,
    pub port: u16,
}

impl BrokerUrl {
    pub fn for_device(device: &Device) -> Self {
        let raw = device.broker_host.trim();
        // Hosts are sometimes stored with a scheme prefix; keep only the host.
        let host = match raw.split_once("://") {
            Some((_, rest)) => rest.split(['/', ':']).next().unwrap_or(rest),
            None => raw,
        };
        BrokerUrl {
            variant: device.protocol,
            host: host.to_string(),
            port: device.port(),
        }
    }

    pub fn is_websocket(&self) -> bool {
        self.variant.is_websocket()
    }

    pub fn is_secure(&self) -> bool {
        self.variant.is_secure()
    }
}

impl fmt::Display for BrokerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.variant.scheme(), self.host, self.port)?;
        if self.is_websocket() {
            f.write_str("/mqtt")?;
        }
        Ok(())
    }
}

/// Everything needed for one connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub url: BrokerUrl,
    pub client_id: String,
    pub version: ProtocolVersion,
    pub credentials: Option<Credentials>,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        InboundMessage {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    pub fn preview(&self) -> String {
        preview(&self.payload)
    }
}

/// Opens broker sessions. Implementations map their client library's
/// failures onto [`BrokerError`] classes.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects and waits for the broker to acknowledge the session. Must
    /// give up after `params.connect_timeout` with [`BrokerError::Timeout`].
    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn BrokerSession>, BrokerError>;
}

/// A live, acknowledged broker session.
#[async_trait]
pub trait BrokerSession: Send {
    /// Subscribes at least-once and waits for the broker's acknowledgement.
    async fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError>;

    /// Next publish on the session. `Ok(None)` means the broker closed the
    /// connection without an error.
    async fn next_message(&mut self) -> Result<Option<InboundMessage>, BrokerError>;

    async fn close(&mut self);
}

fn preview(payload: &[u8]) -> String {
    String::from_utf8_lossy(&payload[..payload.len().min(64)]).into_owned()
}
