use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::batching::alert_status_for;
use crate::errors::Error;

/// Connection state of a device as seen by the ingestion core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    /// The broker closed the connection without an error.
    Waiting,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Waiting => "waiting",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "online" => Ok(DeviceStatus::Online),
            "offline" => Ok(DeviceStatus::Offline),
            "waiting" => Ok(DeviceStatus::Waiting),
            other => Err(Error::Decode(format!("unknown device status '{}'", other))),
        }
    }
}

/// Transport used to reach a device's broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVariant {
    Mqtt,
    Mqtts,
    Ws,
    Wss,
}

impl ProtocolVariant {
    pub fn scheme(&self) -> &'static str {
        match self {
            ProtocolVariant::Mqtt => "mqtt",
            ProtocolVariant::Mqtts => "mqtts",
            ProtocolVariant::Ws => "ws",
            ProtocolVariant::Wss => "wss",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            ProtocolVariant::Mqtt => 1883,
            ProtocolVariant::Mqtts => 8883,
            ProtocolVariant::Ws => 8080,
            ProtocolVariant::Wss => 8084,
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, ProtocolVariant::Mqtts | ProtocolVariant::Wss)
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self, ProtocolVariant::Ws | ProtocolVariant::Wss)
    }
}

impl FromStr for ProtocolVariant {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mqtt" | "tcp" => Ok(ProtocolVariant::Mqtt),
            "mqtts" | "ssl" | "tls" => Ok(ProtocolVariant::Mqtts),
            "ws" => Ok(ProtocolVariant::Ws),
            "wss" => Ok(ProtocolVariant::Wss),
            other => Err(Error::Decode(format!("unknown protocol '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password: String,
}

/// A breath sensor and the broker it publishes to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub device_id: String,
    pub name: String,
    pub broker_host: String,
    pub broker_port: Option<u16>,
    pub topic: String,
    pub protocol: ProtocolVariant,
    pub credentials: Option<Credentials>,
    pub status: DeviceStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub display_order: i32,
}

impl Device {
    /// A fresh, active device in the `waiting` state.
    pub fn new(
        device_id: impl Into<String>,
        broker_host: impl Into<String>,
        topic: impl Into<String>,
        protocol: ProtocolVariant,
    ) -> Self {
        let device_id = device_id.into();
        Device {
            name: device_id.clone(),
            device_id,
            broker_host: broker_host.into(),
            broker_port: None,
            topic: topic.into(),
            protocol,
            credentials: None,
            status: DeviceStatus::Waiting,
            last_seen: None,
            is_active: true,
            display_order: 0,
        }
    }

    pub fn port(&self) -> u16 {
        self.broker_port.unwrap_or_else(|| self.protocol.default_port())
    }

    pub fn apply(&mut self, update: &DeviceUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(last_seen) = update.last_seen {
            self.last_seen = Some(last_seen);
        }
    }
}

/// Partial update of the fields the ingestion core owns.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeviceUpdate {
    pub status: Option<DeviceStatus>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl DeviceUpdate {
    pub fn status(status: DeviceStatus, at: DateTime<Utc>) -> Self {
        DeviceUpdate {
            status: Some(status),
            last_seen: Some(at),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertStatus {
    Normal,
    #[serde(rename = "Moderate Drunk")]
    ModerateDrunk,
    #[serde(rename = "Completely Drunk")]
    CompletelyDrunk,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Normal => "Normal",
            AlertStatus::ModerateDrunk => "Moderate Drunk",
            AlertStatus::CompletelyDrunk => "Completely Drunk",
        }
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Normal" => Ok(AlertStatus::Normal),
            "Moderate Drunk" => Ok(AlertStatus::ModerateDrunk),
            "Completely Drunk" => Ok(AlertStatus::CompletelyDrunk),
            other => Err(Error::Decode(format!("unknown alert status '{}'", other))),
        }
    }
}

/// One alcohol measurement, timestamped by the server at ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryReading {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub alcohol_level: i32,
    pub alert_status: AlertStatus,
}

impl TelemetryReading {
    pub fn new(device_id: impl Into<String>, alcohol_level: i32, timestamp: DateTime<Utc>) -> Self {
        TelemetryReading {
            device_id: device_id.into(),
            timestamp,
            alcohol_level,
            alert_status: alert_status_for(alcohol_level),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineEvent {
    pub device_id: String,
    pub offline_at: DateTime<Utc>,
}

/// Persisted state of the periodic reading wipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupSchedule {
    pub task_name: String,
    pub last_execution_time: Option<DateTime<Utc>>,
    pub next_scheduled_time: DateTime<Utc>,
    pub interval_days: i32,
    pub execution_hour: u32,
    pub execution_minute: u32,
    pub is_enabled: bool,
}

impl CleanupSchedule {
    pub fn apply(&mut self, update: &CleanupScheduleUpdate) {
        if let Some(last) = update.last_execution_time {
            self.last_execution_time = Some(last);
        }
        if let Some(next) = update.next_scheduled_time {
            self.next_scheduled_time = next;
        }
        if let Some(enabled) = update.is_enabled {
            self.is_enabled = enabled;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupScheduleUpdate {
    pub last_execution_time: Option<DateTime<Utc>>,
    pub next_scheduled_time: Option<DateTime<Utc>>,
    pub is_enabled: Option<bool>,
}
