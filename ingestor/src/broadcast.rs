use chrono::{DateTime, Utc};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{error, trace};

use crate::model::{AlertStatus, Device, TelemetryReading};

/// Event pushed to observers of the ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastEvent {
    DeviceStatusUpdate {
        device: Device,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    SensorDataUpdate {
        device_id: String,
        data: SensorData,
        timestamp: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorData {
    pub alcohol_level: i32,
    pub alert_status: AlertStatus,
    pub timestamp: DateTime<Utc>,
}

impl BroadcastEvent {
    pub fn device_status(device: Device, at: DateTime<Utc>) -> Self {
        BroadcastEvent::DeviceStatusUpdate {
            device,
            timestamp: at,
        }
    }

    pub fn sensor_data(reading: &TelemetryReading) -> Self {
        BroadcastEvent::SensorDataUpdate {
            device_id: reading.device_id.clone(),
            data: SensorData {
                alcohol_level: reading.alcohol_level,
                alert_status: reading.alert_status,
                timestamp: reading.timestamp,
            },
            timestamp: reading.timestamp,
        }
    }

    pub fn device_id(&self) -> &str {
        match self {
            BroadcastEvent::DeviceStatusUpdate { device, .. } => &device.device_id,
            BroadcastEvent::SensorDataUpdate { device_id, .. } => device_id,
        }
    }
}

/// Callback that fans events out to observers. It must return quickly.
pub type BroadcastSink = Arc<dyn Fn(BroadcastEvent) + Send + Sync>;

/// Late-bound slot for the broadcast sink, shared by every component that
/// publishes events.
#[derive(Default, Clone)]
pub struct Broadcaster {
    sink: Arc<RwLock<Option<BroadcastSink>>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sink(&self, sink: BroadcastSink) {
        *self.sink.write().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    /// Fire and forget. A panicking sink is logged and otherwise ignored.
    pub fn publish(&self, event: BroadcastEvent) {
        let sink = self
            .sink
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(sink) = sink else {
            trace!(device_id = %event.device_id(), "no broadcast sink installed, event dropped");
            return;
        };

        let device_id = event.device_id().to_string();
        if catch_unwind(AssertUnwindSafe(|| sink(event))).is_err() {
            error!(device_id = %device_id, "broadcast sink panicked");
        }
    }
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let installed = self
            .sink
            .read()
            .map(|sink| sink.is_some())
            .unwrap_or(false);
        f.debug_struct("Broadcaster")
            .field("sink_installed", &installed)
            .finish()
    }
}
