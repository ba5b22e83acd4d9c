//! One broker connection per active device.
//!
//! Each device runs in its own task. A connection cycle walks the protocol
//! ladder until a session is open and subscribed, then streams messages until
//! the session ends. How the cycle ended decides what happens next:
//!
//! | ended with            | status   | next step                          |
//! |-----------------------|----------|------------------------------------|
//! | transport timeout     | kept     | reconnect after backoff            |
//! | protocol rejection    | kept     | next ladder rung, no backoff       |
//! | ladder exhausted      | offline  | stop until re-armed                |
//! | any other error       | offline  | reconnect after backoff            |
//! | clean broker close    | waiting  | reconnect after backoff            |
//!
//! Protocol rejections draw on one rung budget whether they come from the
//! handshake or from a subscribed session. The budget refills when a message
//! decodes or when a cycle ends any other way.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::batching::TelemetryBatcher;
use crate::broadcast::{BroadcastEvent, BroadcastSink};
use crate::broker::{
    BrokerSession, BrokerUrl, ConnectParams, Connector, InboundMessage, ProtocolVersion,
    PROTOCOL_LADDER,
};
use crate::decode::decode_alcohol_level;
use crate::errors::{BrokerError, Error, Result};
use crate::metrics::{
    CONNECTED_DEVICES, CONNECTION_ATTEMPTS_TOTAL, DECODED_MESSAGES_TOTAL, DROPPED_MESSAGES_TOTAL,
    MESSAGES_TOTAL, PROTOCOL_FALLBACKS_TOTAL,
};
use crate::model::{Device, TelemetryReading};
use crate::registry::{ConnectionHandle, ConnectionRegistry};
use crate::repository::Repository;
use crate::status::{OfflineCause, StatusTracker};

#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    pub keep_alive: Duration,
    pub reconnect_backoff: Duration,
    /// Protocol rejections tolerated before the device is given up.
    pub max_protocol_attempts: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            connect_timeout: Duration::from_secs(30),
            keep_alive: Duration::from_secs(60),
            reconnect_backoff: Duration::from_secs(5),
            max_protocol_attempts: 3,
        }
    }
}

/// `alcowatch-<deviceId>-<attempt>-<8 hex chars>`, unique per attempt.
pub fn client_id(device_id: &str, attempt: usize) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("alcowatch-{}-{}-{}", device_id, attempt, &suffix[..8])
}

/// Ladder rung for the zero-based `attempt` of a cycle starting at `start`.
pub fn ladder_rung(start: ProtocolVersion, attempt: usize) -> ProtocolVersion {
    PROTOCOL_LADDER[(start.ladder_index() + attempt) % PROTOCOL_LADDER.len()]
}

/// How one connection cycle ended.
#[derive(Debug)]
enum CycleEnd {
    Cancelled,
    Closed,
    Timeout(BrokerError),
    Protocol(BrokerError, ProtocolVersion),
    Exhausted(BrokerError),
    Failed(BrokerError),
}

struct Shared {
    repo: Arc<dyn Repository>,
    connector: Arc<dyn Connector>,
    registry: Arc<ConnectionRegistry>,
    batcher: Arc<TelemetryBatcher>,
    tracker: Arc<StatusTracker>,
    settings: ConnectionSettings,
    /// Last protocol version that produced a subscribed session, per device.
    preferred: Mutex<HashMap<String, ProtocolVersion>>,
}

impl Shared {
    fn preferred(&self, device_id: &str) -> ProtocolVersion {
        self.preferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device_id)
            .copied()
            .unwrap_or(PROTOCOL_LADDER[0])
    }

    fn set_preferred(&self, device_id: &str, version: ProtocolVersion) {
        self.preferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device_id.to_string(), version);
    }

    fn forget_preferred(&self, device_id: &str) {
        self.preferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(device_id);
    }
}

pub struct ConnectionManager {
    shared: Arc<Shared>,
    accepting: AtomicBool,
    generation: AtomicU64,
}

impl ConnectionManager {
    pub fn new(
        repo: Arc<dyn Repository>,
        connector: Arc<dyn Connector>,
        registry: Arc<ConnectionRegistry>,
        batcher: Arc<TelemetryBatcher>,
        tracker: Arc<StatusTracker>,
        settings: ConnectionSettings,
    ) -> Self {
        ConnectionManager {
            shared: Arc::new(Shared {
                repo,
                connector,
                registry,
                batcher,
                tracker,
                settings,
                preferred: Mutex::new(HashMap::new()),
            }),
            accepting: AtomicBool::new(true),
            generation: AtomicU64::new(0),
        }
    }

    /// Starts a connection for every active device. Returns how many started.
    pub async fn initialize(&self, devices: Vec<Device>) -> usize {
        let total = devices.len();
        let mut started = 0;
        for device in devices {
            if self.add_device_connection(device).await {
                started += 1;
            }
        }
        info!("Connection manager started {} of {} devices", started, total);
        started
    }

    /// Starts (or restarts) the connection for one device. Inactive devices
    /// and calls made after [`disconnect`](Self::disconnect) are ignored.
    pub async fn add_device_connection(&self, device: Device) -> bool {
        if !self.accepting.load(Ordering::SeqCst) {
            debug!(device_id = %device.device_id, "Not accepting new connections");
            return false;
        }
        if !device.is_active {
            debug!(device_id = %device.device_id, "Skipping inactive device");
            return false;
        }

        let device_id = device.device_id.clone();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();

        let link = DeviceLink {
            shared: self.shared.clone(),
            device,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(async move {
            // Wait until the handle is registered so cleanup finds it.
            if ready_rx.await.is_ok() {
                link.run(generation).await;
            }
        });

        let handle = ConnectionHandle {
            generation,
            cancel,
            task,
        };
        // Refused once disconnect has drained the registry; dropping
        // `ready_tx` ends the task before it connects.
        let replaced = match self.shared.registry.insert(&device_id, handle) {
            Ok(replaced) => replaced,
            Err(refused) => {
                drop(ready_tx);
                let _ = refused.task.await;
                debug!(device_id = %device_id, "Not accepting new connections");
                return false;
            }
        };
        let _ = ready_tx.send(());

        if let Some(old) = replaced {
            debug!(device_id = %device_id, "Replacing existing connection");
            old.cancel.cancel();
            let _ = old.task.await;
        }
        true
    }

    /// Re-arms a device: reloads its record and restarts from the first rung
    /// of the ladder. Returns `false` when the device is no longer active.
    pub async fn reconnect_device(&self, device_id: &str) -> Result<bool> {
        let device = self
            .shared
            .repo
            .get_device_by_device_id(device_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("device {}", device_id)))?;

        if !device.is_active {
            self.remove_device_connection(device_id).await;
            return Ok(false);
        }
        self.shared.forget_preferred(device_id);
        info!(device_id = %device_id, "Re-arming device connection");
        Ok(self.add_device_connection(device).await)
    }

    /// Closes one device's connection. Returns whether one was open.
    pub async fn remove_device_connection(&self, device_id: &str) -> bool {
        match self.shared.registry.remove(device_id) {
            Some(handle) => {
                handle.cancel.cancel();
                let _ = handle.task.await;
                info!(device_id = %device_id, "Device connection removed");
                true
            }
            None => false,
        }
    }

    /// Graceful shutdown: stops accepting connections, closes every broker
    /// session, then flushes buffered readings with retry. Returns how many
    /// readings the final flush persisted.
    pub async fn disconnect(&self) -> usize {
        self.accepting.store(false, Ordering::SeqCst);

        let handles = self.shared.registry.drain();
        info!("Closing {} broker connections", handles.len());
        for (_, handle) in &handles {
            handle.cancel.cancel();
        }
        for (device_id, handle) in handles {
            if let Err(e) = handle.task.await {
                error!(device_id = %device_id, error = %e, "Connection task failed");
            }
        }

        self.shared.batcher.shutdown().await
    }

    pub fn set_broadcast_sink(&self, sink: BroadcastSink) {
        self.shared.tracker.broadcaster().set_sink(sink);
    }

    pub fn get_latest_reading(&self, device_id: &str) -> Option<TelemetryReading> {
        self.shared.registry.latest(device_id)
    }

    pub fn get_all_latest_readings(&self) -> HashMap<String, TelemetryReading> {
        self.shared.registry.all_latest()
    }

    pub fn connected_device_ids(&self) -> Vec<String> {
        self.shared.registry.device_ids()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }
}

/// The task driving a single device.
struct DeviceLink {
    shared: Arc<Shared>,
    device: Device,
    cancel: CancellationToken,
}

impl DeviceLink {
    fn id(&self) -> &str {
        &self.device.device_id
    }

    async fn run(mut self, generation: u64) {
        let budget = self.shared.settings.max_protocol_attempts.max(1);
        let mut start = self.shared.preferred(self.id());
        let mut spent = 0;

        loop {
            let end = self.cycle(start, &mut spent).await;
            let backoff = match end {
                CycleEnd::Cancelled => break,
                CycleEnd::Exhausted(e) => {
                    self.give_up(&e).await;
                    break;
                }
                CycleEnd::Protocol(e, version) => {
                    spent += 1;
                    if spent >= budget {
                        self.give_up(&e).await;
                        break;
                    }
                    warn!(
                        device_id = %self.id(),
                        protocol = %version,
                        error = %e,
                        "Session rejected protocol, falling back"
                    );
                    if !self.refresh().await {
                        info!(device_id = %self.id(), "Device deactivated, stopping connection");
                        break;
                    }
                    start = ladder_rung(version, 1);
                    continue;
                }
                CycleEnd::Timeout(e) => {
                    warn!(device_id = %self.id(), error = %e, "Broker timed out, reconnecting");
                    true
                }
                CycleEnd::Failed(e) => {
                    error!(device_id = %self.id(), error = %e, "Broker connection failed");
                    self.mark_offline(OfflineCause::ConnectionError).await;
                    true
                }
                CycleEnd::Closed => {
                    info!(device_id = %self.id(), "Broker closed the connection");
                    if let Err(e) = self.shared.tracker.mark_waiting(self.id()).await {
                        error!(device_id = %self.id(), error = %e, "Failed to mark device waiting");
                    }
                    true
                }
            };

            if backoff {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.shared.settings.reconnect_backoff) => {}
                }
            }
            if !self.refresh().await {
                info!(device_id = %self.id(), "Device deactivated, stopping connection");
                break;
            }
            start = self.shared.preferred(self.id());
            spent = 0;
        }

        self.shared.registry.remove_if_current(self.id(), generation);
        debug!(device_id = %self.id(), "Connection task finished");
    }

    /// Reloads the device record. `false` once it is gone or inactive; a
    /// storage error keeps the last known record.
    async fn refresh(&mut self) -> bool {
        match self.shared.repo.get_device_by_device_id(self.id()).await {
            Ok(Some(device)) => {
                self.device = device;
                self.device.is_active
            }
            Ok(None) => false,
            Err(e) => {
                warn!(device_id = %self.id(), error = %e, "Could not reload device");
                true
            }
        }
    }

    async fn give_up(&self, e: &BrokerError) {
        error!(
            device_id = %self.id(),
            error = %e,
            "Protocol ladder exhausted, giving up until re-armed"
        );
        self.mark_offline(OfflineCause::ProtocolExhausted).await;
    }

    async fn mark_offline(&self, cause: OfflineCause) {
        if let Err(e) = self.shared.tracker.mark_offline(self.id(), cause).await {
            error!(device_id = %self.id(), error = %e, "Failed to mark device offline");
        }
    }

    async fn cycle(&self, start: ProtocolVersion, spent: &mut usize) -> CycleEnd {
        let (mut session, version) = match self.negotiate(start, spent).await {
            Ok(open) => open,
            Err(end) => return end,
        };

        CONNECTED_DEVICES.inc();
        let end = self.stream(session.as_mut(), version, spent).await;
        CONNECTED_DEVICES.dec();

        session.close().await;
        end
    }

    /// Walks the ladder from `start` until a session is open and subscribed,
    /// charging each rejection to `spent`.
    async fn negotiate(
        &self,
        start: ProtocolVersion,
        spent: &mut usize,
    ) -> std::result::Result<(Box<dyn BrokerSession>, ProtocolVersion), CycleEnd> {
        let settings = &self.shared.settings;
        let url = BrokerUrl::for_device(&self.device);
        let budget = settings.max_protocol_attempts.max(1);
        let mut last_error = None;
        let mut rung = 0;

        while *spent < budget {
            let attempt = *spent;
            let version = ladder_rung(start, rung);
            rung += 1;
            let params = ConnectParams {
                url: url.clone(),
                client_id: client_id(self.id(), attempt + 1),
                version,
                credentials: self.device.credentials.clone(),
                keep_alive: settings.keep_alive,
                connect_timeout: settings.connect_timeout,
            };

            CONNECTION_ATTEMPTS_TOTAL.inc();
            if attempt > 0 {
                PROTOCOL_FALLBACKS_TOTAL.inc();
            }
            info!(
                device_id = %self.id(),
                url = %params.url,
                protocol = %version,
                attempt = attempt + 1,
                "Connecting to broker"
            );

            let opened = tokio::select! {
                _ = self.cancel.cancelled() => return Err(CycleEnd::Cancelled),
                opened = self.open(&params) => opened,
            };

            match opened {
                Ok(session) => {
                    self.shared.set_preferred(self.id(), version);
                    if let Err(e) = self.shared.tracker.mark_online(self.id()).await {
                        error!(device_id = %self.id(), error = %e, "Failed to mark device online");
                    }
                    info!(
                        device_id = %self.id(),
                        topic = %self.device.topic,
                        protocol = %version,
                        "Subscribed"
                    );
                    return Ok((session, version));
                }
                Err(e) if e.is_protocol() => {
                    warn!(
                        device_id = %self.id(),
                        protocol = %version,
                        error = %e,
                        "Broker rejected protocol version"
                    );
                    *spent += 1;
                    last_error = Some(e);
                }
                Err(e) if e.is_timeout() => return Err(CycleEnd::Timeout(e)),
                Err(e) => return Err(CycleEnd::Failed(e)),
            }
        }

        Err(CycleEnd::Exhausted(last_error.unwrap_or_else(|| {
            BrokerError::Protocol("no protocol version accepted".to_string())
        })))
    }

    async fn open(&self, params: &ConnectParams) -> std::result::Result<Box<dyn BrokerSession>, BrokerError> {
        let mut session = self.shared.connector.connect(params).await?;
        if let Err(e) = session.subscribe(&self.device.topic).await {
            session.close().await;
            return Err(e);
        }
        Ok(session)
    }

    async fn stream(
        &self,
        session: &mut dyn BrokerSession,
        version: ProtocolVersion,
        spent: &mut usize,
    ) -> CycleEnd {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return CycleEnd::Cancelled,
                next = session.next_message() => next,
            };
            match next {
                Ok(Some(message)) => {
                    if self.on_message(message).await {
                        *spent = 0;
                    }
                }
                Ok(None) => return CycleEnd::Closed,
                Err(e @ BrokerError::Timeout(_)) => return CycleEnd::Timeout(e),
                Err(e @ BrokerError::Protocol(_)) => return CycleEnd::Protocol(e, version),
                Err(e) => return CycleEnd::Failed(e),
            }
        }
    }

    /// Decode, cache, announce, buffer, then refresh liveness. The sensor
    /// update goes out before the reading is queued for storage. Returns
    /// whether the payload decoded.
    async fn on_message(&self, message: InboundMessage) -> bool {
        MESSAGES_TOTAL.inc();
        let level = match decode_alcohol_level(&message.payload) {
            Ok(level) => level,
            Err(e) => {
                DROPPED_MESSAGES_TOTAL.inc();
                warn!(
                    device_id = %self.id(),
                    topic = %message.topic,
                    payload = %message.preview(),
                    error = %e,
                    "Dropping undecodable message"
                );
                return false;
            }
        };
        DECODED_MESSAGES_TOTAL.inc();

        let tracker = &self.shared.tracker;
        let reading = TelemetryReading::new(self.id(), level, tracker.clock().now());
        debug!(
            device_id = %self.id(),
            alcohol_level = level,
            alert_status = %reading.alert_status,
            "Reading received"
        );

        self.shared.registry.set_latest(reading.clone());
        tracker
            .broadcaster()
            .publish(BroadcastEvent::sensor_data(&reading));
        self.shared.batcher.enqueue(reading);

        if let Err(e) = tracker.mark_online(self.id()).await {
            error!(device_id = %self.id(), error = %e, "Failed to refresh device status");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_is_unique_per_attempt() {
        let a = client_id("D1", 1);
        let b = client_id("D1", 1);
        assert!(a.starts_with("alcowatch-D1-1-"));
        assert_eq!(a.len(), "alcowatch-D1-1-".len() + 8);
        assert_ne!(a, b);
        assert!(client_id("D1", 2).starts_with("alcowatch-D1-2-"));
    }

    #[test]
    fn test_ladder_wraps_from_preferred_version() {
        assert_eq!(ladder_rung(ProtocolVersion::V311, 0), ProtocolVersion::V311);
        assert_eq!(ladder_rung(ProtocolVersion::V311, 2), ProtocolVersion::V31);
        assert_eq!(ladder_rung(ProtocolVersion::V5, 1), ProtocolVersion::V31);
        assert_eq!(ladder_rung(ProtocolVersion::V5, 2), ProtocolVersion::V311);
    }

    #[test]
    fn test_default_settings() {
        let settings = ConnectionSettings::default();
        assert_eq!(settings.max_protocol_attempts, 3);
        assert_eq!(settings.connect_timeout, Duration::from_secs(30));
        assert_eq!(settings.reconnect_backoff, Duration::from_secs(5));
    }
}
