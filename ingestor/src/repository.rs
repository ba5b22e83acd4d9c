use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::PoisonError;

use crate::errors::{Error, Result};
use crate::model::{
    CleanupSchedule, CleanupScheduleUpdate, Device, DeviceUpdate, OfflineEvent, TelemetryReading,
};

/// Durable store the ingestion core reads from and writes to.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_devices(&self) -> Result<Vec<Device>>;

    async fn get_device_by_device_id(&self, device_id: &str) -> Result<Option<Device>>;

    /// Applies a partial update and returns the updated record, or `None` if
    /// the device does not exist.
    async fn update_device(&self, device_id: &str, update: DeviceUpdate) -> Result<Option<Device>>;

    async fn create_device_data(&self, reading: &TelemetryReading) -> Result<()>;

    async fn log_device_offline_event(&self, device_id: &str, at: DateTime<Utc>) -> Result<()>;

    async fn get_offline_events(&self, device_id: &str) -> Result<Vec<OfflineEvent>>;

    async fn get_cleanup_schedule(&self, task_name: &str) -> Result<Option<CleanupSchedule>>;

    async fn create_cleanup_schedule(&self, schedule: &CleanupSchedule) -> Result<CleanupSchedule>;

    async fn update_cleanup_schedule(
        &self,
        task_name: &str,
        update: CleanupScheduleUpdate,
    ) -> Result<Option<CleanupSchedule>>;

    /// Deletes every telemetry reading and returns how many were removed.
    async fn clear_all_device_data(&self) -> Result<u64>;
}

#[derive(Debug, Default)]
struct MemoryState {
    devices: Vec<Device>,
    readings: Vec<TelemetryReading>,
    offline_events: Vec<OfflineEvent>,
    schedules: HashMap<String, CleanupSchedule>,
    fail_next_inserts: usize,
    failing_devices: HashSet<String>,
    fail_clear: bool,
    insert_attempts: usize,
}

/// In-process repository with fault injection, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    state: Mutex<MemoryState>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: Vec<Device>) -> Self {
        let repo = Self::new();
        repo.state().devices = devices;
        repo
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn upsert_device(&self, device: Device) {
        let mut state = self.state();
        match state
            .devices
            .iter_mut()
            .find(|d| d.device_id == device.device_id)
        {
            Some(existing) => *existing = device,
            None => state.devices.push(device),
        }
    }

    pub fn readings(&self) -> Vec<TelemetryReading> {
        self.state().readings.clone()
    }

    pub fn reading_count(&self) -> usize {
        self.state().readings.len()
    }

    pub fn offline_events(&self) -> Vec<OfflineEvent> {
        self.state().offline_events.clone()
    }

    /// Total `create_device_data` calls, successful or not.
    pub fn insert_attempts(&self) -> usize {
        self.state().insert_attempts
    }

    /// Makes the next `n` reading inserts fail.
    pub fn fail_next_inserts(&self, n: usize) {
        self.state().fail_next_inserts = n;
    }

    /// Makes every insert for `device_id` fail until cleared.
    pub fn fail_inserts_for(&self, device_id: &str) {
        self.state().failing_devices.insert(device_id.to_string());
    }

    pub fn clear_insert_failures(&self) {
        let mut state = self.state();
        state.fail_next_inserts = 0;
        state.failing_devices.clear();
    }

    pub fn set_fail_clear(&self, fail: bool) {
        self.state().fail_clear = fail;
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn get_devices(&self) -> Result<Vec<Device>> {
        let mut devices = self.state().devices.clone();
        devices.sort_by_key(|d| d.display_order);
        Ok(devices)
    }

    async fn get_device_by_device_id(&self, device_id: &str) -> Result<Option<Device>> {
        Ok(self
            .state()
            .devices
            .iter()
            .find(|d| d.device_id == device_id)
            .cloned())
    }

    async fn update_device(&self, device_id: &str, update: DeviceUpdate) -> Result<Option<Device>> {
        let mut state = self.state();
        Ok(state
            .devices
            .iter_mut()
            .find(|d| d.device_id == device_id)
            .map(|device| {
                device.apply(&update);
                device.clone()
            }))
    }

    async fn create_device_data(&self, reading: &TelemetryReading) -> Result<()> {
        let mut state = self.state();
        state.insert_attempts += 1;
        if state.failing_devices.contains(&reading.device_id) {
            return Err(Error::Storage(format!(
                "insert rejected for device {}",
                reading.device_id
            )));
        }
        if state.fail_next_inserts > 0 {
            state.fail_next_inserts -= 1;
            return Err(Error::Storage("storage unavailable".to_string()));
        }
        state.readings.push(reading.clone());
        Ok(())
    }

    async fn log_device_offline_event(&self, device_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.state().offline_events.push(OfflineEvent {
            device_id: device_id.to_string(),
            offline_at: at,
        });
        Ok(())
    }

    async fn get_offline_events(&self, device_id: &str) -> Result<Vec<OfflineEvent>> {
        Ok(self
            .state()
            .offline_events
            .iter()
            .filter(|e| e.device_id == device_id)
            .cloned()
            .collect())
    }

    async fn get_cleanup_schedule(&self, task_name: &str) -> Result<Option<CleanupSchedule>> {
        Ok(self.state().schedules.get(task_name).cloned())
    }

    async fn create_cleanup_schedule(&self, schedule: &CleanupSchedule) -> Result<CleanupSchedule> {
        self.state()
            .schedules
            .insert(schedule.task_name.clone(), schedule.clone());
        Ok(schedule.clone())
    }

    async fn update_cleanup_schedule(
        &self,
        task_name: &str,
        update: CleanupScheduleUpdate,
    ) -> Result<Option<CleanupSchedule>> {
        let mut state = self.state();
        Ok(state.schedules.get_mut(task_name).map(|schedule| {
            schedule.apply(&update);
            schedule.clone()
        }))
    }

    async fn clear_all_device_data(&self) -> Result<u64> {
        let mut state = self.state();
        if state.fail_clear {
            return Err(Error::Storage("wipe failed: storage unavailable".to_string()));
        }
        let deleted = state.readings.len() as u64;
        state.readings.clear();
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceStatus, ProtocolVariant};

    fn device(id: &str, order: i32) -> Device {
        let mut d = Device::new(id, "localhost", format!("sensors/{}", id), ProtocolVariant::Mqtt);
        d.display_order = order;
        d
    }

    #[test]
    fn test_update_device_applies_partial() {
        tokio_test::block_on(async {
            let repo = MemoryRepository::with_devices(vec![device("D1", 0)]);
            let at = Utc::now();
            let updated = repo
                .update_device("D1", DeviceUpdate::status(DeviceStatus::Online, at))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(updated.status, DeviceStatus::Online);
            assert_eq!(updated.last_seen, Some(at));

            let missing = repo
                .update_device("nope", DeviceUpdate::default())
                .await
                .unwrap();
            assert!(missing.is_none());
        });
    }

    #[test]
    fn test_devices_sorted_by_display_order() {
        tokio_test::block_on(async {
            let repo = MemoryRepository::with_devices(vec![device("B", 2), device("A", 1)]);
            let ids: Vec<_> = repo
                .get_devices()
                .await
                .unwrap()
                .into_iter()
                .map(|d| d.device_id)
                .collect();
            assert_eq!(ids, vec!["A", "B"]);
        });
    }

    #[test]
    fn test_insert_fault_injection() {
        tokio_test::block_on(async {
            let repo = MemoryRepository::new();
            repo.fail_next_inserts(1);
            let reading = TelemetryReading::new("D1", 10, Utc::now());
            assert!(repo.create_device_data(&reading).await.is_err());
            assert!(repo.create_device_data(&reading).await.is_ok());
            assert_eq!(repo.reading_count(), 1);
            assert_eq!(repo.insert_attempts(), 2);

            repo.fail_inserts_for("D2");
            let other = TelemetryReading::new("D2", 10, Utc::now());
            assert!(repo.create_device_data(&other).await.is_err());
        });
    }

    #[test]
    fn test_clear_returns_deleted_count() {
        tokio_test::block_on(async {
            let repo = MemoryRepository::new();
            for level in 0..5 {
                let reading = TelemetryReading::new("D1", level, Utc::now());
                repo.create_device_data(&reading).await.unwrap();
            }
            repo.set_fail_clear(true);
            assert!(repo.clear_all_device_data().await.is_err());
            assert_eq!(repo.reading_count(), 5);

            repo.set_fail_clear(false);
            assert_eq!(repo.clear_all_device_data().await.unwrap(), 5);
            assert_eq!(repo.reading_count(), 0);
        });
    }
}
