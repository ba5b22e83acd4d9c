use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::model::TelemetryReading;

/// A running per-device connection task.
#[derive(Debug)]
pub struct ConnectionHandle {
    /// Distinguishes successive tasks for the same device so a finished task
    /// cannot deregister its replacement.
    pub generation: u64,
    pub cancel: CancellationToken,
    pub task: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct Connections {
    handles: HashMap<String, ConnectionHandle>,
    closed: bool,
}

/// Shared state of the connection manager: live connections by device and
/// the last reading received from each device.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<Connections>,
    latest: RwLock<HashMap<String, TelemetryReading>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn connections(&self) -> std::sync::RwLockWriteGuard<'_, Connections> {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a connection, returning the one it replaced. Once the
    /// registry has been drained the handle is refused and handed back.
    pub fn insert(
        &self,
        device_id: &str,
        handle: ConnectionHandle,
    ) -> Result<Option<ConnectionHandle>, ConnectionHandle> {
        let mut connections = self.connections();
        if connections.closed {
            return Err(handle);
        }
        Ok(connections.handles.insert(device_id.to_string(), handle))
    }

    pub fn remove(&self, device_id: &str) -> Option<ConnectionHandle> {
        self.connections().handles.remove(device_id)
    }

    /// Removes the entry only if it still belongs to `generation`.
    pub fn remove_if_current(&self, device_id: &str, generation: u64) -> bool {
        let mut connections = self.connections();
        match connections.handles.get(device_id) {
            Some(handle) if handle.generation == generation => {
                connections.handles.remove(device_id);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .handles
            .contains_key(device_id)
    }

    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .handles
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Removes every connection and refuses any registered afterwards.
    pub fn drain(&self) -> Vec<(String, ConnectionHandle)> {
        let mut connections = self.connections();
        connections.closed = true;
        connections.handles.drain().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .handles
            .len()
    }

    pub fn set_latest(&self, reading: TelemetryReading) {
        self.latest
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(reading.device_id.clone(), reading);
    }

    pub fn latest(&self, device_id: &str) -> Option<TelemetryReading> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device_id)
            .cloned()
    }

    pub fn all_latest(&self) -> HashMap<String, TelemetryReading> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn handle(generation: u64) -> ConnectionHandle {
        ConnectionHandle {
            generation,
            cancel: CancellationToken::new(),
            task: tokio::spawn(async {}),
        }
    }

    #[tokio::test]
    async fn test_stale_generation_does_not_remove_replacement() {
        let registry = ConnectionRegistry::new();
        registry.insert("D1", handle(1)).unwrap();
        let replaced = registry.insert("D1", handle(2)).unwrap();
        assert_eq!(replaced.map(|h| h.generation), Some(1));

        assert!(!registry.remove_if_current("D1", 1));
        assert!(registry.contains("D1"));
        assert!(registry.remove_if_current("D1", 2));
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_device_ids_sorted_and_drained() {
        let registry = ConnectionRegistry::new();
        registry.insert("B", handle(1)).unwrap();
        registry.insert("A", handle(2)).unwrap();
        assert_eq!(registry.device_ids(), vec!["A", "B"]);
        assert_eq!(registry.drain().len(), 2);
        assert!(registry.device_ids().is_empty());
    }

    #[tokio::test]
    async fn test_drained_registry_refuses_inserts() {
        let registry = ConnectionRegistry::new();
        registry.insert("A", handle(1)).unwrap();
        registry.drain();

        let refused = registry.insert("B", handle(2));
        assert_eq!(refused.map_err(|h| h.generation).err(), Some(2));
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn test_latest_reading_replaced_per_device() {
        let registry = ConnectionRegistry::new();
        registry.set_latest(TelemetryReading::new("D1", 100, Utc::now()));
        registry.set_latest(TelemetryReading::new("D1", 2000, Utc::now()));
        registry.set_latest(TelemetryReading::new("D2", 5, Utc::now()));

        assert_eq!(registry.latest("D1").unwrap().alcohol_level, 2000);
        assert_eq!(registry.all_latest().len(), 2);
        assert!(registry.latest("D3").is_none());
    }
}
