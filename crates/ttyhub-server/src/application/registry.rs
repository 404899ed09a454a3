//! Directory of connected devices, grouped by namespace.
//!
//! The broker is the only writer.  Readers (the tunnel, status queries) may
//! look things up from any task concurrently; the map is a sharded
//! `DashMap<group, HashMap<id, DeviceRecord>>`, so a lookup never waits on
//! the broker loop.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime};

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;

use crate::application::endpoint::{DeviceEndpoint, Endpoint};
use crate::domain::{ConnId, DeviceKey};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("device {0} is already registered")]
    AlreadyRegistered(DeviceKey),
}

/// Everything the hub remembers about one connected device.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub key: DeviceKey,
    pub description: String,
    pub proto_version: u8,
    /// Device-reported uptime in seconds, refreshed by heartbeats.
    pub uptime: u32,
    pub connected_at: SystemTime,
    connected: Instant,
    endpoint: DeviceEndpoint,
}

impl DeviceRecord {
    pub fn new(endpoint: DeviceEndpoint, description: String, proto_version: u8) -> Self {
        Self {
            key: endpoint.key().clone(),
            description,
            proto_version,
            uptime: 0,
            connected_at: SystemTime::now(),
            connected: Instant::now(),
            endpoint,
        }
    }

    pub fn conn_id(&self) -> ConnId {
        self.endpoint.conn_id()
    }

    pub fn endpoint(&self) -> &DeviceEndpoint {
        &self.endpoint
    }

    pub fn connected_for(&self) -> Duration {
        self.connected.elapsed()
    }

    fn summary(&self) -> DeviceSummary {
        DeviceSummary {
            id: self.key.id.clone(),
            description: self.description.clone(),
            proto_version: self.proto_version,
            connected_secs: self.connected_for().as_secs(),
            uptime: self.uptime,
        }
    }
}

/// A device as shown in listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSummary {
    pub id: String,
    pub description: String,
    pub proto_version: u8,
    pub connected_secs: u64,
    pub uptime: u32,
}

/// All devices of one group, sorted by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupListing {
    pub group: String,
    pub devices: Vec<DeviceSummary>,
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    groups: DashMap<String, HashMap<String, DeviceRecord>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `record` unless its id is already taken in the group.
    pub fn insert(&self, record: DeviceRecord) -> Result<(), RegistryError> {
        let mut group = self.groups.entry(record.key.group.clone()).or_default();
        if group.contains_key(&record.key.id) {
            return Err(RegistryError::AlreadyRegistered(record.key));
        }
        group.insert(record.key.id.clone(), record);
        Ok(())
    }

    /// Removes `key` if it still belongs to connection `conn_id`.
    ///
    /// A stale disconnect from a previous connection under the same id is
    /// ignored and reports `false`.  Groups left empty are dropped.
    pub fn remove(&self, key: &DeviceKey, conn_id: ConnId) -> bool {
        let removed = match self.groups.get_mut(&key.group) {
            Some(mut group) => {
                let owned = group.get(&key.id).is_some_and(|r| r.conn_id() == conn_id);
                owned && group.remove(&key.id).is_some()
            }
            None => false,
        };
        self.groups.remove_if(&key.group, |_, group| group.is_empty());
        removed
    }

    pub fn contains(&self, key: &DeviceKey) -> bool {
        self.groups
            .get(&key.group)
            .is_some_and(|group| group.contains_key(&key.id))
    }

    pub fn endpoint(&self, key: &DeviceKey) -> Option<DeviceEndpoint> {
        let group = self.groups.get(&key.group)?;
        group.get(&key.id).map(|r| r.endpoint.clone())
    }

    pub fn summary(&self, key: &DeviceKey) -> Option<DeviceSummary> {
        let group = self.groups.get(&key.group)?;
        group.get(&key.id).map(DeviceRecord::summary)
    }

    /// Records a heartbeat-reported uptime for the current connection.
    pub fn set_uptime(&self, key: &DeviceKey, conn_id: ConnId, uptime: u32) {
        if let Some(mut group) = self.groups.get_mut(&key.group) {
            if let Some(record) = group.get_mut(&key.id).filter(|r| r.conn_id() == conn_id) {
                record.uptime = uptime;
            }
        }
    }

    pub fn device_count(&self) -> usize {
        self.groups.iter().map(|group| group.len()).sum()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Devices in one group, sorted by id.
    pub fn list_group(&self, group: &str) -> Vec<DeviceSummary> {
        let mut devices: Vec<_> = self
            .groups
            .get(group)
            .map(|g| g.values().map(DeviceRecord::summary).collect())
            .unwrap_or_default();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    /// Every group and its devices, sorted by group then id.
    pub fn snapshot(&self) -> Vec<GroupListing> {
        let mut groups: Vec<GroupListing> = self
            .groups
            .iter()
            .map(|entry| {
                let mut devices: Vec<_> = entry.values().map(DeviceRecord::summary).collect();
                devices.sort_by(|a, b| a.id.cmp(&b.id));
                GroupListing {
                    group: entry.key().clone(),
                    devices,
                }
            })
            .collect();
        groups.sort_by(|a, b| a.group.cmp(&b.group));
        groups
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn record(group: &str, id: &str) -> DeviceRecord {
        let (endpoint, _queue) = DeviceEndpoint::new(DeviceKey::new(group, id), 4);
        DeviceRecord::new(endpoint, format!("{id} board"), 1)
    }

    #[test]
    fn test_insert_rejects_duplicate_in_same_group() {
        // Arrange
        let registry = DeviceRegistry::new();
        registry.insert(record("lab", "gw")).unwrap();

        // Act
        let dup = registry.insert(record("lab", "gw"));

        // Assert
        assert_eq!(
            dup,
            Err(RegistryError::AlreadyRegistered(DeviceKey::new("lab", "gw")))
        );
        assert_eq!(registry.device_count(), 1);
    }

    #[test]
    fn test_same_id_in_different_groups_coexists() {
        let registry = DeviceRegistry::new();
        registry.insert(record("lab", "gw")).unwrap();
        registry.insert(record("field", "gw")).unwrap();
        assert_eq!(registry.device_count(), 2);
        assert_eq!(registry.group_count(), 2);
    }

    #[test]
    fn test_remove_requires_matching_connection() {
        // Arrange
        let registry = DeviceRegistry::new();
        let rec = record("", "gw");
        let owner = rec.conn_id();
        registry.insert(rec).unwrap();

        // Act / Assert: a stale connection cannot remove the new one.
        assert!(!registry.remove(&DeviceKey::new("", "gw"), ConnId::new()));
        assert!(registry.contains(&DeviceKey::new("", "gw")));

        assert!(registry.remove(&DeviceKey::new("", "gw"), owner));
        assert!(!registry.contains(&DeviceKey::new("", "gw")));
    }

    #[test]
    fn test_empty_group_is_pruned() {
        let registry = DeviceRegistry::new();
        let rec = record("lab", "gw");
        let owner = rec.conn_id();
        registry.insert(rec).unwrap();

        registry.remove(&DeviceKey::new("lab", "gw"), owner);

        assert_eq!(registry.group_count(), 0);
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn test_set_uptime_shows_in_summary() {
        let registry = DeviceRegistry::new();
        let rec = record("", "gw");
        let owner = rec.conn_id();
        registry.insert(rec).unwrap();
        let key = DeviceKey::new("", "gw");

        registry.set_uptime(&key, owner, 3600);
        registry.set_uptime(&key, ConnId::new(), 1);

        let summary = registry.summary(&key).unwrap();
        assert_eq!(summary.uptime, 3600);
        assert_eq!(summary.description, "gw board");
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let registry = DeviceRegistry::new();
        for (group, id) in [("b", "z"), ("a", "y"), ("b", "x")] {
            registry.insert(record(group, id)).unwrap();
        }

        let snapshot = registry.snapshot();

        let shape: Vec<(String, Vec<String>)> = snapshot
            .into_iter()
            .map(|g| (g.group, g.devices.into_iter().map(|d| d.id).collect()))
            .collect();
        assert_eq!(
            shape,
            vec![
                ("a".to_string(), vec!["y".to_string()]),
                ("b".to_string(), vec!["x".to_string(), "z".to_string()]),
            ]
        );
        assert_eq!(registry.list_group("b").len(), 2);
        assert!(registry.list_group("missing").is_empty());
    }

    #[test]
    fn test_endpoint_lookup() {
        let registry = DeviceRegistry::new();
        let rec = record("", "gw");
        let owner = rec.conn_id();
        registry.insert(rec).unwrap();

        let ep = registry.endpoint(&DeviceKey::new("", "gw")).unwrap();
        assert_eq!(ep.conn_id(), owner);
        assert!(registry.endpoint(&DeviceKey::new("", "nope")).is_none());
    }
}
