//! Paired Device Registry
//!
//! Durable store of paired devices plus the transient set of devices whose
//! link is currently active.
//!
//! ## Invariants
//!
//! - A device name appears at most once.
//! - A channel is held by at most one device.
//! - A connected name is always a registered name.
//!
//! ## Persistence
//!
//! Each device is one JSON file in the cache directory, named after the
//! SHA-256 of the device name. Files load independently: a file that fails
//! to parse is logged and skipped, the rest of the registry still loads.
//! Mutations only mark records dirty; [`DeviceRegistry::flush`] writes them.

use crate::crypto::SealedSecret;
use crate::fs_utils::{ensure_dir, remove_if_exists, write_atomic};
use crate::pairing::codec::{validate_channel, validate_device_name};
use crate::{ProtocolError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const RECORD_EXTENSION: &str = "json";

/// Durable record of a paired device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Stable device name
    pub name: String,

    /// Base64 DER public key of the device
    pub public_key: String,

    /// Last known address, refreshed on reconnect
    pub remote_ip: IpAddr,

    /// Assigned link channel
    pub channel: u16,

    /// When the device was first paired
    pub paired_at: DateTime<Utc>,

    /// When the link was last active
    #[serde(default)]
    pub last_connected: Option<DateTime<Utc>>,

    /// Session key sealed under the local storage key
    pub session_key: SealedSecret,
}

impl Device {
    pub fn new(
        name: impl Into<String>,
        public_key: impl Into<String>,
        remote_ip: IpAddr,
        channel: u16,
        session_key: SealedSecret,
    ) -> Self {
        Self {
            name: name.into(),
            public_key: public_key.into(),
            remote_ip,
            channel,
            paired_at: Utc::now(),
            last_connected: None,
            session_key,
        }
    }

    /// Seconds since the link was last active, if ever
    pub fn seconds_since_connected(&self) -> Option<i64> {
        self.last_connected
            .map(|at| (Utc::now() - at).num_seconds().max(0))
    }
}

/// Immutable point-in-time listing
///
/// Cheap to clone and iterate any number of times; later registry mutations
/// never show up in an existing snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot<T>(Arc<[T]>);

impl<T> Snapshot<T> {
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.0
    }
}

impl<T> Default for Snapshot<T> {
    fn default() -> Self {
        Self(Arc::from(Vec::new()))
    }
}

impl<T> From<Vec<T>> for Snapshot<T> {
    fn from(items: Vec<T>) -> Self {
        Self(Arc::from(items))
    }
}

impl<'a, T> IntoIterator for &'a Snapshot<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Cache file name for a device name
pub fn record_file_name(name: &str) -> String {
    format!("{}.{}", hex::encode(Sha256::digest(name.as_bytes())), RECORD_EXTENSION)
}

/// Registry of paired devices
#[derive(Debug)]
pub struct DeviceRegistry {
    /// Directory holding one record file per device
    cache_dir: PathBuf,

    /// Paired devices by name
    devices: BTreeMap<String, Device>,

    /// Names with an active link
    connected: BTreeSet<String>,

    /// Names whose record must be written on flush
    dirty: BTreeSet<String>,

    /// Names whose record must be deleted on flush
    removed: BTreeSet<String>,
}

impl DeviceRegistry {
    /// Open the registry in `cache_dir`, loading every readable record
    pub fn open(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let cache_dir = cache_dir.into();
        ensure_dir(&cache_dir)?;

        let mut registry = Self {
            cache_dir,
            devices: BTreeMap::new(),
            connected: BTreeSet::new(),
            dirty: BTreeSet::new(),
            removed: BTreeSet::new(),
        };
        registry.load()?;
        Ok(registry)
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn load(&mut self) -> Result<()> {
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.cache_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXTENSION))
            .collect();
        paths.sort();

        let mut skipped = 0;
        for path in paths {
            match self.load_record(&path) {
                Ok(device) => {
                    debug!("Loaded device {} from {:?}", device.name, path);
                    self.devices.insert(device.name.clone(), device);
                }
                Err(e) => {
                    warn!("Skipping device record: {}", e);
                    skipped += 1;
                }
            }
        }

        info!(
            "Loaded {} paired devices from {:?} ({} skipped)",
            self.devices.len(),
            self.cache_dir,
            skipped
        );
        Ok(())
    }

    fn load_record(&self, path: &Path) -> Result<Device> {
        let corruption = |reason: String| ProtocolError::RegistryCorruption {
            path: path.to_path_buf(),
            reason,
        };

        let bytes = fs::read(path).map_err(|e| corruption(e.to_string()))?;
        let device: Device = serde_json::from_slice(&bytes).map_err(|e| corruption(e.to_string()))?;

        validate_device_name(&device.name).map_err(|e| corruption(e.to_string()))?;
        validate_channel(i64::from(device.channel)).map_err(|e| corruption(e.to_string()))?;

        let expected = record_file_name(&device.name);
        if path.file_name().and_then(|n| n.to_str()) != Some(expected.as_str()) {
            return Err(corruption(format!(
                "record for '{}' stored under the wrong file name",
                device.name
            )));
        }

        if let Some(owner) = self.channel_owner(device.channel) {
            return Err(corruption(format!(
                "channel {} already held by '{}'",
                device.channel, owner
            )));
        }

        Ok(device)
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.cache_dir.join(record_file_name(name))
    }

    /// Insert or replace a device
    ///
    /// Re-pairing a known name replaces its key, address, channel and
    /// session key but keeps the original `paired_at`.
    pub fn upsert(&mut self, mut device: Device) -> Result<()> {
        validate_device_name(&device.name)?;
        validate_channel(i64::from(device.channel))?;

        if let Some(owner) = self.channel_owner(device.channel) {
            if owner != device.name {
                return Err(ProtocolError::ChannelInUse {
                    channel: device.channel,
                    owner: owner.to_string(),
                });
            }
        }

        if let Some(existing) = self.devices.get(&device.name) {
            device.paired_at = existing.paired_at;
            debug!("Updating paired device {}", device.name);
        } else {
            info!("Adding paired device {} on channel {}", device.name, device.channel);
        }

        let name = device.name.clone();
        self.devices.insert(name.clone(), device);
        self.removed.remove(&name);
        self.dirty.insert(name);
        Ok(())
    }

    /// Remove a device and any connected-link record for it
    ///
    /// Removing an unknown name is a no-op.
    pub fn remove(&mut self, name: &str) -> Option<Device> {
        self.connected.remove(name);
        let removed = self.devices.remove(name)?;

        info!("Removing paired device {}", name);
        self.dirty.remove(name);
        self.removed.insert(name.to_string());
        Some(removed)
    }

    pub fn get(&self, name: &str) -> Option<&Device> {
        self.devices.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.devices.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Device currently holding `channel`
    pub fn channel_owner(&self, channel: u16) -> Option<&str> {
        self.devices
            .values()
            .find(|d| d.channel == channel)
            .map(|d| d.name.as_str())
    }

    /// Move a device to another channel
    pub fn set_channel(&mut self, name: &str, channel: u16) -> Result<()> {
        validate_channel(i64::from(channel))?;

        if let Some(owner) = self.channel_owner(channel) {
            if owner != name {
                return Err(ProtocolError::ChannelInUse {
                    channel,
                    owner: owner.to_string(),
                });
            }
        }

        let device = self
            .devices
            .get_mut(name)
            .ok_or_else(|| ProtocolError::DeviceNotFound(name.to_string()))?;

        if device.channel != channel {
            info!("Moving {} from channel {} to {}", name, device.channel, channel);
            device.channel = channel;
            self.dirty.insert(name.to_string());
        }
        Ok(())
    }

    /// Refresh address and timestamp after a successful (re)connect
    pub fn record_reconnect(
        &mut self,
        name: &str,
        remote_ip: Option<IpAddr>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let device = self
            .devices
            .get_mut(name)
            .ok_or_else(|| ProtocolError::DeviceNotFound(name.to_string()))?;

        if let Some(ip) = remote_ip {
            if device.remote_ip != ip {
                debug!("Device {} moved from {} to {}", name, device.remote_ip, ip);
                device.remote_ip = ip;
            }
        }
        device.last_connected = Some(at);
        self.dirty.insert(name.to_string());
        Ok(())
    }

    /// Record an active link; only registered names are accepted
    ///
    /// Returns whether the name was newly marked.
    pub fn mark_connected(&mut self, name: &str) -> Result<bool> {
        if !self.devices.contains_key(name) {
            return Err(ProtocolError::DeviceNotFound(name.to_string()));
        }
        Ok(self.connected.insert(name.to_string()))
    }

    /// Clear an active link record; returns whether it was present
    pub fn mark_disconnected(&mut self, name: &str) -> bool {
        self.connected.remove(name)
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.connected.contains(name)
    }

    /// Snapshot of all paired devices, ordered by name
    pub fn list_paired(&self) -> Snapshot<Device> {
        Snapshot::from(self.devices.values().cloned().collect::<Vec<_>>())
    }

    /// Snapshot of connected device names, ordered by name
    pub fn list_connected(&self) -> Snapshot<String> {
        Snapshot::from(self.connected.iter().cloned().collect::<Vec<_>>())
    }

    /// Paired devices without an active link
    pub fn list_disconnected(&self) -> Snapshot<Device> {
        Snapshot::from(
            self.devices
                .values()
                .filter(|d| !self.connected.contains(&d.name))
                .cloned()
                .collect::<Vec<_>>(),
        )
    }

    /// Whether there are unflushed changes
    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty() || !self.removed.is_empty()
    }

    /// Write dirty records and delete removed ones
    ///
    /// Every pending file is attempted; the first failure is returned after
    /// the rest have been processed, and failed files stay pending.
    pub fn flush(&mut self) -> Result<usize> {
        let mut first_error = None;
        let mut written = 0;

        for name in std::mem::take(&mut self.removed) {
            if let Err(e) = remove_if_exists(self.record_path(&name)) {
                warn!("Failed to delete record of {}: {}", name, e);
                self.removed.insert(name);
                first_error.get_or_insert(e);
            }
        }

        for name in std::mem::take(&mut self.dirty) {
            let Some(device) = self.devices.get(&name) else {
                continue;
            };

            let result = serde_json::to_vec_pretty(device)
                .map_err(ProtocolError::from)
                .and_then(|json| write_atomic(self.record_path(&name), &json));

            match result {
                Ok(()) => written += 1,
                Err(e) => {
                    warn!("Failed to write record of {}: {}", name, e);
                    self.dirty.insert(name);
                    first_error.get_or_insert(e);
                }
            }
        }

        if written > 0 {
            debug!("Flushed {} device records to {:?}", written, self.cache_dir);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sealed() -> SealedSecret {
        SealedSecret {
            nonce: "AAAAAAAAAAAAAAAA".to_string(),
            data: "c2VhbGVk".to_string(),
        }
    }

    fn device(name: &str, ip: &str, channel: u16) -> Device {
        Device::new(name, "MIIBIjAN", ip.parse().unwrap(), channel, sealed())
    }

    #[test]
    fn test_seconds_since_connected() {
        let mut rover = device("rover", "10.0.0.1", 3);
        assert_eq!(rover.seconds_since_connected(), None);

        rover.last_connected = Some(Utc::now() - chrono::Duration::seconds(90));
        let secs = rover.seconds_since_connected().unwrap();
        assert!((90..95).contains(&secs));

        rover.last_connected = Some(Utc::now() + chrono::Duration::seconds(30));
        assert_eq!(rover.seconds_since_connected(), Some(0));
    }

    #[test]
    fn test_upsert_replaces_same_name() {
        let temp_dir = TempDir::new().unwrap();
        let mut registry = DeviceRegistry::open(temp_dir.path()).unwrap();

        let first = device("rover", "10.0.0.1", 3);
        let paired_at = first.paired_at;
        registry.upsert(first).unwrap();

        let mut second = device("rover", "10.0.0.2", 3);
        second.public_key = "MIIBCgKC".to_string();
        registry.upsert(second).unwrap();

        let paired = registry.list_paired();
        assert_eq!(paired.len(), 1);
        let stored = &paired.as_slice()[0];
        assert_eq!(stored.remote_ip, "10.0.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(stored.public_key, "MIIBCgKC");
        assert_eq!(stored.paired_at, paired_at);
    }

    #[test]
    fn test_channel_uniqueness() {
        let temp_dir = TempDir::new().unwrap();
        let mut registry = DeviceRegistry::open(temp_dir.path()).unwrap();

        registry.upsert(device("a", "10.0.0.1", 1)).unwrap();
        let result = registry.upsert(device("b", "10.0.0.2", 1));
        assert!(matches!(
            result,
            Err(ProtocolError::ChannelInUse { channel: 1, ref owner }) if owner == "a"
        ));

        registry.upsert(device("b", "10.0.0.2", 2)).unwrap();
        assert!(registry.set_channel("b", 1).is_err());
        registry.set_channel("b", 5).unwrap();
        assert_eq!(registry.channel_owner(5), Some("b"));
        assert_eq!(registry.channel_owner(2), None);
        assert!(matches!(
            registry.set_channel("ghost", 9),
            Err(ProtocolError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let mut registry = DeviceRegistry::open(temp_dir.path()).unwrap();
        registry.upsert(device("a", "10.0.0.1", 1)).unwrap();
        registry.mark_connected("a").unwrap();

        let before = registry.list_paired();
        assert!(registry.remove("missing").is_none());
        assert_eq!(registry.list_paired(), before);

        assert!(registry.remove("a").is_some());
        assert!(!registry.is_connected("a"));
        assert!(registry.list_connected().is_empty());
        assert!(registry.remove("a").is_none());
    }

    #[test]
    fn test_connected_requires_registration() {
        let temp_dir = TempDir::new().unwrap();
        let mut registry = DeviceRegistry::open(temp_dir.path()).unwrap();

        assert!(matches!(
            registry.mark_connected("stranger"),
            Err(ProtocolError::DeviceNotFound(_))
        ));

        registry.upsert(device("a", "10.0.0.1", 1)).unwrap();
        registry.upsert(device("b", "10.0.0.2", 2)).unwrap();
        assert!(registry.mark_connected("a").unwrap());
        assert!(!registry.mark_connected("a").unwrap());

        let disconnected: Vec<_> = registry.list_disconnected().iter().map(|d| d.name.clone()).collect();
        assert_eq!(disconnected, vec!["b".to_string()]);
        assert!(registry.mark_disconnected("a"));
        assert!(!registry.mark_disconnected("a"));
    }

    #[test]
    fn test_snapshots_are_copy_on_read() {
        let temp_dir = TempDir::new().unwrap();
        let mut registry = DeviceRegistry::open(temp_dir.path()).unwrap();
        registry.upsert(device("a", "10.0.0.1", 1)).unwrap();

        let snapshot = registry.list_paired();
        registry.upsert(device("b", "10.0.0.2", 2)).unwrap();
        registry.remove("a");

        assert_eq!(snapshot.len(), 1);
        // Restartable
        assert_eq!(snapshot.iter().count(), 1);
        assert_eq!(snapshot.iter().next().unwrap().name, "a");
    }

    #[test]
    fn test_flush_and_reload() {
        let temp_dir = TempDir::new().unwrap();
        {
            let mut registry = DeviceRegistry::open(temp_dir.path()).unwrap();
            registry.upsert(device("a", "10.0.0.1", 1)).unwrap();
            registry.upsert(device("b", "10.0.0.2", 2)).unwrap();
            registry
                .record_reconnect("a", Some("10.0.0.9".parse().unwrap()), Utc::now())
                .unwrap();
            assert!(registry.is_dirty());
            assert_eq!(registry.flush().unwrap(), 2);
            assert!(!registry.is_dirty());

            registry.remove("b");
            registry.flush().unwrap();
        }

        let registry = DeviceRegistry::open(temp_dir.path()).unwrap();
        assert_eq!(registry.len(), 1);
        let a = registry.get("a").unwrap();
        assert_eq!(a.remote_ip, "10.0.0.9".parse::<IpAddr>().unwrap());
        assert!(a.last_connected.is_some());
        assert!(!temp_dir.path().join(record_file_name("b")).exists());
        assert!(registry.list_connected().is_empty());
    }

    #[test]
    fn test_corrupt_record_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        {
            let mut registry = DeviceRegistry::open(temp_dir.path()).unwrap();
            registry.upsert(device("good", "10.0.0.1", 1)).unwrap();
            registry.upsert(device("bad", "10.0.0.2", 2)).unwrap();
            registry.flush().unwrap();
        }

        fs::write(temp_dir.path().join(record_file_name("bad")), b"{ not json").unwrap();
        fs::write(temp_dir.path().join("stray.json"), b"[]").unwrap();

        let registry = DeviceRegistry::open(temp_dir.path()).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("good"));
    }

    #[test]
    fn test_misnamed_record_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let record = serde_json::to_vec(&device("a", "10.0.0.1", 1)).unwrap();
        fs::write(temp_dir.path().join("copy.json"), record).unwrap();

        let registry = DeviceRegistry::open(temp_dir.path()).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_record_file_name_is_stable() {
        let name = record_file_name("Vehicle 1");
        assert_eq!(name, record_file_name("Vehicle 1"));
        assert_ne!(name, record_file_name("Vehicle 2"));
        assert!(name.ends_with(".json"));
        assert_eq!(name.len(), 64 + 5);
    }
}
