//! Transport Coordinator
//!
//! Owns the bookkeeping of device links: which links have been established
//! and which of those the transport currently reports as active. The active
//! set is mirrored into the [`DeviceRegistry`] connected list so that a name
//! is connected exactly while its link is active.
//!
//! Links are referenced by device name only. Activity notifications can race
//! teardown requests, so notifications for unknown or already inactive
//! links are ignored.

use super::link::{LinkActivity, LinkHandle, LinkTransport};
use crate::device::DeviceRegistry;
use crate::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Effect of a link activity notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkChange {
    /// Link became active; the device is now connected
    Activated,
    /// Link went inactive; the device is no longer connected
    Deactivated,
    /// Nothing changed
    Ignored,
}

/// Link bookkeeping between the pairing core and the transport
#[derive(Debug)]
pub struct TransportCoordinator {
    transport: Arc<dyn LinkTransport>,
    established: HashMap<String, LinkHandle>,
    active: HashMap<String, Option<SocketAddr>>,
}

impl TransportCoordinator {
    pub fn new(transport: Arc<dyn LinkTransport>) -> Self {
        Self {
            transport,
            established: HashMap::new(),
            active: HashMap::new(),
        }
    }

    /// Shared transport, for link establishment outside the event loop
    pub fn transport(&self) -> Arc<dyn LinkTransport> {
        Arc::clone(&self.transport)
    }

    /// Record a link that the transport finished establishing
    pub fn link_established(&mut self, handle: LinkHandle) {
        debug!(
            "Link established for {} on channel {}",
            handle.device_name, handle.channel
        );
        self.established.insert(handle.device_name.clone(), handle);
    }

    pub fn is_established(&self, device_name: &str) -> bool {
        self.established.contains_key(device_name)
    }

    pub fn is_active(&self, device_name: &str) -> bool {
        self.active.contains_key(device_name)
    }

    /// Remote endpoint last seen on an active link
    pub fn peer(&self, device_name: &str) -> Option<SocketAddr> {
        self.active.get(device_name).copied().flatten()
    }

    /// Names of established links
    pub fn established_links(&self) -> Vec<String> {
        let mut names: Vec<String> = self.established.keys().cloned().collect();
        names.sort();
        names
    }

    /// Apply an activity notification to link and registry state
    ///
    /// Activation refreshes the device address and last-connected time.
    pub fn on_link_active(&mut self, activity: &LinkActivity, registry: &mut DeviceRegistry) -> LinkChange {
        let name = activity.device_name.as_str();

        if !activity.active {
            if self.active.remove(name).is_none() {
                debug!("Ignoring inactive notification for {}", name);
                return LinkChange::Ignored;
            }
            registry.mark_disconnected(name);
            info!("Link for {} inactive", name);
            return LinkChange::Deactivated;
        }

        if !self.established.contains_key(name) {
            debug!("Ignoring activity on unknown link {}", name);
            return LinkChange::Ignored;
        }

        if let Some(peer) = activity.peer {
            self.active.insert(name.to_string(), Some(peer));
        } else {
            self.active.entry(name.to_string()).or_insert(None);
        }

        match registry.mark_connected(name) {
            Ok(true) => {
                let ip = activity.peer.map(|p| p.ip());
                if let Err(e) = registry.record_reconnect(name, ip, Utc::now()) {
                    warn!("Failed to record reconnect of {}: {}", name, e);
                }
                match self.peer(name) {
                    Some(peer) => info!("Link for {} active from {}", name, peer),
                    None => info!("Link for {} active", name),
                }
                LinkChange::Activated
            }
            Ok(false) => LinkChange::Ignored,
            Err(e) => {
                debug!("Ignoring activity for {}: {}", name, e);
                self.active.remove(name);
                LinkChange::Ignored
            }
        }
    }

    /// Tear down one device link
    ///
    /// Link state is cleared even if the transport reports an error.
    /// Returns whether the device had an active link.
    pub async fn teardown_link(&mut self, device_name: &str, registry: &mut DeviceRegistry) -> Result<bool> {
        self.established.remove(device_name);
        let was_active = self.active.remove(device_name).is_some();
        registry.mark_disconnected(device_name);

        self.transport.teardown_link(device_name).await?;
        Ok(was_active)
    }

    /// Tear down every link; returns the names that were active
    pub async fn teardown_all(&mut self, registry: &mut DeviceRegistry) -> Vec<String> {
        let mut names: Vec<String> = self
            .established
            .keys()
            .chain(self.active.keys())
            .cloned()
            .collect();
        names.sort();
        names.dedup();

        let mut was_active = Vec::new();
        for name in names {
            match self.teardown_link(&name, registry).await {
                Ok(true) => was_active.push(name),
                Ok(false) => {}
                Err(e) => warn!("Failed to tear down link for {}: {}", name, e),
            }
        }
        was_active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SealedSecret;
    use crate::device::Device;
    use crate::transport::LinkTarget;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Debug, Default)]
    struct RecordingTransport {
        torn_down: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LinkTransport for RecordingTransport {
        async fn establish_link(&self, target: &LinkTarget) -> Result<LinkHandle> {
            Ok(LinkHandle {
                device_name: target.device_name.clone(),
                channel: target.channel,
                local_addr: None,
            })
        }

        async fn teardown_link(&self, device_name: &str) -> Result<()> {
            self.torn_down.lock().unwrap().push(device_name.to_string());
            Ok(())
        }
    }

    fn setup() -> (TempDir, DeviceRegistry, TransportCoordinator, Arc<RecordingTransport>) {
        let temp_dir = TempDir::new().unwrap();
        let mut registry = DeviceRegistry::open(temp_dir.path()).unwrap();
        registry
            .upsert(Device::new(
                "rover",
                "MIIB",
                "10.0.0.1".parse().unwrap(),
                1,
                SealedSecret {
                    nonce: String::new(),
                    data: String::new(),
                },
            ))
            .unwrap();

        let transport = Arc::new(RecordingTransport::default());
        let coordinator = TransportCoordinator::new(transport.clone());
        (temp_dir, registry, coordinator, transport)
    }

    fn handle(name: &str) -> LinkHandle {
        LinkHandle {
            device_name: name.to_string(),
            channel: 1,
            local_addr: None,
        }
    }

    #[tokio::test]
    async fn test_activity_updates_registry() {
        let (_dir, mut registry, mut coordinator, _) = setup();
        coordinator.link_established(handle("rover"));

        let peer: SocketAddr = "10.0.0.42:14551".parse().unwrap();
        let change = coordinator.on_link_active(&LinkActivity::active("rover", Some(peer)), &mut registry);
        assert_eq!(change, LinkChange::Activated);
        assert!(registry.is_connected("rover"));
        assert_eq!(coordinator.peer("rover"), Some(peer));

        let device = registry.get("rover").unwrap();
        assert_eq!(device.remote_ip, peer.ip());
        assert!(device.last_connected.is_some());

        let change = coordinator.on_link_active(&LinkActivity::active("rover", Some(peer)), &mut registry);
        assert_eq!(change, LinkChange::Ignored);

        let change = coordinator.on_link_active(&LinkActivity::inactive("rover"), &mut registry);
        assert_eq!(change, LinkChange::Deactivated);
        assert!(!registry.is_connected("rover"));
    }

    #[tokio::test]
    async fn test_inactive_for_unknown_is_noop() {
        let (_dir, mut registry, mut coordinator, _) = setup();

        let change = coordinator.on_link_active(&LinkActivity::inactive("rover"), &mut registry);
        assert_eq!(change, LinkChange::Ignored);
        let change = coordinator.on_link_active(&LinkActivity::inactive("nobody"), &mut registry);
        assert_eq!(change, LinkChange::Ignored);
    }

    #[tokio::test]
    async fn test_activity_for_unregistered_is_ignored() {
        let (_dir, mut registry, mut coordinator, _) = setup();
        coordinator.link_established(handle("ghost"));

        let change = coordinator.on_link_active(&LinkActivity::active("ghost", None), &mut registry);
        assert_eq!(change, LinkChange::Ignored);
        assert!(!coordinator.is_active("ghost"));
        assert!(registry.list_connected().is_empty());
    }

    #[tokio::test]
    async fn test_activity_after_teardown_is_ignored() {
        let (_dir, mut registry, mut coordinator, transport) = setup();
        coordinator.link_established(handle("rover"));
        coordinator.on_link_active(&LinkActivity::active("rover", None), &mut registry);

        assert!(coordinator.teardown_link("rover", &mut registry).await.unwrap());
        assert!(!registry.is_connected("rover"));
        assert_eq!(*transport.torn_down.lock().unwrap(), vec!["rover".to_string()]);

        let change = coordinator.on_link_active(&LinkActivity::active("rover", None), &mut registry);
        assert_eq!(change, LinkChange::Ignored);
        let change = coordinator.on_link_active(&LinkActivity::inactive("rover"), &mut registry);
        assert_eq!(change, LinkChange::Ignored);
    }

    #[tokio::test]
    async fn test_teardown_all() {
        let (_dir, mut registry, mut coordinator, transport) = setup();
        coordinator.link_established(handle("rover"));
        coordinator.on_link_active(&LinkActivity::active("rover", None), &mut registry);

        let was_active = coordinator.teardown_all(&mut registry).await;
        assert_eq!(was_active, vec!["rover".to_string()]);
        assert!(coordinator.established_links().is_empty());
        assert_eq!(transport.torn_down.lock().unwrap().len(), 1);
    }
}
