//! UDP Link Transport
//!
//! Binds one UDP socket per device on `base_port + channel`. A link counts
//! as active from the first datagram received and inactive once nothing has
//! arrived for the idle timeout.

use super::link::{LinkActivity, LinkHandle, LinkTarget, LinkTransport};
use crate::{ProtocolError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Default first port; channel N binds `DEFAULT_BASE_PORT + N`
pub const DEFAULT_BASE_PORT: u16 = 14550;

/// Default time without traffic before a link is reported inactive
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_DATAGRAM: usize = 2048;

/// UDP link transport configuration
#[derive(Debug, Clone)]
pub struct UdpLinkConfig {
    /// Local address to bind on
    pub bind_addr: IpAddr,

    /// Port of channel 0
    pub base_port: u16,

    /// Inactivity period before reporting a link inactive
    pub idle_timeout: Duration,
}

impl Default for UdpLinkConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            base_port: DEFAULT_BASE_PORT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// [`LinkTransport`] over per-channel UDP sockets
#[derive(Debug)]
pub struct UdpLinkTransport {
    config: UdpLinkConfig,
    activity_tx: mpsc::UnboundedSender<LinkActivity>,
    links: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl UdpLinkTransport {
    pub fn new(config: UdpLinkConfig, activity_tx: mpsc::UnboundedSender<LinkActivity>) -> Self {
        Self {
            config,
            activity_tx,
            links: Mutex::new(HashMap::new()),
        }
    }

    fn port_for(&self, channel: u16) -> Result<u16> {
        self.config.base_port.checked_add(channel).ok_or_else(|| {
            ProtocolError::Configuration(format!(
                "channel {} overflows base port {}",
                channel, self.config.base_port
            ))
        })
    }

    fn take_link(&self, device_name: &str) -> Option<JoinHandle<()>> {
        self.links
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(device_name)
    }

    /// Number of links currently held
    pub fn link_count(&self) -> usize {
        self.links
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

#[async_trait]
impl LinkTransport for UdpLinkTransport {
    async fn establish_link(&self, target: &LinkTarget) -> Result<LinkHandle> {
        if let Some(previous) = self.take_link(&target.device_name) {
            debug!("Replacing existing link for {}", target.device_name);
            previous.abort();
            // Wait for the socket to be dropped before rebinding its port
            let _ = previous.await;
        }

        let port = self.port_for(target.channel)?;
        let bind = SocketAddr::new(self.config.bind_addr, port);
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|e| ProtocolError::from_io_error(e, &format!("binding {}", bind)))?;
        let local_addr = socket.local_addr().ok();

        info!("Link for {} listening on {}", target, bind);

        let monitor = tokio::spawn(monitor_link(
            socket,
            target.device_name.clone(),
            self.config.idle_timeout,
            self.activity_tx.clone(),
        ));
        self.links
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(target.device_name.clone(), monitor);

        Ok(LinkHandle {
            device_name: target.device_name.clone(),
            channel: target.channel,
            local_addr,
        })
    }

    async fn teardown_link(&self, device_name: &str) -> Result<()> {
        if let Some(monitor) = self.take_link(device_name) {
            monitor.abort();
            let _ = monitor.await;
            info!("Tore down link for {}", device_name);
        }
        Ok(())
    }
}

impl Drop for UdpLinkTransport {
    fn drop(&mut self) {
        let links = self
            .links
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (_, monitor) in links.drain() {
            monitor.abort();
        }
    }
}

async fn monitor_link(
    socket: UdpSocket,
    device_name: String,
    idle_timeout: Duration,
    activity_tx: mpsc::UnboundedSender<LinkActivity>,
) {
    let mut buf = [0u8; MAX_DATAGRAM];
    let mut active = false;

    loop {
        match timeout(idle_timeout, socket.recv_from(&mut buf)).await {
            Ok(Ok((_, peer))) => {
                if !active {
                    active = true;
                    debug!("Link for {} active, peer {}", device_name, peer);
                    if activity_tx
                        .send(LinkActivity::active(device_name.clone(), Some(peer)))
                        .is_err()
                    {
                        break;
                    }
                }
            }
            Ok(Err(e)) => {
                warn!("Link for {} failed: {}", device_name, e);
                if active {
                    let _ = activity_tx.send(LinkActivity::inactive(device_name.clone()));
                }
                break;
            }
            Err(_) => {
                if active {
                    active = false;
                    debug!("Link for {} idle", device_name);
                    if activity_tx
                        .send(LinkActivity::inactive(device_name.clone()))
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    }
}
