//! Link Transport Abstraction
//!
//! The pairing core never opens sockets itself. It asks a [`LinkTransport`]
//! to bring a device link up or down and learns about link activity through
//! [`LinkActivity`] notifications.

use crate::device::Device;
use crate::Result;
use async_trait::async_trait;
use std::fmt;
use std::fmt::Debug;
use std::net::{IpAddr, SocketAddr};

/// What the transport needs to bring a device link up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTarget {
    /// Device name; links are addressed by name only
    pub device_name: String,

    /// Logical channel of the link
    pub channel: u16,

    /// Last known address of the device
    pub remote_ip: IpAddr,
}

impl From<&Device> for LinkTarget {
    fn from(device: &Device) -> Self {
        Self {
            device_name: device.name.clone(),
            channel: device.channel,
            remote_ip: device.remote_ip,
        }
    }
}

impl fmt::Display for LinkTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (channel {}, {})", self.device_name, self.channel, self.remote_ip)
    }
}

/// An established (not necessarily active) link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkHandle {
    /// Device the link belongs to
    pub device_name: String,

    /// Channel the link was established on
    pub channel: u16,

    /// Local endpoint, when the transport has one
    pub local_addr: Option<SocketAddr>,
}

/// Asynchronous link state notification from the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkActivity {
    /// Device the notification is about
    pub device_name: String,

    /// Whether the link is now carrying traffic
    pub active: bool,

    /// Remote endpoint seen on the link, if known
    pub peer: Option<SocketAddr>,
}

impl LinkActivity {
    pub fn active(device_name: impl Into<String>, peer: Option<SocketAddr>) -> Self {
        Self {
            device_name: device_name.into(),
            active: true,
            peer,
        }
    }

    pub fn inactive(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            active: false,
            peer: None,
        }
    }
}

/// Transport collaborator that creates and destroys device links
#[async_trait]
pub trait LinkTransport: Send + Sync + Debug {
    /// Bring up the link for a device
    ///
    /// # Errors
    ///
    /// Returns an error if the link cannot be created. The caller treats
    /// this as a per-device failure.
    async fn establish_link(&self, target: &LinkTarget) -> Result<LinkHandle>;

    /// Tear down the link for a device
    ///
    /// Tearing down a link that does not exist is not an error.
    async fn teardown_link(&self, device_name: &str) -> Result<()>;
}
