//! Pairing Event System
//!
//! Discrete notifications broadcast by the pairing manager. Presentation
//! layers subscribe to these instead of holding references into core state.

use crate::pairing::PairingStatus;

/// Events emitted by the pairing manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEvent {
    /// Handshake status changed
    StatusChanged {
        /// Status before the change
        previous: PairingStatus,
        /// New status
        status: PairingStatus,
    },

    /// A pairing offer was decrypted and accepted
    OfferReceived {
        /// Name the device announced
        device_name: String,
        /// Fingerprint of the device public key
        fingerprint: String,
    },

    /// A pairing offer was refused
    OfferRejected {
        /// Why the offer was refused
        reason: String,
    },

    /// Handshake completed and the device was stored
    DevicePaired {
        /// Name of the paired device
        device_name: String,
        /// Channel assigned to it
        channel: u16,
    },

    /// A device link became active
    DeviceConnected {
        /// Name of the device
        device_name: String,
    },

    /// A device link became inactive or was torn down
    DeviceDisconnected {
        /// Name of the device
        device_name: String,
    },

    /// A device was unpaired
    DeviceRemoved {
        /// Name of the removed device
        device_name: String,
    },

    /// A paired device moved to another channel
    ChannelChanged {
        /// Name of the device
        device_name: String,
        /// New channel
        channel: u16,
    },

    /// A reconnect attempt failed; it will be retried on a later sweep
    ReconnectFailed {
        /// Name of the device
        device_name: String,
        /// Consecutive failures so far
        failures: u32,
    },

    /// An error occurred
    Error {
        /// Device concerned, if any
        device_name: Option<String>,
        /// Error message
        message: String,
    },
}

impl PairingEvent {
    /// Device this event concerns, if any
    pub fn device_name(&self) -> Option<&str> {
        match self {
            PairingEvent::OfferReceived { device_name, .. }
            | PairingEvent::DevicePaired { device_name, .. }
            | PairingEvent::DeviceConnected { device_name }
            | PairingEvent::DeviceDisconnected { device_name }
            | PairingEvent::DeviceRemoved { device_name }
            | PairingEvent::ChannelChanged { device_name, .. }
            | PairingEvent::ReconnectFailed { device_name, .. } => Some(device_name),
            PairingEvent::Error { device_name, .. } => device_name.as_deref(),
            PairingEvent::StatusChanged { .. } | PairingEvent::OfferRejected { .. } => None,
        }
    }

    /// Check if this is a status change event
    pub fn is_status_change(&self) -> bool {
        matches!(self, PairingEvent::StatusChanged { .. })
    }

    /// Check if this is an error event
    pub fn is_error(&self) -> bool {
        matches!(self, PairingEvent::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_name() {
        let event = PairingEvent::DevicePaired {
            device_name: "rover".to_string(),
            channel: 2,
        };
        assert_eq!(event.device_name(), Some("rover"));

        let event = PairingEvent::StatusChanged {
            previous: PairingStatus::Idle,
            status: PairingStatus::Active,
        };
        assert_eq!(event.device_name(), None);
        assert!(event.is_status_change());
    }

    #[test]
    fn test_is_error() {
        let event = PairingEvent::Error {
            device_name: None,
            message: "boom".to_string(),
        };
        assert!(event.is_error());
        assert!(!event.is_status_change());
    }
}
