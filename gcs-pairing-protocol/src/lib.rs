//! Ground Station Device Pairing
//!
//! Secure pairing between a ground station and field devices, and
//! supervision of the data links to paired devices.
//!
//! A device announces itself with a sealed offer. The ground station opens
//! it with its RSA identity, answers with a signed connect request carrying
//! a fresh session key, and accepts the device only after a signed
//! completion response verifies. Paired devices are persisted and their
//! links are re-established automatically.

pub mod crypto;
pub mod device;
pub mod discovery;
pub mod fs_utils;
pub mod manager;
pub mod pairing;
pub mod recovery;
pub mod transport;
pub mod upload;

mod error;
pub use crypto::{CryptoIdentity, PeerPublicKey, SessionKey};
pub use device::{Device, DeviceRegistry, Snapshot};
pub use discovery::{forward_offers, DiscoveredOffer, LineOfferSource, OfferSource};
pub use error::{ProtocolError, Result};
pub use manager::{ManagerConfig, PairingHandle, PairingManager, StatusSnapshot};
pub use pairing::{PairingEvent, PairingStatus};
pub use recovery::{ReconnectPolicy, ReconnectSupervisor};
pub use transport::{LinkTransport, UdpLinkConfig, UdpLinkTransport};
pub use upload::{HttpUploader, RetryPolicy, Uploader};

/// Version of the pairing document format
pub const PROTOCOL_VERSION: u32 = pairing::codec::ENVELOPE_VERSION as u32;
