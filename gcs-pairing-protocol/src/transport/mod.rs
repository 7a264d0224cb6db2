//! Device Link Transport
//!
//! - [`LinkTransport`]: collaborator that creates and destroys links
//! - [`UdpLinkTransport`]: per-channel UDP sockets
//! - [`TransportCoordinator`]: link bookkeeping and activity handling

pub mod coordinator;
pub mod link;
pub mod udp;

pub use coordinator::{LinkChange, TransportCoordinator};
pub use link::{LinkActivity, LinkHandle, LinkTarget, LinkTransport};
pub use udp::{UdpLinkConfig, UdpLinkTransport, DEFAULT_BASE_PORT, DEFAULT_IDLE_TIMEOUT};
