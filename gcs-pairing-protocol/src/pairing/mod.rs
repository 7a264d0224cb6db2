//! Device Pairing
//!
//! ## Handshake
//!
//! 1. **Start**: the operator starts pairing; status becomes `Active`
//! 2. **Offer**: a discovery source delivers a sealed [`PairingOffer`]
//! 3. **Accept**: the offer is opened with the local key and validated
//! 4. **Connect request**: channel, local public key and a fresh session key
//!    are sealed for the device and posted to its pair URL
//! 5. **Completion**: the device answers with a signed [`CompletionResponse`];
//!    only a verified `accepted` response reaches `Connected`
//!
//! Only one handshake runs at a time. Already paired devices reconnect
//! independently of it.

pub mod codec;
pub mod events;
pub mod handler;

pub use codec::{
    CompletionResponse, CompletionStatus, ConnectRequest, PairingOffer, SealedEnvelope,
    DEFAULT_PAIR_PATH, ENVELOPE_NONCE_LEN, MAX_CHANNEL, MIN_CHANNEL,
};
pub use events::PairingEvent;
pub use handler::{PairingStateMachine, PairingStatus, PendingPairing, PAIRING_TIMEOUT, STATUS_HOLD};
