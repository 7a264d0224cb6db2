//! Cryptographic identity and key material
//!
//! - [`CryptoIdentity`]: local RSA keypair, envelope sealing, signatures
//! - [`PeerPublicKey`]: validated remote RSA public key
//! - [`SessionKey`]: per-device symmetric key
//! - [`StorageKey`] / [`SealedSecret`]: session keys at rest
//!
//! Key material is never logged; every type holding secrets redacts its
//! `Debug` output.

mod identity;
mod session;

pub use identity::{fingerprint_of, CryptoIdentity, PeerPublicKey, IDENTITY_KEY_FILE, RSA_KEY_BITS};
pub use session::{SealedSecret, SessionKey, StorageKey, SESSION_KEY_LEN};
