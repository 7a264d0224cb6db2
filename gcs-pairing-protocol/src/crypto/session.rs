//! Symmetric key material
//!
//! Session keys are generated once per successful pairing. At rest they are
//! sealed with AES-256-GCM under a storage key derived from the local
//! identity, so a copied cache directory is useless without the identity.

use crate::{ProtocolError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::hkdf;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Session key length in bytes (AES-256)
pub const SESSION_KEY_LEN: usize = 32;

const STORAGE_SALT: &[u8] = b"gcs-pairing storage v1";
const STORAGE_INFO: &[u8] = b"session-key-at-rest";

/// Per-device symmetric key negotiated during pairing
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    /// Generate a fresh random key
    pub fn generate(rng: &SystemRandom) -> Result<Self> {
        let mut key = [0u8; SESSION_KEY_LEN];
        rng.fill(&mut key).map_err(ProtocolError::crypto_operation)?;
        Ok(Self(key))
    }

    /// Wrap existing key bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let key: [u8; SESSION_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| ProtocolError::malformed("session key must be 32 bytes"))?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}

/// Secret sealed at rest, as stored in a device cache file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedSecret {
    /// Base64 AES-GCM nonce
    pub nonce: String,
    /// Base64 ciphertext with appended tag
    pub data: String,
}

/// Local key used to seal session keys at rest
pub struct StorageKey([u8; SESSION_KEY_LEN]);

impl StorageKey {
    /// Derive the storage key from the identity's private key bytes
    pub fn derive(private_key_der: &[u8]) -> Result<Self> {
        let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, STORAGE_SALT);
        let prk = salt.extract(private_key_der);
        let info = [STORAGE_INFO];
        let okm = prk
            .expand(&info, hkdf::HKDF_SHA256)
            .map_err(ProtocolError::crypto_operation)?;

        let mut key = [0u8; SESSION_KEY_LEN];
        okm.fill(&mut key).map_err(ProtocolError::crypto_operation)?;
        Ok(Self(key))
    }

    /// Seal `plaintext`, binding it to `context` (the device name)
    pub fn seal(&self, rng: &SystemRandom, context: &str, plaintext: &[u8]) -> Result<SealedSecret> {
        let mut nonce = [0u8; NONCE_LEN];
        rng.fill(&mut nonce).map_err(ProtocolError::crypto_operation)?;
        let data = seal_aes_gcm(&self.0, nonce, context.as_bytes(), plaintext)?;

        Ok(SealedSecret {
            nonce: BASE64.encode(nonce),
            data: BASE64.encode(data),
        })
    }

    /// Open a sealed secret; fails with `DecryptFailure` if it was sealed
    /// under another identity or for another device name
    pub fn open(&self, context: &str, sealed: &SealedSecret) -> Result<Vec<u8>> {
        let nonce: [u8; NONCE_LEN] = BASE64
            .decode(&sealed.nonce)
            .ok()
            .and_then(|n| n.as_slice().try_into().ok())
            .ok_or(ProtocolError::DecryptFailure)?;
        let data = BASE64
            .decode(&sealed.data)
            .map_err(|_| ProtocolError::DecryptFailure)?;

        open_aes_gcm(&self.0, nonce, context.as_bytes(), data)
    }
}

impl fmt::Debug for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StorageKey(<redacted>)")
    }
}

/// AES-256-GCM encrypt, returning ciphertext with the tag appended
pub(crate) fn seal_aes_gcm(
    key: &[u8; SESSION_KEY_LEN],
    nonce: [u8; NONCE_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let key = LessSafeKey::new(
        UnboundKey::new(&AES_256_GCM, key).map_err(ProtocolError::crypto_operation)?,
    );
    let mut in_out = plaintext.to_vec();
    key.seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::from(aad), &mut in_out)
        .map_err(ProtocolError::crypto_operation)?;
    Ok(in_out)
}

/// AES-256-GCM decrypt; any failure is reported as `DecryptFailure`
pub(crate) fn open_aes_gcm(
    key: &[u8; SESSION_KEY_LEN],
    nonce: [u8; NONCE_LEN],
    aad: &[u8],
    mut ciphertext: Vec<u8>,
) -> Result<Vec<u8>> {
    let key = LessSafeKey::new(
        UnboundKey::new(&AES_256_GCM, key).map_err(|_| ProtocolError::DecryptFailure)?,
    );
    let plain_len = key
        .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::from(aad), &mut ciphertext)
        .map_err(|_| ProtocolError::DecryptFailure)?
        .len();
    ciphertext.truncate(plain_len);
    Ok(ciphertext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_keys_are_unique() {
        let rng = SystemRandom::new();
        let a = SessionKey::generate(&rng).unwrap();
        let b = SessionKey::generate(&rng).unwrap();
        assert_ne!(a, b);
        assert_eq!(format!("{:?}", a), "SessionKey(<redacted>)");
    }

    #[test]
    fn test_storage_key_binds_context() {
        let rng = SystemRandom::new();
        let storage = StorageKey::derive(b"private key bytes").unwrap();

        let sealed = storage.seal(&rng, "vehicle-1", &[7u8; 32]).unwrap();
        assert_eq!(storage.open("vehicle-1", &sealed).unwrap(), vec![7u8; 32]);
        assert!(matches!(
            storage.open("vehicle-2", &sealed),
            Err(ProtocolError::DecryptFailure)
        ));

        let other = StorageKey::derive(b"another private key").unwrap();
        assert!(other.open("vehicle-1", &sealed).is_err());
    }

    #[test]
    fn test_session_key_length_checked() {
        assert!(SessionKey::from_bytes(&[0u8; 16]).is_err());
        assert!(SessionKey::from_bytes(&[0u8; 32]).is_ok());
    }
}
