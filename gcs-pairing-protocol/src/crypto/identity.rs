//! Local RSA identity
//!
//! The identity is an RSA-2048 keypair generated on first start and kept in
//! `identity_key.pem`. Peers learn the public half from the pairing QR code
//! or radio helper; the private half never leaves the process.
//!
//! ## Sealed envelopes
//!
//! RSA cannot carry a whole pairing document, so every message is sealed
//! hybrid-style: a fresh AES-256 key encrypts the body with AES-256-GCM and
//! is itself wrapped with RSA-OAEP for the recipient.

use super::session::{open_aes_gcm, seal_aes_gcm, SealedSecret, SessionKey, StorageKey, SESSION_KEY_LEN};
use crate::pairing::{PairingOffer, SealedEnvelope, ENVELOPE_NONCE_LEN};
use crate::{ProtocolError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private, Public};
use openssl::rsa::{Padding, Rsa};
use openssl::sign::{Signer, Verifier};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// RSA modulus size for the local identity and minimum accepted for peers
pub const RSA_KEY_BITS: u32 = 2048;

/// File name of the persisted private key
pub const IDENTITY_KEY_FILE: &str = "identity_key.pem";

const HANDSHAKE_NONCE_LEN: usize = 16;

/// Calculate a SHA256 fingerprint of DER key bytes
///
/// Returns fingerprint in format: XX:XX:XX:...:XX
pub fn fingerprint_of(der: &[u8]) -> String {
    let hash = Sha256::digest(der);
    hash.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Public key of a remote device
#[derive(Clone)]
pub struct PeerPublicKey {
    pkey: PKey<Public>,
    encoded: String,
}

impl PeerPublicKey {
    /// Parse a base64 DER SubjectPublicKeyInfo
    ///
    /// Non-RSA keys and keys under 2048 bits are refused.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let der = BASE64
            .decode(encoded.trim())
            .map_err(|_| ProtocolError::malformed("public key is not valid base64"))?;
        let pkey = PKey::public_key_from_der(&der)
            .map_err(|_| ProtocolError::malformed("public key is not a DER public key"))?;

        if pkey.rsa().is_err() {
            return Err(ProtocolError::malformed("public key is not an RSA key"));
        }
        if pkey.bits() < RSA_KEY_BITS {
            return Err(ProtocolError::malformed(format!(
                "{}-bit public key is too weak",
                pkey.bits()
            )));
        }

        Ok(Self {
            pkey,
            encoded: BASE64.encode(der),
        })
    }

    /// Base64 DER encoding
    pub fn to_base64(&self) -> &str {
        &self.encoded
    }

    pub fn fingerprint(&self) -> String {
        match BASE64.decode(&self.encoded) {
            Ok(der) => fingerprint_of(&der),
            Err(_) => String::new(),
        }
    }
}

impl fmt::Debug for PeerPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerPublicKey")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Local asymmetric identity plus the storage key derived from it
pub struct CryptoIdentity {
    pkey: PKey<Private>,
    public_key: String,
    fingerprint: String,
    storage_key: StorageKey,
    rng: SystemRandom,
}

impl CryptoIdentity {
    /// Generate a new RSA-2048 identity
    pub fn generate() -> Result<Self> {
        let rsa = Rsa::generate(RSA_KEY_BITS)?;
        let identity = Self::from_pkey(PKey::from_rsa(rsa)?)?;
        info!("Generated identity with fingerprint {}", identity.fingerprint);
        Ok(identity)
    }

    /// Load an identity from PKCS#8 (or traditional) PEM
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        Self::from_pkey(PKey::private_key_from_pem(pem)?)
    }

    fn from_pkey(pkey: PKey<Private>) -> Result<Self> {
        if pkey.rsa().is_err() {
            return Err(ProtocolError::Configuration(
                "identity key must be RSA".to_string(),
            ));
        }
        let public_der = pkey.public_key_to_der()?;
        let private_der = pkey.private_key_to_der()?;

        Ok(Self {
            public_key: BASE64.encode(&public_der),
            fingerprint: fingerprint_of(&public_der),
            storage_key: StorageKey::derive(&private_der)?,
            pkey,
            rng: SystemRandom::new(),
        })
    }

    /// Load `identity_key.pem` from `dir`, generating and saving it if absent
    pub fn load_or_generate(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let key_path = dir.join(IDENTITY_KEY_FILE);

        if key_path.exists() {
            debug!("Loading identity from {:?}", key_path);
            let pem = fs::read(&key_path).map_err(|e| {
                ProtocolError::from_io_error(e, &format!("reading {}", key_path.display()))
            })?;
            let identity = Self::from_pem(&pem)?;
            info!("Loaded identity with fingerprint {}", identity.fingerprint);
            return Ok(identity);
        }

        let identity = Self::generate()?;
        identity.save(&key_path)?;
        Ok(identity)
    }

    /// Write the private key as PKCS#8 PEM, readable only by the owner
    pub fn save(&self, key_path: impl AsRef<Path>) -> Result<()> {
        let key_path = key_path.as_ref();
        if let Some(parent) = key_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let pem = self.pkey.private_key_to_pem_pkcs8()?;
        write_private(key_path, &pem)
            .map_err(|e| ProtocolError::from_io_error(e, &format!("writing {}", key_path.display())))?;

        info!("Saved identity key to {:?}", key_path);
        Ok(())
    }

    /// Base64 DER of the local public key, as shared with peers
    pub fn public_key_base64(&self) -> &str {
        &self.public_key
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Open a sealed pairing envelope and parse the offer inside
    ///
    /// A ciphertext that does not open under the local key is reported as
    /// `DecryptFailure`; a plaintext that is not a valid offer as
    /// `MalformedPayload`.
    pub fn decrypt_pairing_envelope(&self, envelope: &SealedEnvelope) -> Result<PairingOffer> {
        let plaintext = self.open(envelope)?;
        PairingOffer::parse(&plaintext)
    }

    /// Open an envelope sealed for the local identity
    pub fn open(&self, envelope: &SealedEnvelope) -> Result<Vec<u8>> {
        let rsa = self.pkey.rsa()?;
        if envelope.wrapped_key().len() != rsa.size() as usize {
            return Err(ProtocolError::DecryptFailure);
        }

        let mut key_buf = vec![0u8; rsa.size() as usize];
        let key_len = rsa
            .private_decrypt(envelope.wrapped_key(), &mut key_buf, Padding::PKCS1_OAEP)
            .map_err(|_| ProtocolError::DecryptFailure)?;
        let content_key: [u8; SESSION_KEY_LEN] = key_buf[..key_len]
            .try_into()
            .map_err(|_| ProtocolError::DecryptFailure)?;

        open_aes_gcm(&content_key, *envelope.nonce(), &[], envelope.data().to_vec())
    }

    /// Seal `plaintext` for a peer
    ///
    /// Always wraps a fresh content key under the peer's public key.
    pub fn encrypt_for_peer(&self, peer: &PeerPublicKey, plaintext: &[u8]) -> Result<SealedEnvelope> {
        let mut content_key = [0u8; SESSION_KEY_LEN];
        self.rng
            .fill(&mut content_key)
            .map_err(ProtocolError::crypto_operation)?;
        let mut nonce = [0u8; ENVELOPE_NONCE_LEN];
        self.rng
            .fill(&mut nonce)
            .map_err(ProtocolError::crypto_operation)?;

        let data = seal_aes_gcm(&content_key, nonce, &[], plaintext)?;

        let rsa = peer.pkey.rsa()?;
        let mut wrapped = vec![0u8; rsa.size() as usize];
        let wrapped_len = rsa.public_encrypt(&content_key, &mut wrapped, Padding::PKCS1_OAEP)?;
        wrapped.truncate(wrapped_len);

        Ok(SealedEnvelope::new(wrapped, nonce, data))
    }

    /// Fresh random session key for a newly paired device
    pub fn derive_session_key(&self) -> Result<SessionKey> {
        SessionKey::generate(&self.rng)
    }

    /// Random hex nonce for a connect request
    pub fn handshake_nonce(&self) -> Result<String> {
        let mut nonce = [0u8; HANDSHAKE_NONCE_LEN];
        self.rng
            .fill(&mut nonce)
            .map_err(ProtocolError::crypto_operation)?;
        Ok(hex::encode(nonce))
    }

    /// RSA PKCS#1 v1.5 SHA-256 signature over `payload`
    pub fn sign(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut signer = Signer::new(MessageDigest::sha256(), &self.pkey)?;
        signer.update(payload)?;
        Ok(signer.sign_to_vec()?)
    }

    /// Verify a peer signature; any failure counts as invalid
    pub fn verify(payload: &[u8], signature: &[u8], peer: &PeerPublicKey) -> bool {
        let verified = Verifier::new(MessageDigest::sha256(), &peer.pkey).and_then(|mut verifier| {
            verifier.update(payload)?;
            verifier.verify(signature)
        });

        match verified {
            Ok(valid) => valid,
            Err(e) => {
                warn!("Signature verification error: {}", e);
                false
            }
        }
    }

    /// Seal a session key for the cache file of `device_name`
    pub fn seal_session_key(&self, device_name: &str, key: &SessionKey) -> Result<SealedSecret> {
        self.storage_key.seal(&self.rng, device_name, key.as_bytes())
    }

    /// Recover a session key sealed by [`CryptoIdentity::seal_session_key`]
    pub fn open_session_key(&self, device_name: &str, sealed: &SealedSecret) -> Result<SessionKey> {
        let bytes = self.storage_key.open(device_name, sealed)?;
        SessionKey::from_bytes(&bytes)
    }

    /// Public half as a [`PeerPublicKey`], e.g. for loopback tests
    pub fn public_key(&self) -> Result<PeerPublicKey> {
        PeerPublicKey::from_base64(&self.public_key)
    }
}

impl fmt::Debug for CryptoIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoIdentity")
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    fs::write(path, contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use tempfile::TempDir;

    fn offer_for(peer: &CryptoIdentity) -> PairingOffer {
        PairingOffer::new(
            "Vehicle 3",
            peer.public_key_base64(),
            "192.168.4.2".parse::<IpAddr>().unwrap(),
            3,
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_envelope_roundtrip() {
        let local = CryptoIdentity::generate().unwrap();
        let device = CryptoIdentity::generate().unwrap();
        let offer = offer_for(&device);

        let sealed = device
            .encrypt_for_peer(&local.public_key().unwrap(), offer.serialize().unwrap().as_bytes())
            .unwrap();
        let wire = sealed.to_json().unwrap();

        let parsed = SealedEnvelope::parse(&wire).unwrap();
        assert_eq!(local.decrypt_pairing_envelope(&parsed).unwrap(), offer);
    }

    #[test]
    fn test_wrong_key_is_decrypt_failure() {
        let local = CryptoIdentity::generate().unwrap();
        let stranger = CryptoIdentity::generate().unwrap();
        let device = CryptoIdentity::generate().unwrap();
        let offer = offer_for(&device);

        let sealed = device
            .encrypt_for_peer(
                &stranger.public_key().unwrap(),
                offer.serialize().unwrap().as_bytes(),
            )
            .unwrap();

        assert!(matches!(
            local.decrypt_pairing_envelope(&sealed),
            Err(ProtocolError::DecryptFailure)
        ));
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let local = CryptoIdentity::generate().unwrap();
        let sealed = local
            .encrypt_for_peer(&local.public_key().unwrap(), b"{\"hello\":1}")
            .unwrap();

        let mut data = sealed.data().to_vec();
        data[0] ^= 0x01;
        let tampered = SealedEnvelope::new(sealed.wrapped_key().to_vec(), *sealed.nonce(), data);

        assert!(matches!(
            local.open(&tampered),
            Err(ProtocolError::DecryptFailure)
        ));
    }

    #[test]
    fn test_sign_and_verify() {
        let device = CryptoIdentity::generate().unwrap();
        let other = CryptoIdentity::generate().unwrap();
        let signature = device.sign(b"payload").unwrap();

        let device_key = device.public_key().unwrap();
        assert!(CryptoIdentity::verify(b"payload", &signature, &device_key));
        assert!(!CryptoIdentity::verify(b"payl0ad", &signature, &device_key));
        assert!(!CryptoIdentity::verify(
            b"payload",
            &signature,
            &other.public_key().unwrap()
        ));
        assert!(!CryptoIdentity::verify(b"payload", b"garbage", &device_key));
    }

    #[test]
    fn test_weak_peer_key_rejected() {
        let rsa = Rsa::generate(1024).unwrap();
        let der = PKey::from_rsa(rsa).unwrap().public_key_to_der().unwrap();
        let result = PeerPublicKey::from_base64(&BASE64.encode(der));
        assert!(matches!(result, Err(ProtocolError::MalformedPayload(_))));
    }

    #[test]
    fn test_load_or_generate_persists() {
        let temp_dir = TempDir::new().unwrap();

        let first = CryptoIdentity::load_or_generate(temp_dir.path()).unwrap();
        let second = CryptoIdentity::load_or_generate(temp_dir.path()).unwrap();
        assert_eq!(first.fingerprint(), second.fingerprint());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(temp_dir.path().join(IDENTITY_KEY_FILE))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        // Session keys sealed by one load open under the next
        let key = first.derive_session_key().unwrap();
        let sealed = first.seal_session_key("vehicle", &key).unwrap();
        assert_eq!(second.open_session_key("vehicle", &sealed).unwrap(), key);
    }

    #[test]
    fn test_fingerprint_format() {
        let identity = CryptoIdentity::generate().unwrap();
        let fingerprint = identity.fingerprint();
        assert_eq!(fingerprint.len(), 32 * 3 - 1);
        assert!(fingerprint
            .split(':')
            .all(|b| b.len() == 2 && b.chars().all(|c| c.is_ascii_hexdigit())));
    }
}
