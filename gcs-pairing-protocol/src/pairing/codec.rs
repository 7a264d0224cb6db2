//! Pairing Wire Codec
//!
//! JSON documents exchanged during a handshake, and the validation applied
//! to them before any trust decision is made.
//!
//! ## Documents
//!
//! - [`SealedEnvelope`]: outer ciphertext wrapper, `{"v","key","nonce","data"}`
//! - [`PairingOffer`]: what a field device sends to request pairing
//! - [`ConnectRequest`]: our answer, carrying channel and session key
//! - [`CompletionResponse`]: the device's signed accept/reject
//!
//! The codec performs no I/O and no cryptography. Every parsed value is
//! immutable; constructors run the same validation as the parsers.

use crate::{ProtocolError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Lowest valid link channel
pub const MIN_CHANNEL: u16 = 1;

/// Highest valid link channel
pub const MAX_CHANNEL: u16 = 255;

/// Maximum device name length in characters
pub const MAX_NAME_LEN: usize = 64;

/// Maximum raw input accepted by any parser
pub const MAX_INPUT_LEN: usize = 128 * 1024;

/// Fallback path of the device pairing endpoint
pub const DEFAULT_PAIR_PATH: &str = "/pair";

/// Sealed envelope format version
pub const ENVELOPE_VERSION: u8 = 1;

/// AES-GCM nonce length
pub const ENVELOPE_NONCE_LEN: usize = 12;

const MIN_WRAPPED_KEY_LEN: usize = 128;
const MAX_WRAPPED_KEY_LEN: usize = 1024;
const MIN_DATA_LEN: usize = 16;
const MAX_DATA_LEN: usize = 64 * 1024;
const MIN_PUBLIC_KEY_LEN: usize = 64;
const MAX_PUBLIC_KEY_LEN: usize = 2048;
const MAX_NONCE_LEN: usize = 128;

/// Hybrid-encrypted document: an RSA-wrapped AES key plus AES-GCM ciphertext
#[derive(Clone, PartialEq, Eq)]
pub struct SealedEnvelope {
    wrapped_key: Vec<u8>,
    nonce: [u8; ENVELOPE_NONCE_LEN],
    data: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct EnvelopeWire {
    v: u8,
    key: String,
    nonce: String,
    data: String,
}

impl SealedEnvelope {
    /// Assemble an envelope from its parts
    pub fn new(wrapped_key: Vec<u8>, nonce: [u8; ENVELOPE_NONCE_LEN], data: Vec<u8>) -> Self {
        Self {
            wrapped_key,
            nonce,
            data,
        }
    }

    /// Parse and structurally validate an envelope
    ///
    /// Checks sizes and encodings only; whether the ciphertext is genuine is
    /// decided later by the crypto layer.
    pub fn parse(raw: &str) -> Result<Self> {
        check_input_len(raw.len())?;

        let wire: EnvelopeWire = serde_json::from_str(raw.trim())
            .map_err(|e| ProtocolError::malformed(format!("envelope: {}", e)))?;

        if wire.v != ENVELOPE_VERSION {
            return Err(ProtocolError::malformed(format!(
                "unsupported envelope version {}",
                wire.v
            )));
        }

        let wrapped_key = decode_b64("key", &wire.key)?;
        if !(MIN_WRAPPED_KEY_LEN..=MAX_WRAPPED_KEY_LEN).contains(&wrapped_key.len()) {
            return Err(ProtocolError::malformed(format!(
                "wrapped key length {} out of range",
                wrapped_key.len()
            )));
        }

        let nonce_bytes = decode_b64("nonce", &wire.nonce)?;
        let nonce: [u8; ENVELOPE_NONCE_LEN] = nonce_bytes
            .as_slice()
            .try_into()
            .map_err(|_| ProtocolError::malformed("nonce must be 12 bytes"))?;

        let data = decode_b64("data", &wire.data)?;
        if !(MIN_DATA_LEN..=MAX_DATA_LEN).contains(&data.len()) {
            return Err(ProtocolError::malformed(format!(
                "ciphertext length {} out of range",
                data.len()
            )));
        }

        Ok(Self {
            wrapped_key,
            nonce,
            data,
        })
    }

    /// Serialize to the JSON wire form
    pub fn to_json(&self) -> Result<String> {
        let wire = EnvelopeWire {
            v: ENVELOPE_VERSION,
            key: BASE64.encode(&self.wrapped_key),
            nonce: BASE64.encode(self.nonce),
            data: BASE64.encode(&self.data),
        };
        Ok(serde_json::to_string(&wire)?)
    }

    pub fn wrapped_key(&self) -> &[u8] {
        &self.wrapped_key
    }

    pub fn nonce(&self) -> &[u8; ENVELOPE_NONCE_LEN] {
        &self.nonce
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for SealedEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealedEnvelope")
            .field("wrapped_key_len", &self.wrapped_key.len())
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// Pairing offer sent by a field device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingOffer {
    device_name: String,
    public_key: String,
    remote_ip: IpAddr,
    channel: u16,
    pair_url: Option<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OfferWire {
    device_name: String,
    public_key: String,
    remote_ip: String,
    channel: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pair_url: Option<String>,
}

impl PairingOffer {
    /// Create a validated offer
    pub fn new(
        device_name: impl Into<String>,
        public_key: impl Into<String>,
        remote_ip: IpAddr,
        channel: u16,
        pair_url: Option<String>,
    ) -> Result<Self> {
        let device_name = device_name.into();
        let public_key = public_key.into();

        validate_device_name(&device_name)?;
        validate_public_key(&public_key)?;
        let channel = validate_channel(i64::from(channel))?;
        if let Some(url) = &pair_url {
            validate_url(url)?;
        }

        Ok(Self {
            device_name,
            public_key,
            remote_ip,
            channel,
            pair_url,
        })
    }

    /// Parse a decrypted offer document
    pub fn parse(raw: &[u8]) -> Result<Self> {
        check_input_len(raw.len())?;

        let wire: OfferWire = serde_json::from_slice(raw)
            .map_err(|e| ProtocolError::malformed(format!("pairing offer: {}", e)))?;

        let remote_ip: IpAddr = wire
            .remote_ip
            .trim()
            .parse()
            .map_err(|_| ProtocolError::malformed(format!("invalid remoteIp '{}'", wire.remote_ip)))?;

        validate_device_name(&wire.device_name)?;
        validate_public_key(&wire.public_key)?;
        let channel = validate_channel(wire.channel)?;
        if let Some(url) = &wire.pair_url {
            validate_url(url)?;
        }

        Ok(Self {
            device_name: wire.device_name,
            public_key: wire.public_key,
            remote_ip,
            channel,
            pair_url: wire.pair_url,
        })
    }

    /// Serialize to the JSON wire form
    pub fn serialize(&self) -> Result<String> {
        let wire = OfferWire {
            device_name: self.device_name.clone(),
            public_key: self.public_key.clone(),
            remote_ip: self.remote_ip.to_string(),
            channel: i64::from(self.channel),
            pair_url: self.pair_url.clone(),
        };
        Ok(serde_json::to_string(&wire)?)
    }

    /// Copy of this offer on a different channel
    ///
    /// Used when the discovery source dictates the channel.
    pub fn with_channel(&self, channel: u16) -> Result<Self> {
        let channel = validate_channel(i64::from(channel))?;
        Ok(Self {
            channel,
            ..self.clone()
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Base64 DER public key of the device
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn remote_ip(&self) -> IpAddr {
        self.remote_ip
    }

    pub fn channel(&self) -> u16 {
        self.channel
    }

    /// URL the connect request is posted to
    ///
    /// Falls back to `http://<remoteIp>/pair` when the device did not
    /// supply one.
    pub fn upload_url(&self) -> String {
        self.upload_url_with_path(DEFAULT_PAIR_PATH)
    }

    /// Like [`PairingOffer::upload_url`] with a custom fallback path
    pub fn upload_url_with_path(&self, path: &str) -> String {
        if let Some(url) = &self.pair_url {
            return url.clone();
        }
        let path = path.trim_start_matches('/');
        match self.remote_ip {
            IpAddr::V4(ip) => format!("http://{}/{}", ip, path),
            IpAddr::V6(ip) => format!("http://[{}]/{}", ip, path),
        }
    }
}

/// Connection configuration pushed to a device after accepting its offer
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    gcs_name: String,
    channel: u16,
    public_key: String,
    session_key: String,
    nonce: String,
    signature: String,
}

impl ConnectRequest {
    /// Create a connect request
    ///
    /// `signature` must cover [`ConnectRequest::signing_payload`] of the same
    /// name, channel and nonce.
    pub fn new(
        gcs_name: impl Into<String>,
        channel: u16,
        public_key: impl Into<String>,
        session_key: &[u8],
        nonce: impl Into<String>,
        signature: &[u8],
    ) -> Result<Self> {
        let request = Self {
            gcs_name: gcs_name.into(),
            channel,
            public_key: public_key.into(),
            session_key: BASE64.encode(session_key),
            nonce: nonce.into(),
            signature: BASE64.encode(signature),
        };
        request.validate()?;
        Ok(request)
    }

    /// Bytes covered by the request signature
    pub fn signing_payload(gcs_name: &str, channel: u16, nonce: &str) -> Vec<u8> {
        format!("{}\n{}\n{}", gcs_name, channel, nonce).into_bytes()
    }

    /// Parse a decrypted connect request
    pub fn parse(raw: &[u8]) -> Result<Self> {
        check_input_len(raw.len())?;
        let request: Self = serde_json::from_slice(raw)
            .map_err(|e| ProtocolError::malformed(format!("connect request: {}", e)))?;
        request.validate()?;
        Ok(request)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn validate(&self) -> Result<()> {
        validate_device_name(&self.gcs_name)?;
        validate_channel(i64::from(self.channel))?;
        validate_public_key(&self.public_key)?;
        validate_nonce(&self.nonce)?;
        decode_b64("sessionKey", &self.session_key)?;
        decode_b64("signature", &self.signature)?;
        Ok(())
    }

    pub fn gcs_name(&self) -> &str {
        &self.gcs_name
    }

    pub fn channel(&self) -> u16 {
        self.channel
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    pub fn session_key(&self) -> Result<Vec<u8>> {
        decode_b64("sessionKey", &self.session_key)
    }

    pub fn signature(&self) -> Result<Vec<u8>> {
        decode_b64("signature", &self.signature)
    }
}

impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("gcs_name", &self.gcs_name)
            .field("channel", &self.channel)
            .field("nonce", &self.nonce)
            .field("session_key", &"<redacted>")
            .finish()
    }
}

/// Outcome reported by a device in its completion response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionStatus {
    Accepted,
    Rejected,
}

impl CompletionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionStatus::Accepted => "accepted",
            CompletionStatus::Rejected => "rejected",
        }
    }
}

/// Signed response closing a handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionResponse {
    device_name: String,
    status: CompletionStatus,
    nonce: String,
    signature: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompletionWire {
    device_name: String,
    status: CompletionStatus,
    nonce: String,
    signature: String,
}

impl CompletionResponse {
    pub fn new(
        device_name: impl Into<String>,
        status: CompletionStatus,
        nonce: impl Into<String>,
        signature: Vec<u8>,
    ) -> Self {
        Self {
            device_name: device_name.into(),
            status,
            nonce: nonce.into(),
            signature,
        }
    }

    /// Bytes covered by the device signature
    pub fn signing_payload(device_name: &str, status: CompletionStatus, nonce: &str) -> Vec<u8> {
        format!("{}\n{}\n{}", device_name, status.as_str(), nonce).into_bytes()
    }

    /// Signed bytes of this response
    pub fn signed_bytes(&self) -> Vec<u8> {
        Self::signing_payload(&self.device_name, self.status, &self.nonce)
    }

    /// Parse a decrypted completion response
    pub fn parse(raw: &[u8]) -> Result<Self> {
        check_input_len(raw.len())?;
        let wire: CompletionWire = serde_json::from_slice(raw)
            .map_err(|e| ProtocolError::malformed(format!("completion response: {}", e)))?;

        validate_device_name(&wire.device_name)?;
        validate_nonce(&wire.nonce)?;
        let signature = decode_b64("signature", &wire.signature)?;
        if signature.is_empty() {
            return Err(ProtocolError::malformed("empty signature"));
        }

        Ok(Self {
            device_name: wire.device_name,
            status: wire.status,
            nonce: wire.nonce,
            signature,
        })
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        let wire = CompletionWire {
            device_name: self.device_name.clone(),
            status: self.status,
            nonce: self.nonce.clone(),
            signature: BASE64.encode(&self.signature),
        };
        Ok(serde_json::to_vec(&wire)?)
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn status(&self) -> CompletionStatus {
        self.status
    }

    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }
}

fn check_input_len(len: usize) -> Result<()> {
    if len == 0 {
        return Err(ProtocolError::malformed("empty input"));
    }
    if len > MAX_INPUT_LEN {
        return Err(ProtocolError::malformed(format!(
            "input of {} bytes exceeds {} byte limit",
            len, MAX_INPUT_LEN
        )));
    }
    Ok(())
}

fn decode_b64(field: &str, value: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(value.trim())
        .map_err(|_| ProtocolError::malformed(format!("{} is not valid base64", field)))
}

/// Validate a device name
pub fn validate_device_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(ProtocolError::malformed("device name is empty"));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(ProtocolError::malformed(format!(
            "device name longer than {} characters",
            MAX_NAME_LEN
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(ProtocolError::malformed(
            "device name contains control characters",
        ));
    }
    Ok(())
}

/// Validate a channel number and narrow it to `u16`
pub fn validate_channel(channel: i64) -> Result<u16> {
    if channel < i64::from(MIN_CHANNEL) || channel > i64::from(MAX_CHANNEL) {
        return Err(ProtocolError::malformed(format!(
            "channel {} outside {}..={}",
            channel, MIN_CHANNEL, MAX_CHANNEL
        )));
    }
    Ok(channel as u16)
}

/// Check that a base64 public key plausibly holds a DER SubjectPublicKeyInfo
pub fn validate_public_key(public_key: &str) -> Result<()> {
    let der = decode_b64("publicKey", public_key)?;
    if !(MIN_PUBLIC_KEY_LEN..=MAX_PUBLIC_KEY_LEN).contains(&der.len()) {
        return Err(ProtocolError::malformed(format!(
            "public key length {} out of range",
            der.len()
        )));
    }
    // DER SEQUENCE tag
    if der[0] != 0x30 {
        return Err(ProtocolError::malformed("public key is not a DER sequence"));
    }
    Ok(())
}

fn validate_nonce(nonce: &str) -> Result<()> {
    if nonce.is_empty() || nonce.len() > MAX_NONCE_LEN {
        return Err(ProtocolError::malformed("nonce length out of range"));
    }
    if !nonce.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ProtocolError::malformed("nonce must be hex"));
    }
    Ok(())
}

fn validate_url(url: &str) -> Result<()> {
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ProtocolError::malformed(format!(
            "pairUrl '{}' must be http or https",
            url
        )));
    }
    if url.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err(ProtocolError::malformed("pairUrl contains whitespace"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fake_public_key() -> String {
        let mut der = vec![0x30u8];
        der.extend(std::iter::repeat(0x42).take(293));
        BASE64.encode(der)
    }

    fn offer_json() -> serde_json::Value {
        json!({
            "deviceName": "Vehicle 7",
            "publicKey": fake_public_key(),
            "remoteIp": "10.20.0.7",
            "channel": 4
        })
    }

    #[test]
    fn test_parse_valid_offer() {
        let raw = serde_json::to_vec(&offer_json()).unwrap();
        let offer = PairingOffer::parse(&raw).unwrap();

        assert_eq!(offer.device_name(), "Vehicle 7");
        assert_eq!(offer.channel(), 4);
        assert_eq!(offer.remote_ip(), "10.20.0.7".parse::<IpAddr>().unwrap());
        assert_eq!(offer.upload_url(), "http://10.20.0.7/pair");
    }

    #[test]
    fn test_offer_serialize_parse() {
        let offer = PairingOffer::new(
            "rover",
            fake_public_key(),
            "fd00::7".parse().unwrap(),
            12,
            Some("https://fd00-7.local/pair".to_string()),
        )
        .unwrap();

        let raw = offer.serialize().unwrap();
        assert_eq!(PairingOffer::parse(raw.as_bytes()).unwrap(), offer);
    }

    #[test]
    fn test_ipv6_default_url() {
        let offer =
            PairingOffer::new("rover", fake_public_key(), "fd00::7".parse().unwrap(), 1, None)
                .unwrap();
        assert_eq!(offer.upload_url(), "http://[fd00::7]/pair");
        assert_eq!(offer.upload_url_with_path("gcs/pair"), "http://[fd00::7]/gcs/pair");
    }

    #[test]
    fn test_malformed_offers_rejected() {
        let mut cases: Vec<Vec<u8>> = vec![
            b"".to_vec(),
            b"not json".to_vec(),
            b"[]".to_vec(),
            b"{\"deviceName\": \"x\"}".to_vec(),
        ];

        let mut empty_name = offer_json();
        empty_name["deviceName"] = json!("   ");
        cases.push(serde_json::to_vec(&empty_name).unwrap());

        let mut control_name = offer_json();
        control_name["deviceName"] = json!("bad\u{0007}name");
        cases.push(serde_json::to_vec(&control_name).unwrap());

        let mut bad_key = offer_json();
        bad_key["publicKey"] = json!("!!not-base64!!");
        cases.push(serde_json::to_vec(&bad_key).unwrap());

        let mut short_key = offer_json();
        short_key["publicKey"] = json!(BASE64.encode([0x30, 1, 2]));
        cases.push(serde_json::to_vec(&short_key).unwrap());

        let mut bad_ip = offer_json();
        bad_ip["remoteIp"] = json!("10.20.0.300");
        cases.push(serde_json::to_vec(&bad_ip).unwrap());

        for channel in [0, -1, 256, 70000] {
            let mut bad_channel = offer_json();
            bad_channel["channel"] = json!(channel);
            cases.push(serde_json::to_vec(&bad_channel).unwrap());
        }

        let mut string_channel = offer_json();
        string_channel["channel"] = json!("4");
        cases.push(serde_json::to_vec(&string_channel).unwrap());

        let mut ftp_url = offer_json();
        ftp_url["pairUrl"] = json!("ftp://10.20.0.7/pair");
        cases.push(serde_json::to_vec(&ftp_url).unwrap());

        for raw in cases {
            let result = PairingOffer::parse(&raw);
            assert!(
                matches!(result, Err(ProtocolError::MalformedPayload(_))),
                "expected MalformedPayload for {:?}",
                String::from_utf8_lossy(&raw)
            );
        }
    }

    #[test]
    fn test_with_channel_validates() {
        let raw = serde_json::to_vec(&offer_json()).unwrap();
        let offer = PairingOffer::parse(&raw).unwrap();

        assert_eq!(offer.with_channel(9).unwrap().channel(), 9);
        assert!(offer.with_channel(0).is_err());
        assert!(offer.with_channel(MAX_CHANNEL + 1).is_err());
    }

    #[test]
    fn test_envelope_validation() {
        let envelope = SealedEnvelope::new(vec![7u8; 256], [1u8; 12], vec![9u8; 64]);
        let raw = envelope.to_json().unwrap();
        assert_eq!(SealedEnvelope::parse(&raw).unwrap(), envelope);

        let bad_version = raw.replace("\"v\":1", "\"v\":2");
        assert!(matches!(
            SealedEnvelope::parse(&bad_version),
            Err(ProtocolError::MalformedPayload(_))
        ));

        let short_nonce = json!({
            "v": 1,
            "key": BASE64.encode([7u8; 256]),
            "nonce": BASE64.encode([1u8; 8]),
            "data": BASE64.encode([9u8; 64]),
        })
        .to_string();
        assert!(SealedEnvelope::parse(&short_nonce).is_err());

        let short_key = json!({
            "v": 1,
            "key": BASE64.encode([7u8; 16]),
            "nonce": BASE64.encode([1u8; 12]),
            "data": BASE64.encode([9u8; 64]),
        })
        .to_string();
        assert!(SealedEnvelope::parse(&short_key).is_err());

        let oversized = "x".repeat(MAX_INPUT_LEN + 1);
        assert!(SealedEnvelope::parse(&oversized).is_err());
    }

    #[test]
    fn test_completion_response_parse() {
        let response = CompletionResponse::new(
            "Vehicle 7",
            CompletionStatus::Accepted,
            "a1b2c3",
            vec![1, 2, 3],
        );
        let raw = response.to_json().unwrap();
        let parsed = CompletionResponse::parse(&raw).unwrap();

        assert_eq!(parsed, response);
        assert_eq!(parsed.signed_bytes(), b"Vehicle 7\naccepted\na1b2c3".to_vec());

        let bad_status = br#"{"deviceName":"v","status":"maybe","nonce":"aa","signature":"AQID"}"#;
        assert!(CompletionResponse::parse(bad_status).is_err());

        let bad_nonce = br#"{"deviceName":"v","status":"accepted","nonce":"zz","signature":"AQID"}"#;
        assert!(CompletionResponse::parse(bad_nonce).is_err());
    }

    #[test]
    fn test_connect_request_debug_redacts_session_key() {
        let request = ConnectRequest::new(
            "GCS",
            3,
            fake_public_key(),
            &[0xAB; 32],
            "00ff",
            &[1, 2, 3],
        )
        .unwrap();

        let debug = format!("{:?}", request);
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains(&BASE64.encode([0xAB; 32])));

        let parsed = ConnectRequest::parse(&request.to_json().unwrap()).unwrap();
        assert_eq!(parsed.session_key().unwrap(), vec![0xAB; 32]);
        assert_eq!(parsed.channel(), 3);
    }
}
