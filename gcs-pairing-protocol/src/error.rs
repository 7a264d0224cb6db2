//! Error handling for the pairing subsystem
//!
//! All fallible operations return [`Result`], an alias over [`ProtocolError`].
//! Library errors convert automatically through `From`, so `?` can be used
//! across crypto, codec, registry and transport code alike.
//!
//! ## Error Categories
//!
//! ### Payload errors
//! - `MalformedPayload`: structurally invalid JSON or field values. Raised
//!   before any cryptographic operation is attempted.
//! - `DecryptFailure`: a sealed envelope could not be opened. Carries no
//!   detail on purpose.
//! - `SignatureInvalid`: a decryptable completion response failed
//!   verification against the peer key.
//!
//! ### Transport errors
//! - `TransportFailure`: link establishment or an upload round-trip failed
//!   after its retry budget was spent.
//! - `Timeout`, `ConnectionRefused`, `NetworkUnreachable`, `NetworkError`:
//!   classified I/O failures, see [`ProtocolError::from_io_error`].
//!
//! ### Registry errors
//! - `RegistryCorruption`: one persisted device file failed to load.
//! - `DeviceNotFound`, `ChannelInUse`: registry contract violations.
//!
//! ### Handshake errors
//! - `Busy`: a handshake is already in flight.
//! - `InvalidState`: a transition that the current status does not allow.
//!
//! ## Logging Errors
//!
//! ```rust,ignore
//! use tracing::warn;
//!
//! if let Err(e) = registry.flush() {
//!     warn!("Failed to flush pairing cache: {}", e);
//! }
//! ```

use crate::pairing::PairingStatus;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for pairing operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur in the pairing subsystem
///
/// # Examples
///
/// ```rust
/// use gcs_pairing_protocol::ProtocolError;
///
/// let error = ProtocolError::DeviceNotFound("vehicle-7".to_string());
/// assert_eq!(error.to_string(), "Device not found: vehicle-7");
///
/// let error = ProtocolError::DecryptFailure;
/// assert_eq!(error.to_string(), "Payload could not be decrypted");
/// ```
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// I/O error (file system, sockets)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    ///
    /// Only produced when serializing our own documents. Incoming JSON that
    /// fails to parse is reported as [`ProtocolError::MalformedPayload`].
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// OpenSSL failure while generating, loading or using a key
    #[error("Crypto error: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Structurally invalid payload or field value
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// A sealed envelope failed to decrypt or authenticate
    #[error("Payload could not be decrypted")]
    DecryptFailure,

    /// Sealing or random generation failed inside the AEAD backend
    #[error("Cryptographic operation failed")]
    CryptoOperation,

    /// A completion response failed signature or nonce verification
    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    /// Link establishment or upload failed after retries
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// A persisted device file could not be loaded
    #[error("Registry corruption in {path}: {reason}")]
    RegistryCorruption {
        /// File that failed to load
        path: PathBuf,
        /// What went wrong
        reason: String,
    },

    /// Device not present in the registry
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Channel already assigned to another device
    #[error("Channel {channel} already in use by {owner}")]
    ChannelInUse {
        /// Requested channel
        channel: u16,
        /// Device currently holding it
        owner: String,
    },

    /// A handshake is already in flight
    #[error("Pairing busy: handshake in status {0:?}")]
    Busy(PairingStatus),

    /// Transition not allowed from the current status
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Operation timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Remote refused the connection
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Remote network unreachable
    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    /// Generic network failure (reset, broken pipe)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Permission denied on a file or socket
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The manager event loop is no longer running
    #[error("Pairing manager stopped")]
    ManagerStopped,
}

impl ProtocolError {
    /// Classify an I/O error with context
    ///
    /// Network-ish error kinds map onto dedicated variants so that callers
    /// can decide whether retrying makes sense.
    pub fn from_io_error(error: std::io::Error, context: &str) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(format!("{}: {}", context, error)),
            ErrorKind::ConnectionRefused => {
                ProtocolError::ConnectionRefused(format!("{}: {}", context, error))
            }
            ErrorKind::NetworkUnreachable => {
                ProtocolError::NetworkUnreachable(format!("{}: {}", context, error))
            }
            ErrorKind::PermissionDenied => {
                ProtocolError::PermissionDenied(format!("{}: {}", context, error))
            }
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                ProtocolError::NetworkError(format!(
                    "{}: connection interrupted ({})",
                    context, error
                ))
            }
            _ => ProtocolError::Io(error),
        }
    }

    /// Shorthand for a malformed payload error
    pub fn malformed(msg: impl Into<String>) -> Self {
        ProtocolError::MalformedPayload(msg.into())
    }

    /// Shorthand for an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        ProtocolError::InvalidState(msg.into())
    }

    /// Whether retrying the same operation may succeed
    ///
    /// Cryptographic and parsing failures are never recoverable: a failed
    /// attempt is terminal and is not retried with relaxed checks. HTTP
    /// errors are only retried for 5xx answers or when no answer came.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ProtocolError::Timeout(_)
            | ProtocolError::NetworkError(_)
            | ProtocolError::NetworkUnreachable(_)
            | ProtocolError::ConnectionRefused(_)
            | ProtocolError::Io(_) => true,
            ProtocolError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().map_or(true, |status| status.is_server_error())
            }
            _ => false,
        }
    }

    /// Status a handshake settles in when a step run in `phase` fails
    ///
    /// Any failure while handling an offer rejects it. During the connect
    /// round-trip an answer that cannot be trusted is a
    /// `ConnectionRejected`; everything else is a plain `Error`.
    pub fn terminal_status(&self, phase: PairingStatus) -> PairingStatus {
        match phase {
            PairingStatus::Active => PairingStatus::Rejected,
            PairingStatus::Connecting => match self {
                ProtocolError::SignatureInvalid(_)
                | ProtocolError::DecryptFailure
                | ProtocolError::MalformedPayload(_) => PairingStatus::ConnectionRejected,
                _ => PairingStatus::Error,
            },
            _ => PairingStatus::Error,
        }
    }

    /// Map an AEAD backend failure on a sealing path
    pub(crate) fn crypto_operation(_: ring::error::Unspecified) -> Self {
        ProtocolError::CryptoOperation
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            ProtocolError::MalformedPayload(_) | ProtocolError::DecryptFailure => {
                "Pairing request rejected. Try pairing the device again.".to_string()
            }
            ProtocolError::SignatureInvalid(_) => {
                "Device could not be authenticated. The response may have been tampered with."
                    .to_string()
            }
            ProtocolError::TransportFailure(msg) => {
                format!("Could not reach device: {}. Check the radio link.", msg)
            }
            ProtocolError::ChannelInUse { channel, owner } => {
                format!("Channel {} is already used by {}.", channel, owner)
            }
            ProtocolError::DeviceNotFound(name) => {
                format!("Device '{}' is not paired.", name)
            }
            ProtocolError::Busy(_) => {
                "Another pairing is in progress. Wait for it to finish or cancel it.".to_string()
            }
            ProtocolError::RegistryCorruption { path, .. } => {
                format!("Ignoring unreadable pairing file {}.", path.display())
            }
            ProtocolError::Timeout(msg) => {
                format!("Connection timeout: {}. Check network connection.", msg)
            }
            ProtocolError::PermissionDenied(msg) => {
                format!("Permission denied: {}. Check file permissions.", msg)
            }
            ProtocolError::Configuration(msg) => {
                format!("Configuration error: {}. Check your settings.", msg)
            }
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ProtocolError::DeviceNotFound("vehicle-1".to_string());
        assert_eq!(error.to_string(), "Device not found: vehicle-1");

        let error = ProtocolError::ChannelInUse {
            channel: 4,
            owner: "vehicle-2".to_string(),
        };
        assert_eq!(error.to_string(), "Channel 4 already in use by vehicle-2");

        let error = ProtocolError::malformed("missing deviceName");
        assert_eq!(error.to_string(), "Malformed payload: missing deviceName");
    }

    #[test]
    fn test_decrypt_failure_has_no_detail() {
        let error = ProtocolError::DecryptFailure;
        assert_eq!(error.to_string(), "Payload could not be decrypted");
    }

    #[test]
    fn test_io_error_classification() {
        use std::io::{Error, ErrorKind};

        let error = ProtocolError::from_io_error(Error::new(ErrorKind::TimedOut, "slow"), "upload");
        assert!(matches!(error, ProtocolError::Timeout(_)));
        assert!(error.is_recoverable());

        let error =
            ProtocolError::from_io_error(Error::new(ErrorKind::NotFound, "missing"), "reading");
        assert!(matches!(error, ProtocolError::Io(_)));
    }

    #[test]
    fn test_terminal_status_mapping() {
        let offer_errors = [
            ProtocolError::DecryptFailure,
            ProtocolError::malformed("x"),
            ProtocolError::ChannelInUse {
                channel: 3,
                owner: "vehicle-2".into(),
            },
        ];
        for error in &offer_errors {
            assert_eq!(error.terminal_status(PairingStatus::Active), PairingStatus::Rejected);
        }

        assert_eq!(
            ProtocolError::SignatureInvalid("bad".into()).terminal_status(PairingStatus::Connecting),
            PairingStatus::ConnectionRejected
        );
        assert_eq!(
            ProtocolError::DecryptFailure.terminal_status(PairingStatus::Connecting),
            PairingStatus::ConnectionRejected
        );
        assert_eq!(
            ProtocolError::TransportFailure("down".into()).terminal_status(PairingStatus::Connecting),
            PairingStatus::Error
        );
    }

    #[test]
    fn test_network_errors_recoverable() {
        assert!(ProtocolError::Timeout("slow".into()).is_recoverable());
        assert!(ProtocolError::ConnectionRefused("closed".into()).is_recoverable());
        assert!(!ProtocolError::TransportFailure("spent".into()).is_recoverable());
        assert!(!ProtocolError::ChannelInUse {
            channel: 1,
            owner: "vehicle-1".into()
        }
        .is_recoverable());
    }

    #[test]
    fn test_crypto_errors_not_recoverable() {
        assert!(!ProtocolError::DecryptFailure.is_recoverable());
        assert!(!ProtocolError::SignatureInvalid("x".into()).is_recoverable());
        assert!(!ProtocolError::malformed("x").is_recoverable());
    }
}
