//! Pairing State Machine
//!
//! Tracks the single in-flight handshake and the subsystem-wide
//! [`PairingStatus`].
//!
//! ## Transitions
//!
//! ```text
//! Idle        --start_pairing-->        Active
//! Active      --offer_rejected-->       Rejected
//! Active      --offer_accepted-->       Success --proceed--> Connecting
//! Connecting  --completion_verified-->  Connected
//! Connecting  --connection_failed-->    Error
//! Connecting  --connection_rejected-->  ConnectionRejected
//! Connected   --link_inactive-->        Idle
//! Connected   --link_failed-->          Error
//! any         --stop-->                 Idle
//! terminal    --acknowledge/expire-->   Idle
//! ```
//!
//! Failed steps go through [`PairingStateMachine::fail`], which picks the
//! failure transition from [`ProtocolError::terminal_status`].
//!
//! The machine is pure: it does no I/O and takes the current time as an
//! argument. Every handshake gets an attempt id; completions carrying an
//! older id are stale and must be dropped by the caller.

use crate::crypto::PeerPublicKey;
use crate::pairing::PairingOffer;
use crate::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Default time an Active handshake waits for an offer
pub const PAIRING_TIMEOUT: Duration = Duration::from_secs(120);

/// Default time a terminal status stays visible before returning to Idle
pub const STATUS_HOLD: Duration = Duration::from_secs(10);

/// Subsystem-wide pairing status
///
/// Discriminants are stable status codes for presentation layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingStatus {
    /// No handshake in progress
    Idle = 0,
    /// Waiting for a pairing offer
    Active = 1,
    /// Offer accepted, about to contact the device
    Success = 2,
    /// Connect request sent, awaiting completion response
    Connecting = 3,
    /// Handshake completed and verified
    Connected = 4,
    /// Offer could not be decrypted or was refused
    Rejected = 5,
    /// Device refused, or its response failed verification
    ConnectionRejected = 6,
    /// Transport failure after retries
    Error = 7,
}

impl PairingStatus {
    /// Stable numeric status code
    pub fn code(&self) -> u8 {
        *self as u8
    }

    /// Human-readable status text
    pub fn as_str(&self) -> &'static str {
        match self {
            PairingStatus::Idle => "Pairing not active",
            PairingStatus::Active => "Waiting for pairing offer",
            PairingStatus::Success => "Pairing offer accepted",
            PairingStatus::Connecting => "Connecting to device",
            PairingStatus::Connected => "Device connected",
            PairingStatus::Rejected => "Pairing rejected",
            PairingStatus::ConnectionRejected => "Connection rejected by device",
            PairingStatus::Error => "Pairing failed",
        }
    }

    /// Whether this status reports a failure
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            PairingStatus::Rejected | PairingStatus::ConnectionRejected | PairingStatus::Error
        )
    }

    /// Whether a handshake is in flight
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            PairingStatus::Active | PairingStatus::Success | PairingStatus::Connecting
        )
    }
}

impl fmt::Display for PairingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ephemeral state of one in-flight handshake
#[derive(Debug, Clone)]
pub struct PendingPairing {
    offer: PairingOffer,
    peer_key: PeerPublicKey,
    created_at: Instant,
}

impl PendingPairing {
    pub fn new(offer: PairingOffer, peer_key: PeerPublicKey, created_at: Instant) -> Self {
        Self {
            offer,
            peer_key,
            created_at,
        }
    }

    pub fn offer(&self) -> &PairingOffer {
        &self.offer
    }

    pub fn device_name(&self) -> &str {
        self.offer.device_name()
    }

    pub fn peer_key(&self) -> &PeerPublicKey {
        &self.peer_key
    }

    /// When the offer was accepted
    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}

/// State machine for the singular pairing handshake
#[derive(Debug)]
pub struct PairingStateMachine {
    status: PairingStatus,
    status_since: Instant,
    attempt: u64,
    pending: Option<PendingPairing>,
    linked_device: Option<String>,
}

impl PairingStateMachine {
    pub fn new(now: Instant) -> Self {
        Self {
            status: PairingStatus::Idle,
            status_since: now,
            attempt: 0,
            pending: None,
            linked_device: None,
        }
    }

    pub fn status(&self) -> PairingStatus {
        self.status
    }

    /// When the current status was entered
    pub fn status_since(&self) -> Instant {
        self.status_since
    }

    /// Id of the current (or most recent) handshake attempt
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Whether `attempt` still refers to the live handshake
    pub fn is_current(&self, attempt: u64) -> bool {
        attempt == self.attempt && self.status.is_in_flight()
    }

    pub fn pending(&self) -> Option<&PendingPairing> {
        self.pending.as_ref()
    }

    /// Device whose handshake produced the current Connected status
    pub fn linked_device(&self) -> Option<&str> {
        self.linked_device.as_deref()
    }

    fn transition(&mut self, to: PairingStatus, now: Instant) {
        debug!("Pairing status {:?} -> {:?}", self.status, to);
        self.status = to;
        self.status_since = now;
    }

    fn require(&self, expected: PairingStatus, operation: &str) -> Result<()> {
        if self.status != expected {
            return Err(ProtocolError::invalid_state(format!(
                "{} requires {:?}, current status is {:?}",
                operation, expected, self.status
            )));
        }
        Ok(())
    }

    /// Begin a new handshake; returns its attempt id
    ///
    /// Fails with `Busy` while another handshake is in flight.
    pub fn start_pairing(&mut self, now: Instant) -> Result<u64> {
        if self.status.is_in_flight() {
            return Err(ProtocolError::Busy(self.status));
        }
        self.attempt += 1;
        self.pending = None;
        self.linked_device = None;
        self.transition(PairingStatus::Active, now);
        Ok(self.attempt)
    }

    /// The offer failed to decrypt or was refused
    pub fn offer_rejected(&mut self, now: Instant) -> Result<()> {
        self.require(PairingStatus::Active, "offer_rejected")?;
        self.pending = None;
        self.transition(PairingStatus::Rejected, now);
        Ok(())
    }

    /// A decrypted, valid offer was accepted
    pub fn offer_accepted(&mut self, pending: PendingPairing, now: Instant) -> Result<()> {
        self.require(PairingStatus::Active, "offer_accepted")?;
        self.pending = Some(pending);
        self.transition(PairingStatus::Success, now);
        Ok(())
    }

    /// Move from Success to Connecting
    pub fn proceed(&mut self, now: Instant) -> Result<&PendingPairing> {
        self.require(PairingStatus::Success, "proceed")?;
        self.transition(PairingStatus::Connecting, now);
        self.pending
            .as_ref()
            .ok_or_else(|| ProtocolError::invalid_state("no pending pairing"))
    }

    /// Completion response decrypted and its signature verified
    ///
    /// Hands back the pending pairing for promotion into a device record.
    pub fn completion_verified(&mut self, now: Instant) -> Result<PendingPairing> {
        self.require(PairingStatus::Connecting, "completion_verified")?;
        let pending = self
            .pending
            .take()
            .ok_or_else(|| ProtocolError::invalid_state("no pending pairing"))?;
        self.linked_device = Some(pending.device_name().to_string());
        self.transition(PairingStatus::Connected, now);
        Ok(pending)
    }

    /// Upload round-trip failed after its retry budget
    pub fn connection_failed(&mut self, now: Instant) -> Result<()> {
        self.require(PairingStatus::Connecting, "connection_failed")?;
        self.pending = None;
        self.transition(PairingStatus::Error, now);
        Ok(())
    }

    /// Device refused, or its response did not verify
    pub fn connection_rejected(&mut self, now: Instant) -> Result<()> {
        self.require(PairingStatus::Connecting, "connection_rejected")?;
        self.pending = None;
        self.transition(PairingStatus::ConnectionRejected, now);
        Ok(())
    }

    /// Settle a failed handshake step in the status `error` maps to
    ///
    /// Returns the new status. Fails if no handshake step is running.
    pub fn fail(&mut self, error: &ProtocolError, now: Instant) -> Result<PairingStatus> {
        match error.terminal_status(self.status) {
            PairingStatus::Rejected => self.offer_rejected(now)?,
            PairingStatus::ConnectionRejected => self.connection_rejected(now)?,
            _ => self.connection_failed(now)?,
        }
        Ok(self.status)
    }

    /// Link establishment for the just-paired device failed
    pub fn link_failed(&mut self, device_name: &str, now: Instant) -> bool {
        if self.status == PairingStatus::Connected && self.linked_device.as_deref() == Some(device_name)
        {
            self.linked_device = None;
            self.transition(PairingStatus::Error, now);
            return true;
        }
        false
    }

    /// Link of the just-paired device went inactive
    pub fn link_inactive(&mut self, device_name: &str, now: Instant) -> bool {
        if self.status == PairingStatus::Connected && self.linked_device.as_deref() == Some(device_name)
        {
            self.linked_device = None;
            self.transition(PairingStatus::Idle, now);
            return true;
        }
        false
    }

    /// Cancel whatever is in progress and return to Idle
    ///
    /// Bumps the attempt id so late completions are recognised as stale.
    /// Established links are not affected.
    pub fn stop(&mut self, now: Instant) -> bool {
        if self.status == PairingStatus::Idle {
            return false;
        }
        self.attempt += 1;
        self.pending = None;
        self.linked_device = None;
        self.transition(PairingStatus::Idle, now);
        true
    }

    /// Clear a terminal failure status
    pub fn acknowledge(&mut self, now: Instant) -> bool {
        if self.status.is_error() {
            self.transition(PairingStatus::Idle, now);
            return true;
        }
        false
    }

    /// Apply timeouts: an Active handshake with no offer, or a failure
    /// status that has been visible long enough
    pub fn expire(&mut self, now: Instant, pairing_timeout: Duration, status_hold: Duration) -> bool {
        let elapsed = now.saturating_duration_since(self.status_since);
        match self.status {
            PairingStatus::Active if elapsed >= pairing_timeout => {
                debug!("Pairing timed out waiting for an offer");
                self.attempt += 1;
                self.pending = None;
                self.transition(PairingStatus::Idle, now);
                true
            }
            status if status.is_error() && elapsed >= status_hold => {
                self.transition(PairingStatus::Idle, now);
                true
            }
            _ => false,
        }
    }

    /// Deadline of the next [`PairingStateMachine::expire`] transition
    pub fn next_deadline(&self, pairing_timeout: Duration, status_hold: Duration) -> Option<Instant> {
        match self.status {
            PairingStatus::Active => Some(self.status_since + pairing_timeout),
            status if status.is_error() => Some(self.status_since + status_hold),
            _ => None,
        }
    }
}
