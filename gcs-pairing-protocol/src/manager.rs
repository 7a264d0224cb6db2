//! Pairing Manager
//!
//! Event-driven core of the subsystem. A single task owns the identity,
//! registry, state machine, transport coordinator and reconnect supervisor
//! and processes one event at a time:
//!
//! - commands from any number of [`PairingHandle`]s
//! - link activity notifications from the transport
//! - completions of spawned uploads and link establishments
//! - the jittered reconnect tick and handshake deadlines
//!
//! Uploads and link establishment are the only operations that wait on
//! the outside world; they run as separate tasks and report back as events.
//! Handshake completions carry the attempt id they were started with and
//! are dropped when the handshake has moved on.
//!
//! ## Status surface
//!
//! The current [`StatusSnapshot`] is published through a `watch` channel
//! and discrete [`PairingEvent`]s through a `broadcast` channel. Neither
//! exposes key material.

use crate::crypto::{CryptoIdentity, PeerPublicKey, SessionKey};
use crate::device::{Device, DeviceRegistry, Snapshot};
use crate::discovery::DiscoveredOffer;
use crate::pairing::codec::validate_channel;
use crate::pairing::{
    CompletionResponse, CompletionStatus, ConnectRequest, PairingEvent, PairingStateMachine,
    PairingStatus, PendingPairing, SealedEnvelope, DEFAULT_PAIR_PATH, PAIRING_TIMEOUT, STATUS_HOLD,
};
use crate::recovery::{ReconnectPolicy, ReconnectSupervisor};
use crate::transport::{LinkActivity, LinkChange, LinkHandle, LinkTarget, LinkTransport, TransportCoordinator};
use crate::upload::{post_with_retries, RetryPolicy, Uploader};
use crate::{ProtocolError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Default name announced to devices in connect requests
pub const DEFAULT_LOCAL_NAME: &str = "Ground Station";

const COMMAND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 128;
const IDLE_WAKEUP: Duration = Duration::from_secs(3600);

/// Manager configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Name announced to devices
    pub local_name: String,

    /// How long an Active handshake waits for an offer
    pub pairing_timeout: Duration,

    /// How long a failure status stays visible
    pub status_hold: Duration,

    /// Retry budget of the connect request upload
    pub upload_retry: RetryPolicy,

    /// Reconnect sweep timing
    pub reconnect: ReconnectPolicy,

    /// Pair endpoint path used when an offer carries no URL
    pub pair_path: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            local_name: DEFAULT_LOCAL_NAME.to_string(),
            pairing_timeout: PAIRING_TIMEOUT,
            status_hold: STATUS_HOLD,
            upload_retry: RetryPolicy::default(),
            reconnect: ReconnectPolicy::default(),
            pair_path: DEFAULT_PAIR_PATH.to_string(),
        }
    }
}

/// Read-only view of the subsystem state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    /// Current handshake status
    pub status: PairingStatus,

    /// Human-readable status
    pub status_text: &'static str,

    /// Whether the status reports a failure
    pub error_state: bool,

    /// Names of paired devices
    pub paired: Snapshot<String>,

    /// Names of devices with an active link
    pub connected: Snapshot<String>,

    /// Most recently connected device
    pub last_connected: Option<String>,

    /// Whether pairing and reconnection are enabled
    pub enabled: bool,
}

impl StatusSnapshot {
    fn initial() -> Self {
        Self {
            status: PairingStatus::Idle,
            status_text: PairingStatus::Idle.as_str(),
            error_state: false,
            paired: Snapshot::default(),
            connected: Snapshot::default(),
            last_connected: None,
            enabled: true,
        }
    }

    pub fn is_paired(&self, name: &str) -> bool {
        self.paired.iter().any(|n| n == name)
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.connected.iter().any(|n| n == name)
    }
}

enum Command {
    StartPairing {
        reply: oneshot::Sender<Result<()>>,
    },
    SubmitOffer(DiscoveredOffer),
    StopPairing {
        reply: oneshot::Sender<bool>,
    },
    Acknowledge {
        reply: oneshot::Sender<bool>,
    },
    ConnectDevice {
        name: String,
        reply: oneshot::Sender<Result<()>>,
    },
    DisconnectDevice {
        name: String,
        reply: oneshot::Sender<Result<()>>,
    },
    RemoveDevice {
        name: String,
        reply: oneshot::Sender<bool>,
    },
    SetDeviceChannel {
        name: String,
        channel: u16,
        reply: oneshot::Sender<Result<()>>,
    },
    SetEnabled {
        enabled: bool,
        reply: oneshot::Sender<()>,
    },
    ListPaired {
        reply: oneshot::Sender<Snapshot<Device>>,
    },
    Flush {
        reply: oneshot::Sender<Result<usize>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum Internal {
    HandshakeFinished {
        attempt: u64,
        reply: Result<Vec<u8>>,
    },
    LinkFinished {
        target: LinkTarget,
        result: Result<LinkHandle>,
    },
}

/// Secrets of the handshake currently in Connecting
struct HandshakeContext {
    attempt: u64,
    session_key: SessionKey,
    nonce: String,
    upload: JoinHandle<()>,
}

/// Cloneable command surface of a running [`PairingManager`]
#[derive(Clone)]
pub struct PairingHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<StatusSnapshot>,
    events: broadcast::Sender<PairingEvent>,
}

impl PairingHandle {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| ProtocolError::ManagerStopped)?;
        response.await.map_err(|_| ProtocolError::ManagerStopped)
    }

    /// Start waiting for a pairing offer
    ///
    /// Fails with `Busy` while another handshake is in flight.
    pub async fn start_pairing(&self) -> Result<()> {
        self.request(|reply| Command::StartPairing { reply }).await?
    }

    /// Hand a discovered offer to the manager
    ///
    /// Offers are processed in submission order; the outcome is reported
    /// through the status surface.
    pub async fn submit_offer(&self, offer: DiscoveredOffer) -> Result<()> {
        self.commands
            .send(Command::SubmitOffer(offer))
            .await
            .map_err(|_| ProtocolError::ManagerStopped)
    }

    /// Cancel the in-flight handshake; returns whether anything changed
    pub async fn stop_pairing(&self) -> Result<bool> {
        self.request(|reply| Command::StopPairing { reply }).await
    }

    /// Clear a failure status
    pub async fn acknowledge(&self) -> Result<bool> {
        self.request(|reply| Command::Acknowledge { reply }).await
    }

    /// Reconnect a paired device now and resume automatic reconnection
    pub async fn connect_device(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.request(|reply| Command::ConnectDevice { name, reply })
            .await?
    }

    /// Drop a device link and stop reconnecting it until
    /// [`PairingHandle::connect_device`]
    pub async fn disconnect_device(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.request(|reply| Command::DisconnectDevice { name, reply })
            .await?
    }

    /// Unpair a device; removing an unknown name is a no-op
    ///
    /// Returns whether the device was paired.
    pub async fn remove_device(&self, name: impl Into<String>) -> Result<bool> {
        let name = name.into();
        self.request(|reply| Command::RemoveDevice { name, reply })
            .await
    }

    /// Move a paired device to another channel
    pub async fn set_device_channel(&self, name: impl Into<String>, channel: u16) -> Result<()> {
        let name = name.into();
        self.request(|reply| Command::SetDeviceChannel {
            name,
            channel,
            reply,
        })
        .await?
    }

    /// Enable or disable pairing and reconnection
    pub async fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.request(|reply| Command::SetEnabled { enabled, reply })
            .await
    }

    /// Snapshot of paired device records
    pub async fn list_paired(&self) -> Result<Snapshot<Device>> {
        self.request(|reply| Command::ListPaired { reply }).await
    }

    /// Write pending registry changes now
    pub async fn flush(&self) -> Result<usize> {
        self.request(|reply| Command::Flush { reply }).await?
    }

    /// Current status snapshot
    pub fn status(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    /// Receiver of status snapshot updates
    pub fn watch_status(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.clone()
    }

    /// Receiver of discrete pairing events
    pub fn subscribe_events(&self) -> broadcast::Receiver<PairingEvent> {
        self.events.subscribe()
    }

    /// Tear down links, flush the registry and stop the manager
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

/// Owner of all pairing state; see the module documentation
pub struct PairingManager {
    config: ManagerConfig,
    identity: CryptoIdentity,
    registry: DeviceRegistry,
    state: PairingStateMachine,
    coordinator: TransportCoordinator,
    supervisor: ReconnectSupervisor,
    uploader: Arc<dyn Uploader>,
    enabled: bool,
    last_connected: Option<String>,
    handshake: Option<HandshakeContext>,
    published_status: PairingStatus,
    commands: mpsc::Receiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    activity_rx: mpsc::UnboundedReceiver<LinkActivity>,
    status_tx: watch::Sender<StatusSnapshot>,
    events: broadcast::Sender<PairingEvent>,
}

impl PairingManager {
    /// Assemble a manager from its collaborators
    ///
    /// `activity_rx` receives the notifications of `transport`.
    pub fn new(
        config: ManagerConfig,
        identity: CryptoIdentity,
        registry: DeviceRegistry,
        uploader: Arc<dyn Uploader>,
        transport: Arc<dyn LinkTransport>,
        activity_rx: mpsc::UnboundedReceiver<LinkActivity>,
    ) -> (Self, PairingHandle) {
        let (command_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(StatusSnapshot::initial());
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        let handle = PairingHandle {
            commands: command_tx,
            status: status_rx,
            events: events.clone(),
        };

        let manager = Self {
            supervisor: ReconnectSupervisor::new(config.reconnect),
            config,
            identity,
            registry,
            state: PairingStateMachine::new(Instant::now()),
            coordinator: TransportCoordinator::new(transport),
            uploader,
            enabled: true,
            last_connected: None,
            handshake: None,
            published_status: PairingStatus::Idle,
            commands,
            internal_tx,
            internal_rx,
            activity_rx,
            status_tx,
            events,
        };

        (manager, handle)
    }

    /// Create a manager and run it on a new task
    pub fn spawn(
        config: ManagerConfig,
        identity: CryptoIdentity,
        registry: DeviceRegistry,
        uploader: Arc<dyn Uploader>,
        transport: Arc<dyn LinkTransport>,
        activity_rx: mpsc::UnboundedReceiver<LinkActivity>,
    ) -> (PairingHandle, JoinHandle<()>) {
        let (manager, handle) = Self::new(config, identity, registry, uploader, transport, activity_rx);
        let task = tokio::spawn(manager.run());
        (handle, task)
    }

    /// Process events until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        info!(
            "Pairing manager started with {} paired device(s), fingerprint {}",
            self.registry.len(),
            self.identity.fingerprint()
        );
        self.publish();

        let reconnect_tick = sleep(self.supervisor.next_delay());
        tokio::pin!(reconnect_tick);

        loop {
            let deadline = self
                .state
                .next_deadline(self.config.pairing_timeout, self.config.status_hold);
            let wakeup = deadline.unwrap_or_else(|| Instant::now() + IDLE_WAKEUP);

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("All pairing handles dropped");
                        self.shutdown().await;
                        break;
                    }
                },
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal).await,
                Some(activity) = self.activity_rx.recv() => self.handle_activity(activity),
                () = &mut reconnect_tick => {
                    self.reconnect_sweep();
                    reconnect_tick.as_mut().reset(Instant::now() + self.supervisor.next_delay());
                }
                () = sleep_until(wakeup), if deadline.is_some() => {
                    if self.state.expire(Instant::now(), self.config.pairing_timeout, self.config.status_hold) {
                        self.abort_handshake();
                    }
                }
            }

            self.persist();
            self.publish();
        }

        info!("Pairing manager stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartPairing { reply } => {
                let _ = reply.send(self.start_pairing());
            }
            Command::SubmitOffer(offer) => self.handle_offer(offer),
            Command::StopPairing { reply } => {
                let changed = self.state.stop(Instant::now());
                self.abort_handshake();
                if changed {
                    info!("Pairing stopped");
                }
                let _ = reply.send(changed);
            }
            Command::Acknowledge { reply } => {
                let _ = reply.send(self.state.acknowledge(Instant::now()));
            }
            Command::ConnectDevice { name, reply } => {
                let _ = reply.send(self.connect_device(&name));
            }
            Command::DisconnectDevice { name, reply } => {
                let result = self.disconnect_device(&name).await;
                let _ = reply.send(result);
            }
            Command::RemoveDevice { name, reply } => {
                let removed = self.remove_device(&name).await;
                let _ = reply.send(removed);
            }
            Command::SetDeviceChannel {
                name,
                channel,
                reply,
            } => {
                let result = self.set_device_channel(&name, channel).await;
                let _ = reply.send(result);
            }
            Command::SetEnabled { enabled, reply } => {
                self.set_enabled(enabled).await;
                let _ = reply.send(());
            }
            Command::ListPaired { reply } => {
                let _ = reply.send(self.registry.list_paired());
            }
            Command::Flush { reply } => {
                let _ = reply.send(self.registry.flush());
            }
            Command::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
            }
        }
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::HandshakeFinished { attempt, reply } => {
                self.handle_handshake_finished(attempt, reply).await
            }
            Internal::LinkFinished { target, result } => {
                self.handle_link_finished(target, result).await
            }
        }
    }

    fn emit(&self, event: PairingEvent) {
        let _ = self.events.send(event);
    }

    fn publish(&mut self) {
        let status = self.state.status();
        if status != self.published_status {
            self.emit(PairingEvent::StatusChanged {
                previous: self.published_status,
                status,
            });
            self.published_status = status;
        }

        let snapshot = StatusSnapshot {
            status,
            status_text: status.as_str(),
            error_state: status.is_error(),
            paired: Snapshot::from(
                self.registry
                    .list_paired()
                    .iter()
                    .map(|d| d.name.clone())
                    .collect::<Vec<_>>(),
            ),
            connected: self.registry.list_connected(),
            last_connected: self.last_connected.clone(),
            enabled: self.enabled,
        };

        self.status_tx.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }

    fn persist(&mut self) {
        if self.registry.is_dirty() {
            if let Err(e) = self.registry.flush() {
                warn!("Failed to flush pairing cache: {}", e);
            }
        }
    }

    fn abort_handshake(&mut self) {
        if let Some(handshake) = self.handshake.take() {
            handshake.upload.abort();
        }
    }

    fn start_pairing(&mut self) -> Result<()> {
        if !self.enabled {
            return Err(ProtocolError::invalid_state("pairing is disabled"));
        }
        let attempt = self.state.start_pairing(Instant::now())?;
        info!("Pairing started (attempt {})", attempt);
        Ok(())
    }

    fn handle_offer(&mut self, discovered: DiscoveredOffer) {
        if !self.enabled || self.state.status() != PairingStatus::Active {
            debug!(
                "Ignoring pairing offer from {} in status {:?}",
                discovered.source,
                self.state.status()
            );
            return;
        }

        let envelope = match SealedEnvelope::parse(&discovered.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping pairing envelope from {}: {}", discovered.source, e);
                return;
            }
        };

        let pending = match self.accept_offer(&envelope, discovered.channel) {
            Ok(pending) => pending,
            Err(e) => {
                warn!("Rejecting pairing offer from {}: {}", discovered.source, e);
                if self.state.fail(&e, Instant::now()).is_ok() {
                    self.emit(PairingEvent::OfferRejected {
                        reason: e.user_message(),
                    });
                }
                return;
            }
        };

        let device_name = pending.device_name().to_string();
        let fingerprint = pending.peer_key().fingerprint();
        info!(
            "Accepted pairing offer from {} (fingerprint {})",
            device_name, fingerprint
        );

        if let Err(e) = self.state.offer_accepted(pending, Instant::now()) {
            warn!("Could not accept offer: {}", e);
            return;
        }
        self.emit(PairingEvent::OfferReceived {
            device_name,
            fingerprint,
        });
        self.publish();

        self.begin_connect();
    }

    fn accept_offer(&self, envelope: &SealedEnvelope, channel: Option<u16>) -> Result<PendingPairing> {
        if let Some(channel) = channel {
            validate_channel(i64::from(channel))?;
        }
        let mut offer = self.identity.decrypt_pairing_envelope(envelope)?;
        if let Some(channel) = channel {
            offer = offer.with_channel(channel)?;
        }

        let peer_key = PeerPublicKey::from_base64(offer.public_key())?;

        if let Some(owner) = self.registry.channel_owner(offer.channel()) {
            if owner != offer.device_name() {
                return Err(ProtocolError::ChannelInUse {
                    channel: offer.channel(),
                    owner: owner.to_string(),
                });
            }
        }

        Ok(PendingPairing::new(offer, peer_key, Instant::now()))
    }

    fn begin_connect(&mut self) {
        let attempt = self.state.attempt();
        let pending = match self.state.proceed(Instant::now()) {
            Ok(pending) => pending.clone(),
            Err(e) => {
                warn!("Cannot proceed with handshake: {}", e);
                return;
            }
        };

        let (body, session_key, nonce) = match self.build_connect_request(&pending) {
            Ok(parts) => parts,
            Err(e) => {
                error!("Failed to build connect request: {}", e);
                let _ = self.state.fail(&e, Instant::now());
                self.emit(PairingEvent::Error {
                    device_name: Some(pending.device_name().to_string()),
                    message: e.user_message(),
                });
                return;
            }
        };

        let url = pending.offer().upload_url_with_path(&self.config.pair_path);
        info!("Sending connect request to {} at {}", pending.device_name(), url);

        let uploader = Arc::clone(&self.uploader);
        let retry = self.config.upload_retry;
        let internal_tx = self.internal_tx.clone();
        let upload = tokio::spawn(async move {
            let reply = post_with_retries(uploader.as_ref(), &url, &body, retry).await;
            let _ = internal_tx.send(Internal::HandshakeFinished { attempt, reply });
        });

        self.handshake = Some(HandshakeContext {
            attempt,
            session_key,
            nonce,
            upload,
        });
    }

    fn build_connect_request(&self, pending: &PendingPairing) -> Result<(Vec<u8>, SessionKey, String)> {
        let session_key = self.identity.derive_session_key()?;
        let nonce = self.identity.handshake_nonce()?;
        let channel = pending.offer().channel();

        let signature = self.identity.sign(&ConnectRequest::signing_payload(
            &self.config.local_name,
            channel,
            &nonce,
        ))?;
        let request = ConnectRequest::new(
            self.config.local_name.as_str(),
            channel,
            self.identity.public_key_base64(),
            session_key.as_bytes(),
            nonce.as_str(),
            &signature,
        )?;

        let sealed = self
            .identity
            .encrypt_for_peer(pending.peer_key(), &request.to_json()?)?;
        Ok((sealed.to_json()?.into_bytes(), session_key, nonce))
    }

    async fn handle_handshake_finished(&mut self, attempt: u64, reply: Result<Vec<u8>>) {
        if !self.state.is_current(attempt) || self.state.status() != PairingStatus::Connecting {
            debug!("Discarding stale handshake completion (attempt {})", attempt);
            return;
        }
        if self.handshake.as_ref().map(|h| h.attempt) != Some(attempt) {
            return;
        }
        let Some(handshake) = self.handshake.take() else {
            return;
        };
        let Some(pending) = self.state.pending().cloned() else {
            return;
        };
        let device_name = pending.device_name().to_string();

        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Connect request to {} failed: {}", device_name, e);
                let _ = self.state.fail(&e, Instant::now());
                self.emit(PairingEvent::Error {
                    device_name: Some(device_name),
                    message: e.user_message(),
                });
                return;
            }
        };

        match self.verify_completion(&reply, &handshake, &pending) {
            Ok(CompletionStatus::Accepted) => {
                self.promote(pending, handshake.session_key).await;
            }
            Ok(CompletionStatus::Rejected) => {
                info!("{} refused the connection", device_name);
                let _ = self.state.connection_rejected(Instant::now());
                self.emit(PairingEvent::Error {
                    device_name: Some(device_name),
                    message: "Device refused the connection.".to_string(),
                });
            }
            Err(e) => {
                warn!("Completion response from {} rejected: {}", device_name, e);
                let _ = self.state.fail(&e, Instant::now());
                self.emit(PairingEvent::Error {
                    device_name: Some(device_name),
                    message: e.user_message(),
                });
            }
        }
    }

    /// Open and authenticate a completion response
    ///
    /// Decryption alone is not enough: the response must come from the
    /// offering device, echo our nonce and carry a valid signature.
    fn verify_completion(
        &self,
        reply: &[u8],
        handshake: &HandshakeContext,
        pending: &PendingPairing,
    ) -> Result<CompletionStatus> {
        let text = std::str::from_utf8(reply)
            .map_err(|_| ProtocolError::malformed("completion response is not UTF-8"))?;
        let envelope = SealedEnvelope::parse(text)?;
        let plaintext = self.identity.open(&envelope)?;
        let response = CompletionResponse::parse(&plaintext)?;

        if response.device_name() != pending.device_name() {
            return Err(ProtocolError::SignatureInvalid(format!(
                "response names '{}'",
                response.device_name()
            )));
        }
        if response.nonce() != handshake.nonce {
            return Err(ProtocolError::SignatureInvalid("nonce mismatch".to_string()));
        }
        if !CryptoIdentity::verify(&response.signed_bytes(), response.signature(), pending.peer_key()) {
            return Err(ProtocolError::SignatureInvalid(
                "signature does not verify".to_string(),
            ));
        }

        Ok(response.status())
    }

    async fn promote(&mut self, pending: PendingPairing, session_key: SessionKey) {
        let offer = pending.offer();
        let device_name = offer.device_name().to_string();

        let stored = self
            .identity
            .seal_session_key(&device_name, &session_key)
            .and_then(|sealed| {
                self.registry.upsert(Device::new(
                    device_name.as_str(),
                    offer.public_key(),
                    offer.remote_ip(),
                    offer.channel(),
                    sealed,
                ))
            });
        if let Err(e) = stored {
            error!("Failed to store paired device {}: {}", device_name, e);
            let _ = self.state.fail(&e, Instant::now());
            self.emit(PairingEvent::Error {
                device_name: Some(device_name),
                message: e.user_message(),
            });
            return;
        }

        if let Err(e) = self.state.completion_verified(Instant::now()) {
            warn!("Handshake state changed under completion: {}", e);
            return;
        }

        info!(
            "Paired with {} on channel {} ({}ms after its offer)",
            device_name,
            offer.channel(),
            pending.created_at().elapsed().as_millis()
        );
        self.supervisor.resume(&device_name);
        self.emit(PairingEvent::DevicePaired {
            device_name: device_name.clone(),
            channel: offer.channel(),
        });

        // Re-pairing replaces whatever link the old record had
        if self.coordinator.is_established(&device_name) || self.coordinator.is_active(&device_name) {
            self.teardown(&device_name).await;
        }

        if let Some(device) = self.registry.get(&device_name) {
            let target = LinkTarget::from(device);
            self.start_link(target);
        }
    }

    fn start_link(&mut self, target: LinkTarget) {
        if !self.supervisor.try_begin(&target.device_name) {
            debug!("Link attempt for {} already in flight", target.device_name);
            return;
        }
        self.spawn_link(target);
    }

    fn spawn_link(&self, target: LinkTarget) {
        debug!("Establishing link for {}", target);
        let transport = self.coordinator.transport();
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = transport.establish_link(&target).await;
            let _ = internal_tx.send(Internal::LinkFinished { target, result });
        });
    }

    async fn handle_link_finished(&mut self, target: LinkTarget, result: Result<LinkHandle>) {
        let device_name = target.device_name.as_str();

        if !self.registry.contains(device_name) {
            debug!("Link attempt for {} resolved after it was unpaired", device_name);
            self.supervisor.release(device_name);
            if result.is_ok() {
                self.teardown(device_name).await;
            }
            return;
        }

        match result {
            Ok(handle) => {
                self.supervisor.finish(device_name, true);

                let channel = self.registry.get(device_name).map(|d| d.channel);
                let wanted = self.enabled
                    && !self.supervisor.is_suspended(device_name)
                    && channel == Some(handle.channel);
                if !wanted {
                    debug!("Discarding link for {} established after a change", device_name);
                    self.teardown(device_name).await;
                    return;
                }
                self.coordinator.link_established(handle);
            }
            Err(e) => {
                let failures = self.supervisor.finish(device_name, false);
                warn!(
                    "Link attempt for {} failed ({} in a row): {}",
                    device_name, failures, e
                );
                self.emit(PairingEvent::ReconnectFailed {
                    device_name: device_name.to_string(),
                    failures,
                });
                self.state.link_failed(device_name, Instant::now());
            }
        }
    }

    fn handle_activity(&mut self, activity: LinkActivity) {
        match self.coordinator.on_link_active(&activity, &mut self.registry) {
            LinkChange::Activated => {
                self.last_connected = Some(activity.device_name.clone());
                self.emit(PairingEvent::DeviceConnected {
                    device_name: activity.device_name,
                });
            }
            LinkChange::Deactivated => {
                self.state.link_inactive(&activity.device_name, Instant::now());
                self.emit(PairingEvent::DeviceDisconnected {
                    device_name: activity.device_name,
                });
            }
            LinkChange::Ignored => {}
        }
    }

    fn reconnect_sweep(&mut self) {
        for target in self.supervisor.sweep(&self.registry) {
            debug!("Reconnecting {}", target);
            self.spawn_link(target);
        }
    }

    /// Tear down a link, reporting a disconnect if it was active
    async fn teardown(&mut self, device_name: &str) {
        match self.coordinator.teardown_link(device_name, &mut self.registry).await {
            Ok(true) => self.emit(PairingEvent::DeviceDisconnected {
                device_name: device_name.to_string(),
            }),
            Ok(false) => {}
            Err(e) => warn!("Failed to tear down link for {}: {}", device_name, e),
        }
    }

    fn connect_device(&mut self, name: &str) -> Result<()> {
        let device = self
            .registry
            .get(name)
            .ok_or_else(|| ProtocolError::DeviceNotFound(name.to_string()))?;
        if !self.enabled {
            return Err(ProtocolError::invalid_state("pairing is disabled"));
        }

        let target = LinkTarget::from(device);
        self.supervisor.resume(name);
        if self.registry.is_connected(name) {
            debug!("{} is already connected", name);
            return Ok(());
        }

        info!("Connecting {}", name);
        self.start_link(target);
        Ok(())
    }

    async fn disconnect_device(&mut self, name: &str) -> Result<()> {
        if !self.registry.contains(name) {
            return Err(ProtocolError::DeviceNotFound(name.to_string()));
        }

        info!("Disconnecting {}", name);
        self.supervisor.suspend(name);
        self.teardown(name).await;
        self.state.link_inactive(name, Instant::now());
        Ok(())
    }

    async fn remove_device(&mut self, name: &str) -> bool {
        self.teardown(name).await;
        self.supervisor.forget(name);
        self.state.link_inactive(name, Instant::now());

        if self.registry.remove(name).is_none() {
            return false;
        }
        if self.last_connected.as_deref() == Some(name) {
            self.last_connected = None;
        }
        self.emit(PairingEvent::DeviceRemoved {
            device_name: name.to_string(),
        });
        true
    }

    async fn set_device_channel(&mut self, name: &str, channel: u16) -> Result<()> {
        let previous = self
            .registry
            .get(name)
            .map(|d| d.channel)
            .ok_or_else(|| ProtocolError::DeviceNotFound(name.to_string()))?;
        if previous == channel {
            return Ok(());
        }

        self.registry.set_channel(name, channel)?;
        self.emit(PairingEvent::ChannelChanged {
            device_name: name.to_string(),
            channel,
        });

        let linked = self.coordinator.is_established(name) || self.coordinator.is_active(name);
        if linked {
            self.teardown(name).await;
            if self.enabled && !self.supervisor.is_suspended(name) {
                if let Some(device) = self.registry.get(name) {
                    let target = LinkTarget::from(device);
                    self.start_link(target);
                }
            }
        }
        Ok(())
    }

    async fn set_enabled(&mut self, enabled: bool) {
        if self.enabled == enabled {
            return;
        }
        self.enabled = enabled;
        self.supervisor.set_enabled(enabled);

        if enabled {
            info!("Pairing enabled");
            self.reconnect_sweep();
            return;
        }

        info!("Pairing disabled, tearing down all links");
        self.state.stop(Instant::now());
        self.abort_handshake();
        for device_name in self.coordinator.teardown_all(&mut self.registry).await {
            self.emit(PairingEvent::DeviceDisconnected { device_name });
        }
    }

    async fn shutdown(&mut self) {
        info!("Shutting down pairing manager");
        self.abort_handshake();
        self.coordinator.teardown_all(&mut self.registry).await;
        self.persist();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tempfile::TempDir;

    #[derive(Debug)]
    struct NoUploader;

    #[async_trait]
    impl Uploader for NoUploader {
        async fn post(&self, _url: &str, _body: Vec<u8>) -> Result<Vec<u8>> {
            Err(ProtocolError::Timeout("offline".to_string()))
        }
    }

    #[derive(Debug)]
    struct NullTransport;

    #[async_trait]
    impl LinkTransport for NullTransport {
        async fn establish_link(&self, target: &LinkTarget) -> Result<LinkHandle> {
            Ok(LinkHandle {
                device_name: target.device_name.clone(),
                channel: target.channel,
                local_addr: None,
            })
        }

        async fn teardown_link(&self, _device_name: &str) -> Result<()> {
            Ok(())
        }
    }

    fn spawn_manager(dir: &TempDir) -> PairingHandle {
        let identity = CryptoIdentity::generate().unwrap();
        let registry = DeviceRegistry::open(dir.path()).unwrap();
        let (_activity_tx, activity_rx) = mpsc::unbounded_channel();
        let (handle, _task) = PairingManager::spawn(
            ManagerConfig::default(),
            identity,
            registry,
            Arc::new(NoUploader),
            Arc::new(NullTransport),
            activity_rx,
        );
        handle
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let dir = TempDir::new().unwrap();
        let handle = spawn_manager(&dir);
        let mut status = handle.watch_status();

        handle.start_pairing().await.unwrap();
        status
            .wait_for(|s| s.status == PairingStatus::Active)
            .await
            .unwrap();

        assert!(matches!(
            handle.start_pairing().await,
            Err(ProtocolError::Busy(PairingStatus::Active))
        ));

        assert!(handle.stop_pairing().await.unwrap());
        status
            .wait_for(|s| s.status == PairingStatus::Idle)
            .await
            .unwrap();
        assert!(!handle.stop_pairing().await.unwrap());

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_offer_ignored_when_idle() {
        let dir = TempDir::new().unwrap();
        let handle = spawn_manager(&dir);

        handle
            .submit_offer(DiscoveredOffer::new("not even json", "test"))
            .await
            .unwrap();
        // Commands are processed in order; list_paired completes after the offer
        assert!(handle.list_paired().await.unwrap().is_empty());
        assert_eq!(handle.status().status, PairingStatus::Idle);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_envelope_keeps_status() {
        let dir = TempDir::new().unwrap();
        let handle = spawn_manager(&dir);

        handle.start_pairing().await.unwrap();
        handle
            .submit_offer(DiscoveredOffer::new("{\"v\":1}", "test"))
            .await
            .unwrap();
        handle.list_paired().await.unwrap();
        assert_eq!(handle.status().status, PairingStatus::Active);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_refuses_pairing() {
        let dir = TempDir::new().unwrap();
        let handle = spawn_manager(&dir);

        handle.set_enabled(false).await.unwrap();
        assert!(matches!(
            handle.start_pairing().await,
            Err(ProtocolError::InvalidState(_))
        ));
        assert!(!handle.status().enabled);

        handle.set_enabled(true).await.unwrap();
        handle.start_pairing().await.unwrap();
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_device_commands() {
        let dir = TempDir::new().unwrap();
        let handle = spawn_manager(&dir);

        assert!(matches!(
            handle.connect_device("ghost").await,
            Err(ProtocolError::DeviceNotFound(_))
        ));
        assert!(matches!(
            handle.disconnect_device("ghost").await,
            Err(ProtocolError::DeviceNotFound(_))
        ));
        assert!(matches!(
            handle.set_device_channel("ghost", 3).await,
            Err(ProtocolError::DeviceNotFound(_))
        ));
        assert!(!handle.remove_device("ghost").await.unwrap());

        handle.shutdown().await.unwrap();
        assert!(matches!(
            handle.start_pairing().await,
            Err(ProtocolError::ManagerStopped)
        ));
    }
}
