//! MeshEngine: sole owner of all mesh state.
//!
//! Peer registry, connection table, key material, seen set, batcher,
//! pending queues and file transfers live here and nowhere else. The engine
//! is a pure state machine: transports and the relay feed it
//! [`EngineEvent`]s, it answers with declarative [`EngineAction`]s, and it
//! never awaits. One task owns it, which is what keeps every map
//! single-writer.

use crate::core::config::MeshConfig;
use crate::core::connection::{BackoffPolicy, ConnectionId, ConnectionManager, OfferDecision, SignalingState};
use crate::core::error::MeshError;
use crate::core::peer_registry::{PeerRegistry, PeerStatus, PeerView};
use crate::core::protocol::signaling::Hello;
use crate::core::protocol::{ChannelEnvelope, ChatMessage, InnerMessage, SignalBody, SignalingEnvelope};
use crate::core::router::{ChatBatcher, SeenMessageSet, flood_targets};
use crate::core::security::crypto::{self, KeyMode};
use crate::core::security::identity::{compute_identity_hash, verify_identity};
use crate::core::security::keys::{KeyExchangeOutcome, KeyMaterial};
use crate::core::store_forward::{PendingEntry, PendingQueues};
use crate::core::transfer::incoming::{ChunkOutcome, EndOutcome};
use crate::core::transfer::{AdaptiveChunker, IncomingFileView, IncomingTransfers, OutgoingFileTransfer};
use anyhow::Result;
use bytes::Bytes;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// ── Engine Inputs ────────────────────────────────────────────────────────────

/// Tags a chunk send so its delivery time can be reported back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkReceipt {
    pub file_id: String,
    pub seq: u32,
}

/// Everything that can happen to the engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Envelope received from the signaling relay.
    Signal(SignalingEnvelope),
    /// The transport produced our offer or answer.
    LocalDescription {
        peer_id: String,
        conn_id: ConnectionId,
        sdp: String,
    },
    LocalIceCandidate {
        peer_id: String,
        conn_id: ConnectionId,
        candidate: String,
    },
    ChannelOpen {
        peer_id: String,
        conn_id: ConnectionId,
    },
    ChannelClosed {
        peer_id: String,
        conn_id: ConnectionId,
    },
    TransportFailed {
        peer_id: String,
        conn_id: ConnectionId,
        reason: String,
    },
    /// A text frame arrived on the data channel.
    DataReceived {
        peer_id: String,
        conn_id: ConnectionId,
        text: String,
    },
    /// A `Send` action could not be delivered.
    SendFailed {
        peer_id: String,
        conn_id: ConnectionId,
        payload: String,
        receipt: Option<ChunkReceipt>,
    },
    /// A chunk's send buffer drained after `elapsed`.
    ChunkDelivered {
        receipt: ChunkReceipt,
        elapsed: Duration,
    },
    /// A timer from `ScheduleReconnect` fired.
    ReconnectDue { peer_id: String },
    Tick,
}

// ── Engine Actions ───────────────────────────────────────────────────────────

/// Side effects the node must carry out. The engine never performs I/O on a
/// transport or the relay itself.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineAction {
    /// Put an envelope on the relay.
    Signal(SignalingEnvelope),
    /// Create a peer connection with our data channel and produce an offer.
    CreateOffer {
        peer_id: String,
        conn_id: ConnectionId,
    },
    /// Create a peer connection from a remote offer and produce an answer.
    AcceptOffer {
        peer_id: String,
        conn_id: ConnectionId,
        sdp: String,
    },
    ApplyAnswer {
        peer_id: String,
        conn_id: ConnectionId,
        sdp: String,
    },
    AddIceCandidate {
        peer_id: String,
        conn_id: ConnectionId,
        candidate: String,
    },
    /// Write one text frame to the data channel.
    Send {
        peer_id: String,
        conn_id: ConnectionId,
        payload: String,
        receipt: Option<ChunkReceipt>,
    },
    Close {
        peer_id: String,
        conn_id: ConnectionId,
    },
    /// Feed `ReconnectDue` back after `delay`.
    ScheduleReconnect { peer_id: String, delay: Duration },
}

// ── Engine Outcome ───────────────────────────────────────────────────────────

/// Result of any engine operation.
#[derive(Debug, Default)]
pub struct EngineOutcome {
    /// Actions the caller must execute, in order.
    pub actions: Vec<EngineAction>,
    /// Optional one-line status for the operator.
    pub status: Option<String>,
}

impl EngineOutcome {
    fn with_actions(actions: Vec<EngineAction>) -> Self {
        Self {
            actions,
            status: None,
        }
    }
}

// ── Observer Events ──────────────────────────────────────────────────────────

/// Pushed to the application as state changes.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    PeersChanged,
    MessageReceived(ChatMessage),
    FileProgress {
        file_id: String,
        received: u64,
        size: u64,
    },
    FileCompleted {
        file_id: String,
        name: String,
        size: u64,
        mime: String,
        from: String,
    },
    FileSent {
        file_id: String,
        name: String,
    },
    IdentityRejected {
        peer_id: String,
    },
}

fn notify_app(app_tx: &Option<mpsc::UnboundedSender<MeshEvent>>, event: MeshEvent) {
    if let Some(tx) = app_tx {
        let _ = tx.send(event);
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

/// A file being sent, with the peers it was addressed to when it started.
struct ActiveSend {
    transfer: OutgoingFileTransfer,
    targets: Vec<String>,
}

pub struct MeshEngine {
    local_id: String,
    username: String,
    config: MeshConfig,
    key_mode: KeyMode,
    registry: PeerRegistry,
    connections: ConnectionManager,
    keys: HashMap<String, KeyMaterial>,
    seen: SeenMessageSet,
    batcher: ChatBatcher,
    pending: PendingQueues,
    incoming: IncomingTransfers,
    outgoing: Vec<ActiveSend>,
    messages: Vec<ChatMessage>,
    selected_peer: Option<String>,
    last_hello: Option<Instant>,
    app_tx: Option<mpsc::UnboundedSender<MeshEvent>>,
}

impl MeshEngine {
    pub fn new(
        local_id: impl Into<String>,
        username: impl Into<String>,
        config: MeshConfig,
        pending: PendingQueues,
        app_tx: Option<mpsc::UnboundedSender<MeshEvent>>,
    ) -> Self {
        let key_mode = if config.fixed_test_key {
            warn!(
                event = "fixed_test_key_enabled",
                "TEST ONLY: every channel uses a fixed, publicly known key"
            );
            KeyMode::FixedTestKey
        } else {
            KeyMode::Derived
        };
        Self {
            local_id: local_id.into(),
            username: username.into(),
            key_mode,
            registry: PeerRegistry::new(),
            connections: ConnectionManager::new(BackoffPolicy::from(&config)),
            keys: HashMap::new(),
            seen: SeenMessageSet::new(config.seen_horizon, config.seen_max_entries),
            batcher: ChatBatcher::new(config.batch_window, config.batch_max_messages),
            pending,
            incoming: IncomingTransfers::new(
                config.max_file_size,
                config.completed_file_grace,
                config.incoming_stale_after,
            ),
            outgoing: Vec::new(),
            messages: Vec::new(),
            selected_peer: None,
            last_hello: None,
            app_tx,
            config,
        }
    }

    // ── Read model ───────────────────────────────────────────────────────

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn key_mode(&self) -> KeyMode {
        self.key_mode
    }

    /// Largest file [`Self::send_file`] accepts.
    pub fn max_file_size(&self) -> u64 {
        self.config.max_file_size
    }

    /// Every known peer with its current status.
    pub fn peers(&self, now: Instant) -> Vec<PeerView> {
        self.registry
            .records()
            .map(|r| {
                let status = if !r.online {
                    PeerStatus::Offline
                } else {
                    self.connections
                        .status(&r.peer_id, now)
                        .unwrap_or(PeerStatus::Discovered)
                };
                PeerView {
                    peer_id: r.peer_id.clone(),
                    username: r.username.clone(),
                    status,
                }
            })
            .collect()
    }

    /// Chat log in arrival order, own messages included.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn incoming_files(&self) -> Vec<IncomingFileView> {
        self.incoming.views()
    }

    pub fn take_file(&mut self, file_id: &str) -> Option<Bytes> {
        self.incoming.take(file_id)
    }

    pub fn selected_peer(&self) -> Option<&str> {
        self.selected_peer.as_deref()
    }

    pub fn pending_len(&self, peer_id: &str) -> usize {
        self.pending.len(peer_id)
    }

    pub fn is_secure(&self, peer_id: &str) -> bool {
        self.connections.is_secure(peer_id)
    }

    pub fn outgoing_len(&self) -> usize {
        self.outgoing.len()
    }

    // ── Commands ─────────────────────────────────────────────────────────

    /// Broadcast a HELLO on the relay.
    pub fn announce(&mut self, now: Instant) -> EngineOutcome {
        let mut actions = Vec::new();
        self.push_hello(now, &mut actions);
        EngineOutcome::with_actions(actions)
    }

    /// Originate a chat message and flood it to every online peer.
    pub fn send_chat(&mut self, text: &str, now: Instant) -> Result<EngineOutcome, MeshError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(MeshError::EmptyMessage);
        }
        let chat = ChatMessage {
            id: Uuid::new_v4().to_string(),
            from: self.local_id.clone(),
            time: chrono::Utc::now().timestamp_millis(),
            text: text.to_string(),
        };
        self.seen.insert(&chat.id, now);
        self.messages.push(chat.clone());
        notify_app(&self.app_tx, MeshEvent::MessageReceived(chat.clone()));

        let mut actions = Vec::new();
        let targets = flood_targets(&self.registry.online_peers(), &self.local_id, None, None);
        for peer in &targets {
            self.queue_chat(peer, InnerMessage::Chat(chat.clone()), now, &mut actions);
        }
        debug!(event = "chat_originated", id = %chat.id, targets = targets.len(), "Chat message queued for flood");
        Ok(EngineOutcome::with_actions(actions))
    }

    /// Start flooding a file. Rejected up front when over the size limit.
    pub fn send_file(
        &mut self,
        data: Bytes,
        name: &str,
        mime: &str,
        now: Instant,
    ) -> Result<EngineOutcome, MeshError> {
        let size = data.len() as u64;
        if size > self.config.max_file_size {
            return Err(MeshError::FileTooLarge {
                size,
                limit: self.config.max_file_size,
            });
        }
        let file_id = Uuid::new_v4().to_string();
        let meta = InnerMessage::FileMeta {
            file_id: file_id.clone(),
            name: name.to_string(),
            size,
            mime: mime.to_string(),
            origin: self.local_id.clone(),
        };
        self.mark_seen(&meta, now);

        let mut actions = Vec::new();
        let targets = flood_targets(&self.registry.online_peers(), &self.local_id, None, None);
        for peer in &targets {
            self.send_inner(peer, meta.clone(), None, &mut actions);
        }
        info!(event = "file_send_started", file_id = %file_id, name = %name, size, targets = targets.len(), "Sending file");

        self.outgoing.push(ActiveSend {
            transfer: OutgoingFileTransfer::new(
                file_id.clone(),
                name.to_string(),
                mime.to_string(),
                data,
                AdaptiveChunker::new(&self.config),
            ),
            targets,
        });
        self.pump_transfers(now, &mut actions);
        Ok(EngineOutcome {
            actions,
            status: Some(format!("Sending {name} ({size} bytes) as {file_id}")),
        })
    }

    /// Change our display name and re-announce it everywhere.
    pub fn set_username(&mut self, name: &str, now: Instant) -> Result<EngineOutcome, MeshError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(MeshError::EmptyUsername);
        }
        self.username = name.to_string();
        let mut actions = Vec::new();
        for peer in self.connections.open_peers() {
            self.send_clear(&peer, self.identity_envelope(), &mut actions);
        }
        self.push_hello(now, &mut actions);
        Ok(EngineOutcome::with_actions(actions))
    }

    /// UI-local selection; no network effect.
    pub fn select_peer(&mut self, peer_id: &str) -> Result<(), MeshError> {
        if !self.registry.contains(peer_id) {
            return Err(MeshError::UnknownPeer(peer_id.to_string()));
        }
        self.selected_peer = Some(peer_id.to_string());
        Ok(())
    }

    // ── Event dispatch ───────────────────────────────────────────────────

    pub fn handle(&mut self, event: EngineEvent, now: Instant) -> EngineOutcome {
        let mut actions = Vec::new();
        match event {
            EngineEvent::Signal(envelope) => self.on_signal(envelope, now, &mut actions),
            EngineEvent::LocalDescription {
                peer_id,
                conn_id,
                sdp,
            } => self.on_local_description(&peer_id, conn_id, sdp, &mut actions),
            EngineEvent::LocalIceCandidate {
                peer_id,
                conn_id,
                candidate,
            } => {
                if let Some(candidate) = self.connections.on_local_ice(&peer_id, conn_id, candidate) {
                    actions.push(EngineAction::Signal(SignalingEnvelope::direct(
                        &self.local_id,
                        &peer_id,
                        SignalBody::Ice(candidate),
                    )));
                }
            }
            EngineEvent::ChannelOpen { peer_id, conn_id } => {
                self.on_channel_open(&peer_id, conn_id, now, &mut actions)
            }
            EngineEvent::ChannelClosed { peer_id, conn_id } => {
                self.on_channel_lost(&peer_id, conn_id, "channel closed", now, &mut actions)
            }
            EngineEvent::TransportFailed {
                peer_id,
                conn_id,
                reason,
            } => self.on_channel_lost(&peer_id, conn_id, &reason, now, &mut actions),
            EngineEvent::DataReceived {
                peer_id,
                conn_id,
                text,
            } => self.on_data(&peer_id, conn_id, &text, now, &mut actions),
            EngineEvent::SendFailed {
                peer_id,
                conn_id,
                payload,
                receipt,
            } => self.on_send_failed(&peer_id, conn_id, payload, receipt, now, &mut actions),
            EngineEvent::ChunkDelivered { receipt, elapsed } => {
                let released = self
                    .outgoing
                    .iter_mut()
                    .find(|s| s.transfer.file_id == receipt.file_id)
                    .is_some_and(|s| s.transfer.on_delivered(receipt.seq, elapsed));
                if released {
                    self.pump_transfers(now, &mut actions);
                }
            }
            EngineEvent::ReconnectDue { peer_id } => {
                if self.registry.is_online(&peer_id) && self.connections.on_reconnect_due(&peer_id, now) {
                    info!(event = "reconnect_attempt", peer = %peer_id, failures = self.connections.failures(&peer_id), "Reconnecting");
                    self.begin_handshake(&peer_id, now, &mut actions);
                }
            }
            EngineEvent::Tick => self.on_tick(now, &mut actions),
        }
        EngineOutcome::with_actions(actions)
    }

    // ── Signaling ────────────────────────────────────────────────────────

    fn on_signal(&mut self, envelope: SignalingEnvelope, now: Instant, actions: &mut Vec<EngineAction>) {
        if !envelope.is_for(&self.local_id) {
            return;
        }
        let from = envelope.from;
        match envelope.body {
            SignalBody::Hello(hello) => {
                let mut changed = self.registry.touch(&from, now);
                if let Some(name) = hello.username.as_deref() {
                    changed |= self.registry.hint_username(&from, name);
                }
                if changed {
                    notify_app(&self.app_tx, MeshEvent::PeersChanged);
                }
                self.on_peer_discovered(&from, now, actions);
            }
            SignalBody::Offer(sdp) => {
                if self.registry.touch(&from, now) {
                    notify_app(&self.app_tx, MeshEvent::PeersChanged);
                }
                match self.connections.on_remote_offer(&from, &self.local_id, now) {
                    OfferDecision::Accept { conn_id, replaced } => {
                        if let Some(old) = replaced {
                            actions.push(EngineAction::Close {
                                peer_id: from.clone(),
                                conn_id: old,
                            });
                        }
                        self.keys.entry(from.clone()).or_insert_with(|| KeyMaterial::new(&from));
                        info!(event = "offer_accepted", peer = %from, conn = %conn_id, "Answering remote offer");
                        actions.push(EngineAction::AcceptOffer {
                            peer_id: from,
                            conn_id,
                            sdp,
                        });
                    }
                    OfferDecision::Ignore => {}
                }
            }
            SignalBody::Answer(sdp) => match self.connections.on_remote_answer(&from) {
                Some(conn_id) => actions.push(EngineAction::ApplyAnswer {
                    peer_id: from,
                    conn_id,
                    sdp,
                }),
                None => debug!(event = "answer_out_of_state", peer = %from, "Dropping unexpected ANSWER"),
            },
            SignalBody::Ice(candidate) => match self.connections.on_remote_ice(&from) {
                Some(conn_id) => actions.push(EngineAction::AddIceCandidate {
                    peer_id: from,
                    conn_id,
                    candidate,
                }),
                None => debug!(event = "ice_out_of_state", peer = %from, "Dropping ICE before remote description"),
            },
        }
    }

    fn on_peer_discovered(&mut self, peer_id: &str, now: Instant, actions: &mut Vec<EngineAction>) {
        if self.connections.can_initiate(peer_id, now) {
            self.begin_handshake(peer_id, now, actions);
        }
    }

    fn begin_handshake(&mut self, peer_id: &str, now: Instant, actions: &mut Vec<EngineAction>) {
        self.keys
            .entry(peer_id.to_string())
            .or_insert_with(|| KeyMaterial::new(peer_id));
        let conn_id = self.connections.begin_offer(peer_id, now);
        debug!(event = "handshake_started", peer = %peer_id, conn = %conn_id, "Creating offer");
        actions.push(EngineAction::CreateOffer {
            peer_id: peer_id.to_string(),
            conn_id,
        });
    }

    fn on_local_description(
        &mut self,
        peer_id: &str,
        conn_id: ConnectionId,
        sdp: String,
        actions: &mut Vec<EngineAction>,
    ) {
        let Some((state, held_ice)) = self.connections.on_local_description(peer_id, conn_id) else {
            debug!(event = "local_description_stale", peer = %peer_id, conn = %conn_id, "Connection replaced, dropping description");
            return;
        };
        let body = match state {
            SignalingState::Offering => SignalBody::Offer(sdp),
            SignalingState::Answering => SignalBody::Answer(sdp),
            SignalingState::ChannelOpen => return,
        };
        actions.push(EngineAction::Signal(SignalingEnvelope::direct(&self.local_id, peer_id, body)));
        for candidate in held_ice {
            actions.push(EngineAction::Signal(SignalingEnvelope::direct(
                &self.local_id,
                peer_id,
                SignalBody::Ice(candidate),
            )));
        }
    }

    fn push_hello(&mut self, now: Instant, actions: &mut Vec<EngineAction>) {
        self.last_hello = Some(now);
        actions.push(EngineAction::Signal(SignalingEnvelope::broadcast(
            &self.local_id,
            SignalBody::Hello(Hello {
                username: Some(self.username.clone()),
            }),
        )));
    }

    // ── Channel lifecycle ────────────────────────────────────────────────

    fn on_channel_open(&mut self, peer_id: &str, conn_id: ConnectionId, now: Instant, actions: &mut Vec<EngineAction>) {
        if !self.connections.on_channel_open(peer_id, conn_id) {
            debug!(event = "channel_open_stale", peer = %peer_id, conn = %conn_id, "Open for a replaced connection");
            return;
        }
        info!(event = "channel_open", peer = %peer_id, conn = %conn_id, "Data channel open");
        self.registry.touch(peer_id, now);
        notify_app(&self.app_tx, MeshEvent::PeersChanged);

        let public_key = self
            .keys
            .entry(peer_id.to_string())
            .or_insert_with(|| KeyMaterial::new(peer_id))
            .local_public_b64();
        self.send_clear(peer_id, self.identity_envelope(), actions);
        self.send_clear(peer_id, ChannelEnvelope::KeyExchange { public_key }, actions);
        self.send_clear(peer_id, ChannelEnvelope::SyncRequest, actions);

        // The remote key may have been read before our open event fired.
        if self.connections.is_secure(peer_id) {
            self.flush_pending(peer_id, actions);
            self.persist_pending();
        }
    }

    fn on_channel_lost(
        &mut self,
        peer_id: &str,
        conn_id: ConnectionId,
        reason: &str,
        now: Instant,
        actions: &mut Vec<EngineAction>,
    ) {
        let Some(delay) = self.connections.on_channel_closed(peer_id, conn_id, now) else {
            return;
        };
        actions.push(EngineAction::Close {
            peer_id: peer_id.to_string(),
            conn_id,
        });
        notify_app(&self.app_tx, MeshEvent::PeersChanged);
        match delay {
            Some(delay) => {
                info!(
                    event = "reconnect_scheduled",
                    peer = %peer_id,
                    reason = %reason,
                    delay_ms = delay.as_millis() as u64,
                    "Connection lost, retrying after backoff"
                );
                actions.push(EngineAction::ScheduleReconnect {
                    peer_id: peer_id.to_string(),
                    delay,
                });
            }
            None => warn!(
                event = "reconnect_suspended",
                peer = %peer_id,
                reason = %reason,
                "Too many failed attempts, waiting for rediscovery"
            ),
        }
    }

    // ── Data channel ─────────────────────────────────────────────────────

    fn on_data(&mut self, peer_id: &str, conn_id: ConnectionId, text: &str, now: Instant, actions: &mut Vec<EngineAction>) {
        if !self.connections.matches(peer_id, conn_id) {
            debug!(event = "data_stale_connection", peer = %peer_id, conn = %conn_id, "Data from a replaced connection");
            return;
        }
        if self.registry.touch(peer_id, now) {
            notify_app(&self.app_tx, MeshEvent::PeersChanged);
        }
        match ChannelEnvelope::from_json(text) {
            Ok(envelope) => self.on_envelope(peer_id, envelope, false, now, actions),
            Err(e) => warn!(event = "envelope_desync", peer = %peer_id, error = %e, "Unparseable data-channel envelope"),
        }
    }

    fn on_envelope(
        &mut self,
        peer_id: &str,
        envelope: ChannelEnvelope,
        in_batch: bool,
        now: Instant,
        actions: &mut Vec<EngineAction>,
    ) {
        match envelope {
            ChannelEnvelope::Identity {
                peer_id: claimed,
                username,
                hash,
            } => {
                if claimed == peer_id && verify_identity(&claimed, &username, &hash) {
                    if self.registry.set_verified_username(peer_id, &username) {
                        notify_app(&self.app_tx, MeshEvent::PeersChanged);
                    }
                } else {
                    warn!(
                        event = "identity_mismatch",
                        peer = %peer_id,
                        claimed = %claimed,
                        "Identity hash does not match, username not trusted"
                    );
                    self.registry.reject_identity(peer_id);
                    notify_app(
                        &self.app_tx,
                        MeshEvent::IdentityRejected {
                            peer_id: peer_id.to_string(),
                        },
                    );
                    notify_app(&self.app_tx, MeshEvent::PeersChanged);
                }
            }
            ChannelEnvelope::KeyExchange { public_key } => {
                let key_mode = self.key_mode;
                let outcome = self
                    .keys
                    .entry(peer_id.to_string())
                    .or_insert_with(|| KeyMaterial::new(peer_id))
                    .complete(&public_key, &self.local_id, key_mode);
                match outcome {
                    KeyExchangeOutcome::Invalid => {
                        warn!(event = "key_exchange_invalid", peer = %peer_id, "Malformed public key");
                        return;
                    }
                    KeyExchangeOutcome::Established => {
                        info!(event = "key_established", peer = %peer_id, "Secure channel established")
                    }
                    KeyExchangeOutcome::Rekeyed => {
                        info!(event = "key_rekeyed", peer = %peer_id, "Peer presented a new key, re-derived")
                    }
                    KeyExchangeOutcome::Unchanged => {}
                }
                if self.connections.mark_secure(peer_id) {
                    self.flush_pending(peer_id, actions);
                    self.persist_pending();
                }
            }
            ChannelEnvelope::SyncRequest => {
                if self.connections.is_secure(peer_id) {
                    self.flush_pending(peer_id, actions);
                    self.persist_pending();
                } else {
                    debug!(event = "sync_before_key", peer = %peer_id, "Sync request deferred until key exchange");
                }
            }
            ChannelEnvelope::Encrypted { from: _, iv, data } => {
                let Some(key) = self.keys.get(peer_id).and_then(KeyMaterial::shared_key) else {
                    debug!(event = "encrypted_before_key", peer = %peer_id, "No shared key yet, dropping");
                    return;
                };
                let plain = match crypto::decrypt(key, &iv, &data) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(event = "decrypt_failure", peer = %peer_id, error = %e, "Discarding undecryptable message");
                        return;
                    }
                };
                match serde_json::from_slice::<InnerMessage>(&plain) {
                    Ok(inner) => self.on_inner(peer_id, inner, false, now, actions),
                    Err(e) => warn!(event = "inner_desync", peer = %peer_id, error = %e, "Unparseable inner message"),
                }
            }
            ChannelEnvelope::MessageBatch { messages } => {
                if in_batch {
                    warn!(event = "nested_batch", peer = %peer_id, "Nested MESSAGE_BATCH dropped");
                    return;
                }
                for envelope in messages {
                    self.on_envelope(peer_id, envelope, true, now, actions);
                }
            }
        }
    }

    fn on_inner(
        &mut self,
        last_hop: &str,
        inner: InnerMessage,
        in_batch: bool,
        now: Instant,
        actions: &mut Vec<EngineAction>,
    ) {
        if let InnerMessage::MessageBatch { messages } = inner {
            if in_batch {
                warn!(event = "nested_batch", peer = %last_hop, "Nested inner MESSAGE_BATCH dropped");
                return;
            }
            for message in messages {
                self.on_inner(last_hop, message, true, now, actions);
            }
            return;
        }

        let Some(id) = inner.dedup_id() else { return };
        if !self.seen.insert(&id, now) {
            debug!(event = "duplicate_dropped", id = %id, peer = %last_hop, "Already seen");
            return;
        }
        let origin = inner.origin().unwrap_or(last_hop).to_string();
        if origin == self.local_id {
            return;
        }

        match &inner {
            InnerMessage::Chat(chat) => {
                self.messages.push(chat.clone());
                notify_app(&self.app_tx, MeshEvent::MessageReceived(chat.clone()));
            }
            InnerMessage::FileMeta {
                file_id,
                name,
                size,
                mime,
                origin,
            } => {
                self.incoming.on_meta(file_id, name, *size, mime, origin, now);
            }
            InnerMessage::FileChunk { file_id, seq, data, .. } => {
                if let ChunkOutcome::Accepted { received, size } =
                    self.incoming.on_chunk(file_id, *seq, data.clone(), now)
                {
                    notify_app(
                        &self.app_tx,
                        MeshEvent::FileProgress {
                            file_id: file_id.clone(),
                            received,
                            size,
                        },
                    );
                }
            }
            InnerMessage::FileEnd { file_id, chunks, .. } => {
                if let EndOutcome::Completed { size } = self.incoming.on_end(file_id, *chunks, now)
                    && let Some(t) = self.incoming.get(file_id)
                {
                    notify_app(
                        &self.app_tx,
                        MeshEvent::FileCompleted {
                            file_id: file_id.clone(),
                            name: t.name.clone(),
                            size,
                            mime: t.mime.clone(),
                            from: t.origin.clone(),
                        },
                    );
                }
            }
            InnerMessage::MessageBatch { .. } => {}
        }

        let targets = flood_targets(
            &self.registry.online_peers(),
            &self.local_id,
            Some(last_hop),
            Some(origin.as_str()),
        );
        for peer in targets {
            match &inner {
                InnerMessage::Chat(_) => self.queue_chat(&peer, inner.clone(), now, actions),
                _ => {
                    self.send_inner(&peer, inner.clone(), None, actions);
                }
            }
        }
    }

    fn on_send_failed(
        &mut self,
        peer_id: &str,
        conn_id: ConnectionId,
        payload: String,
        receipt: Option<ChunkReceipt>,
        now: Instant,
        actions: &mut Vec<EngineAction>,
    ) {
        match ChannelEnvelope::from_json(&payload) {
            Ok(ChannelEnvelope::Encrypted { .. }) => {
                debug!(event = "send_failed_queued", peer = %peer_id, conn = %conn_id, "Queued undelivered ciphertext");
                self.pending.enqueue(peer_id, PendingEntry::Sealed { payload });
            }
            _ => debug!(event = "send_failed_dropped", peer = %peer_id, conn = %conn_id, "Dropped undelivered handshake frame"),
        }
        if let Some(receipt) = receipt {
            let released = self
                .outgoing
                .iter_mut()
                .find(|s| s.transfer.file_id == receipt.file_id)
                .is_some_and(|s| s.transfer.release(receipt.seq));
            if released {
                self.pump_transfers(now, actions);
            }
        }
    }

    // ── Sending ──────────────────────────────────────────────────────────

    fn identity_envelope(&self) -> ChannelEnvelope {
        ChannelEnvelope::Identity {
            peer_id: self.local_id.clone(),
            username: self.username.clone(),
            hash: compute_identity_hash(&self.local_id, &self.username),
        }
    }

    /// Handshake frames go out unencrypted on an open channel.
    fn send_clear(&self, peer_id: &str, envelope: ChannelEnvelope, actions: &mut Vec<EngineAction>) {
        let Some(conn_id) = self.connections.conn_id(peer_id) else {
            return;
        };
        match envelope.to_json() {
            Ok(payload) => actions.push(EngineAction::Send {
                peer_id: peer_id.to_string(),
                conn_id,
                payload,
                receipt: None,
            }),
            Err(e) => error!(event = "envelope_encode_failure", peer = %peer_id, error = %e, "Could not encode envelope"),
        }
    }

    fn seal(&self, peer_id: &str, inner: &InnerMessage) -> Result<String> {
        let key = self
            .keys
            .get(peer_id)
            .and_then(KeyMaterial::shared_key)
            .ok_or_else(|| anyhow::anyhow!("no shared key for {peer_id}"))?;
        let plain = serde_json::to_vec(inner)?;
        let sealed = crypto::encrypt(key, &plain)?;
        let envelope = ChannelEnvelope::Encrypted {
            from: self.local_id.clone(),
            iv: sealed.iv.to_vec(),
            data: sealed.ciphertext,
        };
        Ok(envelope.to_json()?)
    }

    /// Encrypt and send over a secure channel, otherwise queue. Returns
    /// whether a frame actually went to the transport.
    fn send_inner(
        &mut self,
        peer_id: &str,
        inner: InnerMessage,
        receipt: Option<ChunkReceipt>,
        actions: &mut Vec<EngineAction>,
    ) -> bool {
        if let Some(conn_id) = self.connections.conn_id(peer_id).filter(|_| self.connections.is_secure(peer_id)) {
            match self.seal(peer_id, &inner) {
                Ok(payload) => {
                    actions.push(EngineAction::Send {
                        peer_id: peer_id.to_string(),
                        conn_id,
                        payload,
                        receipt,
                    });
                    return true;
                }
                Err(e) => warn!(event = "encrypt_failure", peer = %peer_id, error = %e, "Encryption failed, queueing"),
            }
        }
        self.pending.enqueue(peer_id, PendingEntry::Plain { message: inner });
        false
    }

    fn queue_chat(&mut self, peer_id: &str, inner: InnerMessage, now: Instant, actions: &mut Vec<EngineAction>) {
        if let Some(batch) = self.batcher.push(peer_id, inner, now) {
            self.send_batch(peer_id, batch, actions);
        }
    }

    fn send_batch(&mut self, peer_id: &str, mut messages: Vec<InnerMessage>, actions: &mut Vec<EngineAction>) {
        if !self.connections.is_secure(peer_id) {
            for message in messages {
                self.pending.enqueue(peer_id, PendingEntry::Plain { message });
            }
            return;
        }
        let inner = if messages.len() == 1 {
            messages.remove(0)
        } else {
            InnerMessage::MessageBatch { messages }
        };
        self.send_inner(peer_id, inner, None, actions);
    }

    /// Replay everything queued for `peer_id` in original order.
    fn flush_pending(&mut self, peer_id: &str, actions: &mut Vec<EngineAction>) {
        let Some(conn_id) = self.connections.conn_id(peer_id) else {
            return;
        };
        let entries = self.pending.take(peer_id);
        if entries.is_empty() {
            return;
        }
        info!(event = "pending_flush", peer = %peer_id, entries = entries.len(), "Flushing store-and-forward queue");
        for entry in entries {
            let payload = match entry {
                PendingEntry::Sealed { payload } => payload,
                PendingEntry::Plain { message } => match self.seal(peer_id, &message) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(event = "encrypt_failure", peer = %peer_id, error = %e, "Requeueing entry");
                        self.pending.enqueue(peer_id, PendingEntry::Plain { message });
                        continue;
                    }
                },
            };
            actions.push(EngineAction::Send {
                peer_id: peer_id.to_string(),
                conn_id,
                payload,
                receipt: None,
            });
        }
    }

    /// Move chat still held by the batcher into the pending queues and write
    /// them out. Called once before the node exits.
    pub fn shutdown(&mut self) {
        for (peer, messages) in self.batcher.drain() {
            for message in messages {
                self.pending.enqueue(&peer, PendingEntry::Plain { message });
            }
        }
        self.persist_pending();
    }

    fn persist_pending(&mut self) {
        if let Err(e) = self.pending.save_if_dirty() {
            error!(event = "pending_save_failure", error = %e, "Could not persist pending queue");
        }
    }

    fn mark_seen(&mut self, inner: &InnerMessage, now: Instant) {
        if let Some(id) = inner.dedup_id() {
            self.seen.insert(&id, now);
        }
    }

    // ── File transfer ────────────────────────────────────────────────────

    /// Release chunks for every active send until each is waiting on a
    /// receipt or done.
    fn pump_transfers(&mut self, now: Instant, actions: &mut Vec<EngineAction>) {
        let mut sends = std::mem::take(&mut self.outgoing);
        for send in &mut sends {
            while let Some((seq, chunk)) = send.transfer.next_chunk(now) {
                let inner = InnerMessage::FileChunk {
                    file_id: send.transfer.file_id.clone(),
                    seq,
                    data: chunk.to_vec(),
                    origin: self.local_id.clone(),
                };
                self.mark_seen(&inner, now);
                let receipt = ChunkReceipt {
                    file_id: send.transfer.file_id.clone(),
                    seq,
                };
                let mut live = false;
                for peer in &send.targets {
                    live |= self.send_inner(peer, inner.clone(), Some(receipt.clone()), actions);
                }
                if live {
                    break;
                }
                send.transfer.release(seq);
            }
        }

        sends.retain(|send| {
            if !send.transfer.is_finished() {
                return true;
            }
            let end = InnerMessage::FileEnd {
                file_id: send.transfer.file_id.clone(),
                chunks: send.transfer.chunks_sent(),
                origin: self.local_id.clone(),
            };
            if let Some(id) = end.dedup_id() {
                self.seen.insert(&id, now);
            }
            for peer in &send.targets {
                self.send_inner(peer, end.clone(), None, actions);
            }
            info!(
                event = "file_send_completed",
                file_id = %send.transfer.file_id,
                bytes = send.transfer.bytes_sent(),
                size = send.transfer.total_bytes(),
                chunks = send.transfer.chunks_sent(),
                "File sent"
            );
            notify_app(
                &self.app_tx,
                MeshEvent::FileSent {
                    file_id: send.transfer.file_id.clone(),
                    name: send.transfer.name.clone(),
                },
            );
            false
        });
        sends.append(&mut self.outgoing);
        self.outgoing = sends;
    }

    // ── Periodic work ────────────────────────────────────────────────────

    fn on_tick(&mut self, now: Instant, actions: &mut Vec<EngineAction>) {
        if self
            .last_hello
            .is_none_or(|at| now.saturating_duration_since(at) >= self.config.hello_interval)
        {
            self.push_hello(now, actions);
        }

        self.sweep_liveness(now, actions);

        for (peer, conn_id) in self.connections.expired_handshakes(now, self.config.handshake_timeout) {
            warn!(event = "handshake_timeout", peer = %peer, conn = %conn_id, "Handshake did not complete");
            self.on_channel_lost(&peer, conn_id, "handshake timeout", now, actions);
        }

        for (peer, batch) in self.batcher.due(now) {
            self.send_batch(&peer, batch, actions);
        }

        let timeout = self.config.chunk_receipt_timeout;
        let mut overdue = false;
        for send in &mut self.outgoing {
            if send.transfer.check_timeout(now, timeout) {
                warn!(event = "chunk_receipt_timeout", file_id = %send.transfer.file_id, "No delivery receipt, continuing");
                overdue = true;
            }
        }
        if overdue {
            self.pump_transfers(now, actions);
        }

        self.incoming.gc(now);
        self.seen.trim(now);
        self.persist_pending();
    }

    /// Stale peers go offline. An open channel keeps its peer alive; a
    /// handshake still in progress with a stale peer is abandoned.
    fn sweep_liveness(&mut self, now: Instant, actions: &mut Vec<EngineAction>) {
        let mut changed = false;
        for peer in self.registry.stale(now, self.config.liveness_timeout) {
            if self.connections.is_open(&peer) {
                continue;
            }
            changed |= self.registry.mark_offline(&peer);
            if let Some(conn_id) = self.connections.close(&peer) {
                debug!(event = "handshake_abandoned", peer = %peer, conn = %conn_id, "Peer went quiet mid-handshake");
                actions.push(EngineAction::Close { peer_id: peer, conn_id });
            }
        }
        if changed {
            notify_app(&self.app_tx, MeshEvent::PeersChanged);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeSet, VecDeque};

    // ── Harness ──────────────────────────────────────────────────────────

    /// In-process mesh: a relay that delivers every envelope, and a
    /// transport whose links only come up between allowed pairs.
    struct Mesh {
        engines: HashMap<String, MeshEngine>,
        observers: HashMap<String, mpsc::UnboundedReceiver<MeshEvent>>,
        allowed: BTreeSet<(String, String)>,
        /// `(local, remote) -> conn id` of the local side's link.
        links: HashMap<(String, String), ConnectionId>,
        open: BTreeSet<(String, String)>,
        queue: VecDeque<(String, EngineEvent)>,
        sends: Vec<(String, String, String)>,
        reconnects: Vec<(String, String, Duration)>,
        /// Senders whose next OFFER never reaches the relay.
        lose_offer: BTreeSet<String>,
        /// Engines whose `ChannelOpen` is held in `held_opens` until released.
        late_open: BTreeSet<String>,
        held_opens: Vec<(String, EngineEvent)>,
        now: Instant,
    }

    fn pair(a: &str, b: &str) -> (String, String) {
        if a < b { (a.into(), b.into()) } else { (b.into(), a.into()) }
    }

    impl Mesh {
        fn new(ids: &[&str], config: MeshConfig) -> Self {
            let mut engines = HashMap::new();
            let mut observers = HashMap::new();
            for id in ids {
                let (tx, rx) = mpsc::unbounded_channel();
                engines.insert(
                    id.to_string(),
                    MeshEngine::new(*id, format!("user-{id}"), config.clone(), PendingQueues::in_memory(), Some(tx)),
                );
                observers.insert(id.to_string(), rx);
            }
            Self {
                engines,
                observers,
                allowed: BTreeSet::new(),
                links: HashMap::new(),
                open: BTreeSet::new(),
                queue: VecDeque::new(),
                sends: Vec::new(),
                reconnects: Vec::new(),
                lose_offer: BTreeSet::new(),
                late_open: BTreeSet::new(),
                held_opens: Vec::new(),
                now: Instant::now(),
            }
        }

        fn allow(&mut self, a: &str, b: &str) {
            self.allowed.insert(pair(a, b));
        }

        fn engine(&mut self, id: &str) -> &mut MeshEngine {
            self.engines.get_mut(id).unwrap()
        }

        fn events(&mut self, id: &str) -> Vec<MeshEvent> {
            let rx = self.observers.get_mut(id).unwrap();
            let mut out = Vec::new();
            while let Ok(ev) = rx.try_recv() {
                out.push(ev);
            }
            out
        }

        fn apply(&mut self, from: &str, outcome: EngineOutcome) {
            for action in outcome.actions {
                self.execute(from, action);
            }
        }

        fn execute(&mut self, from: &str, action: EngineAction) {
            match action {
                EngineAction::Signal(env) => {
                    if matches!(env.body, SignalBody::Offer(_)) && self.lose_offer.remove(from) {
                        return;
                    }
                    let targets: Vec<String> = match &env.to {
                        Some(to) => vec![to.clone()],
                        None => self.engines.keys().filter(|k| *k != from).cloned().collect(),
                    };
                    for t in targets {
                        self.queue.push_back((t, EngineEvent::Signal(env.clone())));
                    }
                }
                EngineAction::CreateOffer { peer_id, conn_id } => {
                    self.links.insert((from.into(), peer_id.clone()), conn_id);
                    self.queue.push_back((
                        from.into(),
                        EngineEvent::LocalDescription {
                            peer_id,
                            conn_id,
                            sdp: format!("offer:{from}"),
                        },
                    ));
                }
                EngineAction::AcceptOffer { peer_id, conn_id, .. } => {
                    self.links.insert((from.into(), peer_id.clone()), conn_id);
                    self.queue.push_back((
                        from.into(),
                        EngineEvent::LocalDescription {
                            peer_id,
                            conn_id,
                            sdp: format!("answer:{from}"),
                        },
                    ));
                }
                EngineAction::ApplyAnswer { peer_id, conn_id, .. } => {
                    let remote_conn = self.links[&(peer_id.clone(), from.to_string())];
                    if self.allowed.contains(&pair(from, &peer_id)) {
                        self.open.insert(pair(from, &peer_id));
                        self.queue.push_back((from.into(), EngineEvent::ChannelOpen { peer_id: peer_id.clone(), conn_id }));
                        let remote_open = EngineEvent::ChannelOpen { peer_id: from.into(), conn_id: remote_conn };
                        if self.late_open.contains(&peer_id) {
                            self.held_opens.push((peer_id, remote_open));
                        } else {
                            self.queue.push_back((peer_id, remote_open));
                        }
                    } else {
                        let reason = "unreachable".to_string();
                        self.queue.push_back((from.into(), EngineEvent::TransportFailed { peer_id: peer_id.clone(), conn_id, reason: reason.clone() }));
                        self.queue.push_back((peer_id, EngineEvent::TransportFailed { peer_id: from.into(), conn_id: remote_conn, reason }));
                    }
                }
                EngineAction::AddIceCandidate { .. } => {}
                EngineAction::Send { peer_id, conn_id, payload, receipt } => {
                    if self.open.contains(&pair(from, &peer_id)) {
                        let remote_conn = self.links[&(peer_id.clone(), from.to_string())];
                        self.sends.push((from.into(), peer_id.clone(), payload.clone()));
                        self.queue.push_back((peer_id, EngineEvent::DataReceived { peer_id: from.into(), conn_id: remote_conn, text: payload }));
                        if let Some(receipt) = receipt {
                            self.queue.push_back((from.into(), EngineEvent::ChunkDelivered { receipt, elapsed: Duration::from_millis(1) }));
                        }
                    } else {
                        self.queue.push_back((from.into(), EngineEvent::SendFailed { peer_id, conn_id, payload, receipt }));
                    }
                }
                EngineAction::Close { peer_id, .. } => {
                    if self.open.remove(&pair(from, &peer_id)) {
                        if let Some(remote_conn) = self.links.get(&(peer_id.clone(), from.to_string())) {
                            self.queue.push_back((peer_id, EngineEvent::ChannelClosed { peer_id: from.into(), conn_id: *remote_conn }));
                        }
                    }
                }
                EngineAction::ScheduleReconnect { peer_id, delay } => {
                    self.reconnects.push((from.into(), peer_id, delay));
                }
            }
        }

        fn run(&mut self) {
            let mut steps = 0;
            while let Some((target, event)) = self.queue.pop_front() {
                steps += 1;
                assert!(steps < 100_000, "mesh did not settle");
                let now = self.now;
                let outcome = self.engine(&target).handle(event, now);
                self.apply(&target, outcome);
            }
        }

        fn release_opens(&mut self) {
            self.late_open.clear();
            let held = std::mem::take(&mut self.held_opens);
            self.queue.extend(held);
            self.run();
        }

        fn announce_all(&mut self) {
            let mut ids: Vec<String> = self.engines.keys().cloned().collect();
            ids.sort();
            for id in ids {
                let now = self.now;
                let outcome = self.engine(&id).announce(now);
                self.apply(&id, outcome);
            }
            self.run();
        }

        fn advance(&mut self, by: Duration) {
            self.now += by;
            let mut ids: Vec<String> = self.engines.keys().cloned().collect();
            ids.sort();
            for id in ids {
                self.queue.push_back((id, EngineEvent::Tick));
            }
            self.run();
        }

        fn chat(&mut self, from: &str, text: &str) -> String {
            let now = self.now;
            let outcome = self.engine(from).send_chat(text, now).unwrap();
            let id = self.engines[from].messages().last().unwrap().id.clone();
            self.apply(from, outcome);
            self.run();
            id
        }

        fn log(&self, id: &str) -> Vec<String> {
            self.engines[id].messages().iter().map(|m| m.text.clone()).collect()
        }
    }

    fn connected(ids: &[&str], edges: &[(&str, &str)]) -> Mesh {
        let mut mesh = Mesh::new(ids, MeshConfig::default());
        for (a, b) in edges {
            mesh.allow(a, b);
        }
        mesh.announce_all();
        mesh
    }

    // ── Scenarios ────────────────────────────────────────────────────────

    #[test]
    fn test_handshake_reaches_secure_channel() {
        let mut mesh = connected(&["a", "b"], &[("a", "b")]);
        assert!(mesh.engines["a"].is_secure("b"));
        assert!(mesh.engines["b"].is_secure("a"));
        let now = mesh.now;
        let peers = mesh.engine("a").peers(now);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].status, PeerStatus::Connected);
        assert_eq!(peers[0].username.as_deref(), Some("user-b"));
        assert!(mesh.engines["a"].registry.get("b").unwrap().username_verified);
    }

    #[test]
    fn test_simultaneous_discovery_resolves_glare() {
        let mut mesh = Mesh::new(&["a", "b"], MeshConfig::default());
        mesh.allow("a", "b");
        // Both announce before either HELLO is processed.
        let now = mesh.now;
        let oa = mesh.engine("a").announce(now);
        let ob = mesh.engine("b").announce(now);
        mesh.apply("a", oa);
        mesh.apply("b", ob);
        mesh.run();
        assert!(mesh.engines["a"].is_secure("b"));
        assert!(mesh.engines["b"].is_secure("a"));
    }

    #[test]
    fn test_lost_offer_retried_after_handshake_timeout() {
        let mut mesh = Mesh::new(&["a", "b"], MeshConfig::default());
        mesh.allow("a", "b");
        mesh.lose_offer.insert("a".into());
        mesh.announce_all();
        // b's offer loses the glare check at a, and a's offer never arrived.
        assert!(!mesh.engines["a"].is_secure("b"));
        assert!(!mesh.engines["b"].is_secure("a"));

        for _ in 0..3 {
            mesh.advance(Duration::from_secs(5));
        }
        assert!(!mesh.engines["a"].is_secure("b"), "still inside the handshake timeout");

        for _ in 0..3 {
            mesh.advance(Duration::from_secs(5));
        }
        assert!(mesh.engines["a"].is_secure("b"));
        assert!(mesh.engines["b"].is_secure("a"));
        assert!(mesh.reconnects.iter().any(|(f, t, d)| f == "a" && t == "b" && *d == Duration::from_secs(1)));
        assert_eq!(mesh.engines["a"].connections.failures("b"), 0);
    }

    #[test]
    fn test_key_exchange_before_local_open_event() {
        let mut mesh = Mesh::new(&["a", "b"], MeshConfig::default());
        mesh.allow("a", "b");
        mesh.late_open.insert("b".into());
        mesh.announce_all();
        // b answered; a's handshake frames landed before b saw its channel open.
        assert!(!mesh.engines["b"].is_secure("a"));
        assert!(mesh.held_opens.iter().any(|(id, _)| id == "b"));

        mesh.chat("b", "early");
        mesh.advance(Duration::from_millis(100));
        assert_eq!(mesh.engines["b"].pending_len("a"), 1);

        mesh.release_opens();
        assert!(mesh.engines["b"].is_secure("a"));
        assert!(mesh.engines["a"].is_secure("b"));
        assert_eq!(mesh.engines["b"].pending_len("a"), 0);

        mesh.advance(Duration::from_millis(100));
        assert_eq!(mesh.log("a"), vec!["early"]);

        mesh.chat("b", "late");
        mesh.advance(Duration::from_millis(100));
        assert_eq!(mesh.log("a"), vec!["early", "late"]);
        assert_eq!(mesh.engines["b"].pending_len("a"), 0);
    }

    #[test]
    fn test_chat_reaches_direct_peer_once() {
        let mut mesh = connected(&["a", "b"], &[("a", "b")]);
        mesh.chat("a", "hello");
        assert!(mesh.log("b").is_empty(), "held by the batch window");
        mesh.advance(Duration::from_millis(100));
        assert_eq!(mesh.log("b"), vec!["hello"]);
        assert_eq!(mesh.log("a"), vec!["hello"]);
        assert!(mesh.events("b").iter().any(|e| matches!(e, MeshEvent::MessageReceived(m) if m.text == "hello")));
    }

    #[test]
    fn test_dedup_idempotence() {
        let mut mesh = connected(&["a", "b", "c"], &[("a", "b"), ("b", "c")]);
        mesh.chat("a", "once");
        mesh.advance(Duration::from_millis(100));
        mesh.advance(Duration::from_millis(100));
        let payload = mesh
            .sends
            .iter()
            .rev()
            .find(|(f, t, _)| f == "a" && t == "b")
            .map(|(_, _, p)| p.clone())
            .unwrap();
        let conn = mesh.links[&("b".to_string(), "a".to_string())];
        let before = mesh.sends.len();
        for _ in 0..5 {
            mesh.queue.push_back(("b".into(), EngineEvent::DataReceived { peer_id: "a".into(), conn_id: conn, text: payload.clone() }));
        }
        mesh.run();
        mesh.advance(Duration::from_millis(100));
        assert_eq!(mesh.log("b"), vec!["once"]);
        assert_eq!(mesh.log("c"), vec!["once"]);
        assert!(mesh.sends[before..].iter().all(|(f, _, _)| f != "b"), "replays must not be forwarded");
    }

    #[test]
    fn test_three_peer_flood_without_reflection() {
        let mut mesh = connected(&["a", "b", "c"], &[("a", "b"), ("b", "c")]);
        assert!(!mesh.engines["a"].is_secure("c"));
        let before = mesh.sends.len();
        let id = mesh.chat("a", "via b");
        mesh.advance(Duration::from_millis(100));
        mesh.advance(Duration::from_millis(100));

        assert_eq!(mesh.log("b"), vec!["via b"]);
        assert_eq!(mesh.log("c"), vec!["via b"]);
        assert!(mesh.engines["c"].seen.contains(&id));

        let hops: Vec<(String, String)> = mesh.sends[before..]
            .iter()
            .map(|(f, t, _)| (f.clone(), t.clone()))
            .collect();
        assert!(hops.contains(&("a".into(), "b".into())));
        assert!(hops.contains(&("b".into(), "c".into())));
        assert!(!hops.contains(&("b".into(), "a".into())), "never reflected to origin");
        assert!(!hops.contains(&("c".into(), "b".into())), "never sent back to last hop");
        // A could not reach C directly, so the copy for C waits in A's queue.
        assert_eq!(mesh.engines["a"].pending_len("c"), 1);

        // C echoes the same message to B: B must neither log nor forward it.
        let before = mesh.sends.len();
        let chat = mesh.engines["c"].messages()[0].clone();
        let mut actions = Vec::new();
        mesh.engine("c").send_inner("b", InnerMessage::Chat(chat), None, &mut actions);
        for action in actions {
            mesh.execute("c", action);
        }
        mesh.run();
        mesh.advance(Duration::from_millis(100));
        assert_eq!(mesh.log("b"), vec!["via b"]);
        assert!(mesh.sends[before..].iter().all(|(f, _, _)| f != "b"));
    }

    #[test]
    fn test_offline_queue_flush_in_order() {
        let mut mesh = Mesh::new(&["a", "b"], MeshConfig::default());
        mesh.announce_all();
        assert!(!mesh.engines["a"].is_secure("b"));
        assert!(!mesh.reconnects.is_empty());

        for text in ["one", "two", "three"] {
            mesh.chat("a", text);
        }
        mesh.advance(Duration::from_millis(100));
        assert_eq!(mesh.engines["a"].pending_len("b"), 3);

        mesh.allow("a", "b");
        mesh.now += Duration::from_secs(1);
        let (peer, due) = ("b".to_string(), "a".to_string());
        mesh.queue.push_back((due, EngineEvent::ReconnectDue { peer_id: peer }));
        mesh.run();

        assert!(mesh.engines["a"].is_secure("b"));
        assert_eq!(mesh.log("b"), vec!["one", "two", "three"]);
        assert_eq!(mesh.engines["a"].pending_len("b"), 0);

        mesh.advance(Duration::from_millis(100));
        assert_eq!(mesh.log("b").len(), 3, "delivered exactly once");
    }

    #[test]
    fn test_backoff_grows_and_resets() {
        let mut mesh = Mesh::new(&["a", "b"], MeshConfig::default());
        mesh.announce_all();
        for _ in 0..3 {
            let delay = mesh.reconnects.iter().rev().find(|(f, _, _)| f == "a").map(|r| r.2).unwrap();
            mesh.now += delay;
            mesh.queue.push_back(("a".into(), EngineEvent::ReconnectDue { peer_id: "b".into() }));
            mesh.run();
        }
        let delays: Vec<Duration> = mesh.reconnects.iter().filter(|(f, _, _)| f == "a").map(|r| r.2).collect();
        assert_eq!(delays, vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4),
            Duration::from_secs(8),
        ]);

        mesh.allow("a", "b");
        mesh.now += Duration::from_secs(8);
        mesh.queue.push_back(("a".into(), EngineEvent::ReconnectDue { peer_id: "b".into() }));
        mesh.run();
        assert!(mesh.engines["a"].is_secure("b"));
        assert_eq!(mesh.engines["a"].connections.failures("b"), 0);
    }

    #[test]
    fn test_one_megabyte_transfer() {
        let mut mesh = connected(&["a", "b"], &[("a", "b")]);
        let data: Vec<u8> = (0..1024 * 1024).map(|i| (i * 7 % 256) as u8).collect();
        let now = mesh.now;
        let outcome = mesh
            .engine("a")
            .send_file(Bytes::from(data.clone()), "blob.bin", "application/octet-stream", now)
            .unwrap();
        mesh.apply("a", outcome);
        mesh.run();

        assert_eq!(mesh.engines["a"].outgoing_len(), 0);
        let files = mesh.engines["b"].incoming_files();
        assert_eq!(files.len(), 1);
        assert!(files[0].completed);
        assert_eq!(files[0].size, data.len() as u64);
        assert_eq!(files[0].from, "a");
        let file_id = files[0].file_id.clone();
        let received = mesh.engine("b").take_file(&file_id).unwrap();
        assert_eq!(received.len(), data.len());
        assert_eq!(&received[..], &data[..]);
        assert!(mesh.events("a").iter().any(|e| matches!(e, MeshEvent::FileSent { .. })));
        assert!(mesh.events("b").iter().any(|e| matches!(e, MeshEvent::FileCompleted { size, .. } if *size == 1024 * 1024)));
    }

    #[test]
    fn test_file_relayed_through_middle_peer() {
        let mut mesh = connected(&["a", "b", "c"], &[("a", "b"), ("b", "c")]);
        let now = mesh.now;
        let outcome = mesh.engine("a").send_file(Bytes::from_static(b"relay me"), "r.txt", "text/plain", now).unwrap();
        mesh.apply("a", outcome);
        mesh.run();
        let files = mesh.engines["c"].incoming_files();
        assert_eq!(files.len(), 1);
        assert!(files[0].completed);
        assert_eq!(mesh.engine("c").take_file(&files[0].file_id).unwrap().as_ref(), b"relay me");
        assert!(mesh.engines["a"].incoming_files().is_empty(), "origin never materializes its own file");
    }

    #[test]
    fn test_oversized_file_rejected_before_network() {
        let config = MeshConfig {
            max_file_size: 1024,
            ..MeshConfig::default()
        };
        let mut mesh = Mesh::new(&["a", "b"], config);
        mesh.allow("a", "b");
        mesh.announce_all();
        let now = mesh.now;
        let big = Bytes::from(vec![0u8; 1025]);
        let err = mesh.engine("a").send_file(big, "big", "", now).unwrap_err();
        assert!(matches!(err, MeshError::FileTooLarge { .. }));
        assert_eq!(mesh.engine("a").send_chat("   ", now).unwrap_err(), MeshError::EmptyMessage);
        assert_eq!(mesh.engine("a").set_username("", now).unwrap_err(), MeshError::EmptyUsername);
        assert!(mesh.engine("a").select_peer("ghost").is_err());
        assert!(mesh.engine("a").select_peer("b").is_ok());
        assert_eq!(mesh.engines["a"].selected_peer(), Some("b"));
    }

    #[test]
    fn test_identity_mismatch_is_soft() {
        let mut mesh = connected(&["a", "b"], &[("a", "b")]);
        let conn = mesh.links[&("b".to_string(), "a".to_string())];
        let forged = ChannelEnvelope::Identity {
            peer_id: "a".into(),
            username: "mallory".into(),
            hash: compute_identity_hash("a", "someone-else"),
        };
        mesh.events("b");
        mesh.queue.push_back(("b".into(), EngineEvent::DataReceived { peer_id: "a".into(), conn_id: conn, text: forged.to_json().unwrap() }));
        mesh.run();

        let now = mesh.now;
        let view = mesh.engine("b").peers(now).into_iter().find(|p| p.peer_id == "a").unwrap();
        assert_eq!(view.username, None);
        assert_eq!(view.status, PeerStatus::Connected);
        assert!(mesh.events("b").contains(&MeshEvent::IdentityRejected { peer_id: "a".into() }));
    }

    #[test]
    fn test_decrypt_failure_keeps_channel() {
        let mut mesh = connected(&["a", "b"], &[("a", "b")]);
        let conn = mesh.links[&("b".to_string(), "a".to_string())];
        let garbage = ChannelEnvelope::Encrypted {
            from: "a".into(),
            iv: vec![0; 12],
            data: vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17],
        };
        mesh.queue.push_back(("b".into(), EngineEvent::DataReceived { peer_id: "a".into(), conn_id: conn, text: garbage.to_json().unwrap() }));
        mesh.queue.push_back(("b".into(), EngineEvent::DataReceived { peer_id: "a".into(), conn_id: conn, text: "not json".into() }));
        mesh.run();
        assert!(mesh.engines["b"].is_secure("a"));

        mesh.chat("a", "still works");
        mesh.advance(Duration::from_millis(100));
        assert_eq!(mesh.log("b"), vec!["still works"]);
    }

    #[test]
    fn test_batch_cap_flushes_immediately() {
        let mut mesh = connected(&["a", "b"], &[("a", "b")]);
        let before = mesh.sends.len();
        for i in 0..10 {
            mesh.chat("a", &format!("m{i}"));
        }
        assert_eq!(mesh.log("b").len(), 10);
        let frames = mesh.sends[before..].iter().filter(|(f, _, _)| f == "a").count();
        assert_eq!(frames, 1, "ten messages travel as one encrypted batch");
    }

    #[test]
    fn test_liveness_marks_quiet_peer_offline() {
        let mut mesh = Mesh::new(&["a", "b"], MeshConfig::default());
        let now = mesh.now;
        let hello = SignalingEnvelope::broadcast("b", SignalBody::Hello(Hello { username: Some("bob".into()) }));
        let outcome = mesh.engine("a").handle(EngineEvent::Signal(hello), now);
        assert!(outcome.actions.iter().any(|a| matches!(a, EngineAction::CreateOffer { .. })));

        let outcome = mesh.engine("a").handle(EngineEvent::Tick, now + Duration::from_secs(16));
        assert!(outcome.actions.iter().any(|a| matches!(a, EngineAction::Close { .. })));
        let peers = mesh.engine("a").peers(now + Duration::from_secs(16));
        assert_eq!(peers[0].status, PeerStatus::Offline);
        assert_eq!(peers[0].username.as_deref(), Some("bob"));
    }

    #[test]
    fn test_open_channel_outlives_liveness_gap() {
        let mut mesh = connected(&["a", "b"], &[("a", "b")]);
        let later = mesh.now + Duration::from_secs(60);
        let outcome = mesh.engine("a").handle(EngineEvent::Tick, later);
        assert!(!outcome.actions.iter().any(|a| matches!(a, EngineAction::Close { .. })));
        assert_eq!(mesh.engine("a").peers(later)[0].status, PeerStatus::Connected);
    }

    #[test]
    fn test_fixed_test_key_mode_interoperates() {
        let config = MeshConfig {
            fixed_test_key: true,
            ..MeshConfig::default()
        };
        let mut mesh = Mesh::new(&["a", "b"], config);
        mesh.allow("a", "b");
        mesh.announce_all();
        assert_eq!(mesh.engines["a"].key_mode(), KeyMode::FixedTestKey);
        mesh.chat("a", "fixed");
        mesh.advance(Duration::from_millis(100));
        assert_eq!(mesh.log("b"), vec!["fixed"]);
        assert_eq!(MeshEngine::new("x", "x", MeshConfig::default(), PendingQueues::in_memory(), None).key_mode(), KeyMode::Derived);
    }

    #[test]
    fn test_shutdown_keeps_batched_chat() {
        let mut mesh = connected(&["a", "b"], &[("a", "b")]);
        mesh.chat("a", "unsent");
        mesh.engine("a").shutdown();
        assert_eq!(mesh.engines["a"].pending_len("b"), 1);
        assert!(mesh.log("b").is_empty());
    }

    #[test]
    fn test_stale_connection_events_are_ignored() {
        let mut mesh = connected(&["a", "b"], &[("a", "b")]);
        let now = mesh.now;
        let stale = ConnectionId(9_999);
        let outcome = mesh.engine("a").handle(EngineEvent::ChannelClosed { peer_id: "b".into(), conn_id: stale }, now);
        assert!(outcome.actions.is_empty());
        assert!(mesh.engines["a"].is_secure("b"));
    }
}
