//! webrtc-rs transport.
//!
//! Every peer connection lives in its own link task that owns the
//! `RTCPeerConnection` and its single `mesh` data channel. The node actor
//! talks to a link through an unbounded command queue, so offer/answer/ICE
//! and sends for one peer are applied strictly in the order the engine
//! emitted them. Callbacks never touch engine state; they post
//! [`EngineEvent`]s tagged with the link's [`ConnectionId`].

use super::manager::ConnectionId;
use crate::core::config::DATA_CHANNEL_LABEL;
use crate::core::engine::{ChunkReceipt, EngineEvent};
use anyhow::{Context, Result, anyhow};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Poll interval while waiting for the SCTP send buffer to drain.
const DRAIN_POLL: Duration = Duration::from_millis(5);

/// Give up waiting for a drain after this long and report what we have.
const DRAIN_MAX_WAIT: Duration = Duration::from_secs(10);

type ChannelSlot = Arc<RwLock<Option<Arc<RTCDataChannel>>>>;

enum LinkCommand {
    Offer,
    Accept(String),
    ApplyAnswer(String),
    AddIce(String),
    Send {
        payload: String,
        receipt: Option<ChunkReceipt>,
    },
}

struct PeerLink {
    conn_id: ConnectionId,
    commands: mpsc::UnboundedSender<LinkCommand>,
}

pub struct WebRtcTransport {
    api: Arc<API>,
    ice_servers: Vec<RTCIceServer>,
    events: mpsc::UnboundedSender<EngineEvent>,
    links: HashMap<String, PeerLink>,
}

pub(crate) fn create_webrtc_api() -> Result<API> {
    let mut me = MediaEngine::default();
    let reg = register_default_interceptors(Registry::new(), &mut me)?;
    Ok(APIBuilder::new()
        .with_media_engine(me)
        .with_interceptor_registry(reg)
        .build())
}

impl WebRtcTransport {
    pub fn new(stun_servers: &[String], events: mpsc::UnboundedSender<EngineEvent>) -> Result<Self> {
        let api = create_webrtc_api().context("building webrtc API")?;
        let ice_servers = vec![RTCIceServer {
            urls: stun_servers.to_vec(),
            ..Default::default()
        }];
        Ok(Self {
            api: Arc::new(api),
            ice_servers,
            events,
            links: HashMap::new(),
        })
    }

    pub fn create_offer(&mut self, peer_id: &str, conn_id: ConnectionId) {
        self.spawn_link(peer_id, conn_id, LinkCommand::Offer);
    }

    pub fn accept_offer(&mut self, peer_id: &str, conn_id: ConnectionId, sdp: String) {
        self.spawn_link(peer_id, conn_id, LinkCommand::Accept(sdp));
    }

    pub fn apply_answer(&mut self, peer_id: &str, conn_id: ConnectionId, sdp: String) {
        self.command(peer_id, conn_id, LinkCommand::ApplyAnswer(sdp));
    }

    pub fn add_ice_candidate(&mut self, peer_id: &str, conn_id: ConnectionId, candidate: String) {
        self.command(peer_id, conn_id, LinkCommand::AddIce(candidate));
    }

    /// Queue a text frame. If the link is gone the payload comes straight
    /// back as `SendFailed` so nothing is silently lost.
    pub fn send(
        &mut self,
        peer_id: &str,
        conn_id: ConnectionId,
        payload: String,
        receipt: Option<ChunkReceipt>,
    ) {
        let Some(link) = self.links.get(peer_id).filter(|l| l.conn_id == conn_id) else {
            let _ = self.events.send(EngineEvent::SendFailed {
                peer_id: peer_id.to_string(),
                conn_id,
                payload,
                receipt,
            });
            return;
        };
        if let Err(mpsc::error::SendError(LinkCommand::Send { payload, receipt })) =
            link.commands.send(LinkCommand::Send { payload, receipt })
        {
            let _ = self.events.send(EngineEvent::SendFailed {
                peer_id: peer_id.to_string(),
                conn_id,
                payload,
                receipt,
            });
        }
    }

    /// Drop the link; its task closes the peer connection on the way out.
    pub fn close(&mut self, peer_id: &str, conn_id: ConnectionId) {
        if self.links.get(peer_id).is_some_and(|l| l.conn_id == conn_id) {
            self.links.remove(peer_id);
            debug!(event = "link_closed", peer = %peer_id, conn = %conn_id, "Closing peer link");
        }
    }

    pub fn close_all(&mut self) {
        self.links.clear();
    }

    fn command(&mut self, peer_id: &str, conn_id: ConnectionId, cmd: LinkCommand) {
        match self.links.get(peer_id) {
            Some(link) if link.conn_id == conn_id => {
                let _ = link.commands.send(cmd);
            }
            _ => debug!(
                event = "link_missing",
                peer = %peer_id,
                conn = %conn_id,
                "Dropping command for a link that no longer exists"
            ),
        }
    }

    fn spawn_link(&mut self, peer_id: &str, conn_id: ConnectionId, first: LinkCommand) {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(first);
        // Replacing the entry drops the old sender and ends the old link.
        self.links.insert(
            peer_id.to_string(),
            PeerLink {
                conn_id,
                commands: tx,
            },
        );
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        tokio::spawn(run_link(
            self.api.clone(),
            config,
            peer_id.to_string(),
            conn_id,
            self.events.clone(),
            rx,
        ));
    }
}

// ── Link task ────────────────────────────────────────────────────────────────

async fn run_link(
    api: Arc<API>,
    config: RTCConfiguration,
    peer_id: String,
    conn_id: ConnectionId,
    events: mpsc::UnboundedSender<EngineEvent>,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
) {
    let pc = match api.new_peer_connection(config).await {
        Ok(pc) => Arc::new(pc),
        Err(e) => {
            let _ = events.send(EngineEvent::TransportFailed {
                peer_id,
                conn_id,
                reason: e.to_string(),
            });
            return;
        }
    };
    let slot: ChannelSlot = Arc::new(RwLock::new(None));
    install_pc_handlers(&pc, &slot, &peer_id, conn_id, &events);

    while let Some(cmd) = commands.recv().await {
        match cmd {
            LinkCommand::Send { payload, receipt } => {
                send_text(&slot, &peer_id, conn_id, &events, payload, receipt).await;
            }
            LinkCommand::AddIce(candidate) => {
                if let Err(e) = add_ice(&pc, &candidate).await {
                    debug!(event = "ice_add_failure", peer = %peer_id, error = %e, "Rejected ICE candidate");
                }
            }
            other => {
                if let Err(e) = negotiate(&pc, &slot, &peer_id, conn_id, &events, other).await {
                    warn!(
                        event = "negotiation_failure",
                        peer = %peer_id,
                        conn = %conn_id,
                        error = %e,
                        "WebRTC negotiation failed"
                    );
                    let _ = events.send(EngineEvent::TransportFailed {
                        peer_id: peer_id.clone(),
                        conn_id,
                        reason: e.to_string(),
                    });
                    break;
                }
            }
        }
    }

    if let Err(e) = pc.close().await {
        debug!(event = "pc_close_failure", peer = %peer_id, error = %e, "Error closing peer connection");
    }
}

async fn negotiate(
    pc: &Arc<RTCPeerConnection>,
    slot: &ChannelSlot,
    peer_id: &str,
    conn_id: ConnectionId,
    events: &mpsc::UnboundedSender<EngineEvent>,
    cmd: LinkCommand,
) -> Result<()> {
    match cmd {
        LinkCommand::Offer => {
            let init = RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            };
            let dc = pc.create_data_channel(DATA_CHANNEL_LABEL, Some(init)).await?;
            attach_dc_handlers(&dc, peer_id, conn_id, events);
            *slot.write().await = Some(dc);

            let offer = pc.create_offer(None).await?;
            pc.set_local_description(offer).await?;
            post_local_description(pc, peer_id, conn_id, events).await
        }
        LinkCommand::Accept(sdp) => {
            let desc: RTCSessionDescription =
                serde_json::from_str(&sdp).context("parsing remote offer")?;
            pc.set_remote_description(desc).await?;
            let answer = pc.create_answer(None).await?;
            pc.set_local_description(answer).await?;
            post_local_description(pc, peer_id, conn_id, events).await
        }
        LinkCommand::ApplyAnswer(sdp) => {
            let desc: RTCSessionDescription =
                serde_json::from_str(&sdp).context("parsing remote answer")?;
            pc.set_remote_description(desc).await?;
            Ok(())
        }
        LinkCommand::AddIce(_) | LinkCommand::Send { .. } => Ok(()),
    }
}

async fn post_local_description(
    pc: &Arc<RTCPeerConnection>,
    peer_id: &str,
    conn_id: ConnectionId,
    events: &mpsc::UnboundedSender<EngineEvent>,
) -> Result<()> {
    let desc = pc
        .local_description()
        .await
        .ok_or_else(|| anyhow!("no local description after set_local_description"))?;
    let _ = events.send(EngineEvent::LocalDescription {
        peer_id: peer_id.to_string(),
        conn_id,
        sdp: serde_json::to_string(&desc)?,
    });
    Ok(())
}

async fn add_ice(pc: &Arc<RTCPeerConnection>, candidate: &str) -> Result<()> {
    let init: RTCIceCandidateInit = serde_json::from_str(candidate)?;
    pc.add_ice_candidate(init).await?;
    Ok(())
}

/// Send one frame. With a receipt, wait for the SCTP buffer to drain and
/// report the elapsed time so the sender can size the next chunk.
async fn send_text(
    slot: &ChannelSlot,
    peer_id: &str,
    conn_id: ConnectionId,
    events: &mpsc::UnboundedSender<EngineEvent>,
    payload: String,
    receipt: Option<ChunkReceipt>,
) {
    let dc = slot.read().await.clone();
    let Some(dc) = dc.filter(|dc| dc.ready_state() == RTCDataChannelState::Open) else {
        let _ = events.send(EngineEvent::SendFailed {
            peer_id: peer_id.to_string(),
            conn_id,
            payload,
            receipt,
        });
        return;
    };

    let started = Instant::now();
    if let Err(e) = dc.send_text(payload.clone()).await {
        warn!(event = "dc_send_failure", peer = %peer_id, error = %e, "Data channel send failed");
        let _ = events.send(EngineEvent::SendFailed {
            peer_id: peer_id.to_string(),
            conn_id,
            payload,
            receipt,
        });
        return;
    }

    if let Some(receipt) = receipt {
        let deadline = started + DRAIN_MAX_WAIT;
        while dc.buffered_amount().await > 0
            && dc.ready_state() == RTCDataChannelState::Open
            && Instant::now() < deadline
        {
            tokio::time::sleep(DRAIN_POLL).await;
        }
        let _ = events.send(EngineEvent::ChunkDelivered {
            receipt,
            elapsed: started.elapsed(),
        });
    }
}

// ── Callbacks ────────────────────────────────────────────────────────────────

fn install_pc_handlers(
    pc: &Arc<RTCPeerConnection>,
    slot: &ChannelSlot,
    peer_id: &str,
    conn_id: ConnectionId,
    events: &mpsc::UnboundedSender<EngineEvent>,
) {
    let (tx, peer) = (events.clone(), peer_id.to_string());
    pc.on_ice_candidate(Box::new(move |c| {
        let (tx, peer) = (tx.clone(), peer.clone());
        Box::pin(async move {
            let Some(candidate) = c else { return };
            let json = candidate
                .to_json()
                .map_err(anyhow::Error::from)
                .and_then(|init| serde_json::to_string(&init).map_err(anyhow::Error::from));
            match json {
                Ok(candidate) => {
                    let _ = tx.send(EngineEvent::LocalIceCandidate {
                        peer_id: peer,
                        conn_id,
                        candidate,
                    });
                }
                Err(e) => debug!(event = "ice_encode_failure", peer = %peer, error = %e, "Could not encode ICE candidate"),
            }
        })
    }));

    let (tx, peer) = (events.clone(), peer_id.to_string());
    pc.on_peer_connection_state_change(Box::new(move |s| {
        let (tx, peer) = (tx.clone(), peer.clone());
        Box::pin(async move {
            match s {
                RTCPeerConnectionState::Connected => {
                    info!(event = "webrtc_connected", peer = %peer, conn = %conn_id, "WebRTC connection established");
                }
                RTCPeerConnectionState::Failed => {
                    warn!(event = "webrtc_failed", peer = %peer, conn = %conn_id, "WebRTC connection failed");
                    let _ = tx.send(EngineEvent::TransportFailed {
                        peer_id: peer,
                        conn_id,
                        reason: "peer connection failed".into(),
                    });
                }
                RTCPeerConnectionState::Disconnected => {
                    debug!(event = "webrtc_disconnected", peer = %peer, "Transient disconnect, ICE may recover");
                }
                _ => {}
            }
        })
    }));

    let (tx, peer, slot) = (events.clone(), peer_id.to_string(), slot.clone());
    pc.on_data_channel(Box::new(move |dc| {
        let (tx, peer, slot) = (tx.clone(), peer.clone(), slot.clone());
        Box::pin(async move {
            if dc.label() != DATA_CHANNEL_LABEL {
                debug!(event = "dc_unexpected_label", peer = %peer, label = %dc.label(), "Ignoring data channel");
                return;
            }
            attach_dc_handlers(&dc, &peer, conn_id, &tx);
            *slot.write().await = Some(dc);
        })
    }));
}

fn attach_dc_handlers(
    dc: &Arc<RTCDataChannel>,
    peer_id: &str,
    conn_id: ConnectionId,
    events: &mpsc::UnboundedSender<EngineEvent>,
) {
    let (tx, peer) = (events.clone(), peer_id.to_string());
    dc.on_open(Box::new(move || {
        let _ = tx.send(EngineEvent::ChannelOpen {
            peer_id: peer.clone(),
            conn_id,
        });
        Box::pin(async {})
    }));

    let (tx, peer) = (events.clone(), peer_id.to_string());
    dc.on_close(Box::new(move || {
        let _ = tx.send(EngineEvent::ChannelClosed {
            peer_id: peer.clone(),
            conn_id,
        });
        Box::pin(async {})
    }));

    let peer = peer_id.to_string();
    dc.on_error(Box::new(move |err| {
        let peer = peer.clone();
        Box::pin(async move {
            warn!(event = "dc_error", peer = %peer, %err, "Data channel transport error");
        })
    }));

    let (tx, peer) = (events.clone(), peer_id.to_string());
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let (tx, peer) = (tx.clone(), peer.clone());
        Box::pin(async move {
            if !msg.is_string {
                debug!(event = "dc_binary_ignored", peer = %peer, "Ignoring binary frame");
                return;
            }
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => {
                    let _ = tx.send(EngineEvent::DataReceived {
                        peer_id: peer,
                        conn_id,
                        text,
                    });
                }
                Err(_) => debug!(event = "dc_invalid_utf8", peer = %peer, "Dropping non-UTF-8 text frame"),
            }
        })
    }));
}
