//! MeshNode: the tokio actor that owns the engine.
//!
//! Everything that touches mesh state funnels through one `select!` loop:
//! transport and relay callbacks arrive as [`EngineEvent`]s on the node's
//! channel, operator commands arrive as stdin lines, and a fixed interval
//! feeds `Tick`. The loop hands each input to the engine and executes the
//! returned actions against the webrtc transport and the relay.

use crate::core::config::{MeshConfig, TICK_INTERVAL};
use crate::core::connection::webrtc::WebRtcTransport;
use crate::core::engine::{EngineAction, EngineEvent, EngineOutcome, MeshEngine, MeshEvent};
use crate::core::error::MeshError;
use crate::core::relay::RelayClient;
use crate::core::store_forward::PendingQueues;
use crate::utils::atomic_write::atomic_write;
use crate::utils::sos::SignalOfStop;
use crate::workers::identity::Identity;
use anyhow::Result;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const DEFAULT_MIME: &str = "application/octet-stream";

// ── Commands ─────────────────────────────────────────────────────────────────

/// One line of operator input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeCommand {
    Chat(String),
    SendFile { path: PathBuf, mime: Option<String> },
    Rename(String),
    Peers,
    Select(String),
    Files,
    Save { file_id: String, path: PathBuf },
    Help,
    Quit,
    Invalid(String),
}

impl NodeCommand {
    /// Plain text is chat; `/`-prefixed lines are commands. Blank lines
    /// yield nothing.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Some(Self::Chat(line.to_string()));
        };
        let mut parts = rest.split_whitespace();
        let cmd = parts.next().unwrap_or_default();
        let args: Vec<&str> = parts.collect();
        Some(match (cmd, args.as_slice()) {
            ("file", [path]) => Self::SendFile {
                path: PathBuf::from(path),
                mime: None,
            },
            ("file", [path, mime]) => Self::SendFile {
                path: PathBuf::from(path),
                mime: Some(mime.to_string()),
            },
            ("name", [_, ..]) => Self::Rename(args.join(" ")),
            ("peers", []) => Self::Peers,
            ("select", [peer]) => Self::Select(peer.to_string()),
            ("files", []) => Self::Files,
            ("save", [file_id, path]) => Self::Save {
                file_id: file_id.to_string(),
                path: PathBuf::from(path),
            },
            ("help", []) => Self::Help,
            ("quit" | "exit", []) => Self::Quit,
            _ => Self::Invalid(line.to_string()),
        })
    }
}

const HELP: &str = "\
  <text>                    send a chat message to the mesh
  /file <path> [mime]       flood a file to every peer
  /name <username>          change your display name
  /peers                    list known peers
  /select <peer-id>         select a peer
  /files                    list incoming files
  /save <file-id> <path>    write a received file to disk
  /quit                     leave";

// ── Node ─────────────────────────────────────────────────────────────────────

pub struct NodeOptions {
    pub relay_url: String,
    pub stun_servers: Vec<String>,
    pub config: MeshConfig,
}

pub struct MeshNode {
    engine: MeshEngine,
    identity: Identity,
    transport: WebRtcTransport,
    relay: RelayClient,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: mpsc::UnboundedReceiver<EngineEvent>,
    app_rx: mpsc::UnboundedReceiver<MeshEvent>,
    sos: SignalOfStop,
}

impl MeshNode {
    pub fn new(identity: Identity, pending: PendingQueues, options: NodeOptions, sos: SignalOfStop) -> Result<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (app_tx, app_rx) = mpsc::unbounded_channel();
        let engine = MeshEngine::new(
            identity.peer_id.clone(),
            identity.username.clone(),
            options.config,
            pending,
            Some(app_tx),
        );
        let transport = WebRtcTransport::new(&options.stun_servers, events_tx.clone())?;
        let relay = RelayClient::spawn(options.relay_url, events_tx.clone(), sos.clone());
        Ok(Self {
            engine,
            identity,
            transport,
            relay,
            events_tx,
            events_rx,
            app_rx,
            sos,
        })
    }

    pub async fn run(mut self) -> Result<()> {
        info!(
            event = "node_started",
            peer_id = %self.engine.local_id(),
            username = %self.engine.username(),
            "Mesh node running"
        );
        println!("You are {} ({}). Type /help for commands.", self.engine.username(), self.engine.local_id());

        let mut stdin = BufReader::new(tokio::io::stdin()).lines();
        let mut stdin_open = true;
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut relay_status = self.relay.status();
        let mut relay_alive = true;

        loop {
            tokio::select! {
                Some(event) = self.events_rx.recv() => {
                    let outcome = self.engine.handle(event, Instant::now());
                    self.execute(outcome);
                }
                _ = tick.tick() => {
                    let outcome = self.engine.handle(EngineEvent::Tick, Instant::now());
                    self.execute(outcome);
                }
                changed = relay_status.changed(), if relay_alive => {
                    if changed.is_err() {
                        relay_alive = false;
                    } else if *relay_status.borrow_and_update() {
                        // Register with the relay and rediscover right away.
                        let outcome = self.engine.announce(Instant::now());
                        self.execute(outcome);
                    }
                }
                Some(event) = self.app_rx.recv() => self.render(event),
                line = stdin.next_line(), if stdin_open => match line {
                    Ok(Some(line)) => {
                        if let Some(command) = NodeCommand::parse(&line)
                            && !self.on_command(command).await
                        {
                            break;
                        }
                    }
                    Ok(None) => stdin_open = false,
                    Err(e) => {
                        warn!(event = "stdin_read_failure", error = %e, "Could not read operator input");
                        stdin_open = false;
                    }
                },
                _ = self.sos.wait() => break,
            }
        }

        info!(event = "node_stopping", "Shutting down mesh node");
        self.engine.shutdown();
        self.transport.close_all();
        self.sos.cancel();
        Ok(())
    }

    fn execute(&mut self, outcome: EngineOutcome) {
        if let Some(status) = outcome.status {
            println!("{status}");
        }
        for action in outcome.actions {
            match action {
                EngineAction::Signal(envelope) => self.relay.send(envelope),
                EngineAction::CreateOffer { peer_id, conn_id } => self.transport.create_offer(&peer_id, conn_id),
                EngineAction::AcceptOffer { peer_id, conn_id, sdp } => {
                    self.transport.accept_offer(&peer_id, conn_id, sdp)
                }
                EngineAction::ApplyAnswer { peer_id, conn_id, sdp } => {
                    self.transport.apply_answer(&peer_id, conn_id, sdp)
                }
                EngineAction::AddIceCandidate {
                    peer_id,
                    conn_id,
                    candidate,
                } => self.transport.add_ice_candidate(&peer_id, conn_id, candidate),
                EngineAction::Send {
                    peer_id,
                    conn_id,
                    payload,
                    receipt,
                } => self.transport.send(&peer_id, conn_id, payload, receipt),
                EngineAction::Close { peer_id, conn_id } => self.transport.close(&peer_id, conn_id),
                EngineAction::ScheduleReconnect { peer_id, delay } => {
                    let events = self.events_tx.clone();
                    let sos = self.sos.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {
                                let _ = events.send(EngineEvent::ReconnectDue { peer_id });
                            }
                            _ = sos.wait() => {}
                        }
                    });
                }
            }
        }
    }

    /// Returns `false` when the operator asked to quit.
    async fn on_command(&mut self, command: NodeCommand) -> bool {
        let now = Instant::now();
        match command {
            NodeCommand::Chat(text) => match self.engine.send_chat(&text, now) {
                Ok(outcome) => self.execute(outcome),
                Err(e) => println!("! {e}"),
            },
            NodeCommand::SendFile { path, mime } => {
                let data = match read_for_send(&path, self.engine.max_file_size()).await {
                    Ok(d) => d,
                    Err(e) => {
                        println!("! cannot send {}: {e:#}", path.display());
                        return true;
                    }
                };
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "file".to_string());
                let mime = mime.unwrap_or_else(|| DEFAULT_MIME.to_string());
                match self.engine.send_file(data, &name, &mime, now) {
                    Ok(outcome) => self.execute(outcome),
                    Err(e) => println!("! {e}"),
                }
            }
            NodeCommand::Rename(name) => match self.engine.set_username(&name, now) {
                Ok(outcome) => {
                    self.execute(outcome);
                    if let Err(e) = self.identity.set_username(&name) {
                        warn!(event = "identity_save_failure", error = %e, "Could not persist username");
                    }
                    println!("You are now {}", self.engine.username());
                }
                Err(e) => println!("! {e}"),
            },
            NodeCommand::Peers => self.print_peers(now),
            NodeCommand::Select(peer) => match self.engine.select_peer(&peer) {
                Ok(()) => println!("Selected {peer}"),
                Err(e) => println!("! {e}"),
            },
            NodeCommand::Files => {
                let files = self.engine.incoming_files();
                if files.is_empty() {
                    println!("No incoming files");
                }
                for f in files {
                    println!(
                        "  {} {} ({} bytes, {}) from {} {:.0}%{}",
                        f.file_id,
                        f.name,
                        f.size,
                        f.mime,
                        f.from,
                        f.progress * 100.0,
                        if f.available { " ready" } else { "" }
                    );
                }
            }
            NodeCommand::Save { file_id, path } => match self.engine.take_file(&file_id) {
                Some(data) => match atomic_write(&path, &data) {
                    Ok(()) => println!("Saved {} bytes to {}", data.len(), path.display()),
                    Err(e) => println!("! cannot write {}: {e}", path.display()),
                },
                None => println!("! {file_id} is not available"),
            },
            NodeCommand::Help => println!("{HELP}"),
            NodeCommand::Quit => return false,
            NodeCommand::Invalid(line) => println!("! unknown command: {line} (try /help)"),
        }
        true
    }

    fn print_peers(&self, now: Instant) {
        let peers = self.engine.peers(now);
        if peers.is_empty() {
            println!("No peers discovered yet");
            return;
        }
        let selected = self.engine.selected_peer();
        for p in peers {
            let marker = if selected == Some(p.peer_id.as_str()) { '*' } else { ' ' };
            println!(
                "{marker} {} {:<16} {:?} (queued {})",
                p.peer_id,
                p.username.as_deref().unwrap_or("?"),
                p.status,
                self.engine.pending_len(&p.peer_id)
            );
        }
    }

    fn display_name(&self, peer_id: &str) -> String {
        self.engine
            .peers(Instant::now())
            .into_iter()
            .find(|p| p.peer_id == peer_id)
            .and_then(|p| p.username)
            .unwrap_or_else(|| peer_id.chars().take(8).collect())
    }

    fn render(&self, event: MeshEvent) {
        match event {
            MeshEvent::MessageReceived(msg) => {
                if msg.from == self.engine.local_id() {
                    return;
                }
                let at = chrono::DateTime::from_timestamp_millis(msg.time)
                    .map(|t| t.with_timezone(&chrono::Local).format("%H:%M:%S").to_string())
                    .unwrap_or_default();
                println!("[{at}] {}: {}", self.display_name(&msg.from), msg.text);
            }
            MeshEvent::FileCompleted {
                file_id,
                name,
                size,
                mime,
                from,
            } => println!(
                "Received {name} ({size} bytes, {mime}) from {}. /save {file_id} <path>",
                self.display_name(&from)
            ),
            MeshEvent::FileSent { file_id, name } => println!("Sent {name} ({file_id})"),
            MeshEvent::IdentityRejected { peer_id } => {
                println!("! {peer_id} presented an identity that does not verify")
            }
            MeshEvent::FileProgress { file_id, received, size } => {
                debug!(event = "file_progress", file_id = %file_id, received, size, "Incoming file progress")
            }
            MeshEvent::PeersChanged => {}
        }
    }
}

/// Read a file for sending. Oversized files are refused from their metadata
/// without being loaded.
async fn read_for_send(path: &Path, limit: u64) -> Result<Bytes> {
    let size = tokio::fs::metadata(path).await?.len();
    if size > limit {
        return Err(MeshError::FileTooLarge { size, limit }.into());
    }
    Ok(Bytes::from(tokio::fs::read(path).await?))
}
