//! Signaling relay over WebSocket.
//!
//! The relay is deliberately dumb: it forwards JSON text frames. A frame
//! with a `to` field goes to the connection that most recently spoke as that
//! peer; a frame without one goes to every other connection. Connections
//! register implicitly through the `from` field of whatever they send.
//!
//! [`RelayClient`] keeps one connection alive with retries and turns every
//! inbound envelope into [`EngineEvent::Signal`]. [`RelayServer`] is the
//! forwarding side, used for local meshes and tests.

use crate::core::config::{RELAY_CONNECT_TIMEOUT, RELAY_RETRY_DELAY};
use crate::core::engine::EngineEvent;
use crate::core::protocol::SignalingEnvelope;
use crate::utils::sos::SignalOfStop;
use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

// ── Client ───────────────────────────────────────────────────────────────────

/// Handle to the background relay connection.
#[derive(Clone)]
pub struct RelayClient {
    outbound: mpsc::UnboundedSender<SignalingEnvelope>,
    connected: watch::Receiver<bool>,
}

impl RelayClient {
    /// Spawn the connection task. It reconnects until `sos` fires.
    pub fn spawn(url: String, events: mpsc::UnboundedSender<EngineEvent>, sos: SignalOfStop) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (status_tx, connected) = watch::channel(false);
        tokio::spawn(run_client(url, events, outbound_rx, status_tx, sos));
        Self { outbound, connected }
    }

    /// Queue an envelope. Envelopes sent while disconnected are dropped;
    /// the engine re-announces on reconnect and times out handshakes whose
    /// OFFER or ANSWER was lost.
    pub fn send(&self, envelope: SignalingEnvelope) {
        let _ = self.outbound.send(envelope);
    }

    #[cfg(test)]
    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Watch connectivity; flips to `true` on every (re)connect.
    pub fn status(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }

    /// Resolves once the relay connection is up.
    pub async fn wait_connected(&self) {
        let mut rx = self.connected.clone();
        let _ = rx.wait_for(|up| *up).await;
    }
}

async fn run_client(
    url: String,
    events: mpsc::UnboundedSender<EngineEvent>,
    mut outbound: mpsc::UnboundedReceiver<SignalingEnvelope>,
    status: watch::Sender<bool>,
    sos: SignalOfStop,
) {
    while !sos.cancelled() {
        let connect = tokio::time::timeout(RELAY_CONNECT_TIMEOUT, tokio_tungstenite::connect_async(url.as_str()));
        let ws = match connect.await {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(e)) => {
                warn!(event = "relay_connect_failure", url = %url, error = %e, "Relay connection failed");
                if !wait_retry(&mut outbound, &sos).await {
                    break;
                }
                continue;
            }
            Err(_) => {
                warn!(event = "relay_connect_timeout", url = %url, "Relay connection timed out");
                if !wait_retry(&mut outbound, &sos).await {
                    break;
                }
                continue;
            }
        };

        info!(event = "relay_connected", url = %url, "Connected to signaling relay");
        let _ = status.send(true);
        let (mut write, mut read) = ws.split();

        loop {
            tokio::select! {
                out = outbound.recv() => {
                    let Some(envelope) = out else {
                        let _ = write.close().await;
                        let _ = status.send(false);
                        return;
                    };
                    let text = match envelope.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            warn!(event = "relay_encode_failure", error = %e, "Could not encode envelope");
                            continue;
                        }
                    };
                    if let Err(e) = write.send(Message::Text(text)).await {
                        warn!(event = "relay_send_failure", error = %e, "Relay write failed");
                        break;
                    }
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => match SignalingEnvelope::from_json(&text) {
                        Ok(envelope) => {
                            let _ = events.send(EngineEvent::Signal(envelope));
                        }
                        Err(e) => debug!(event = "relay_frame_invalid", error = %e, "Ignoring malformed relay frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(event = "relay_read_failure", error = %e, "Relay read failed");
                        break;
                    }
                },
                _ = sos.wait() => {
                    let _ = write.close().await;
                    let _ = status.send(false);
                    return;
                }
            }
        }

        let _ = status.send(false);
        warn!(event = "relay_disconnected", url = %url, "Lost signaling relay, reconnecting");
        if !wait_retry(&mut outbound, &sos).await {
            break;
        }
    }
}

/// Sleep out the retry delay, discarding envelopes queued meanwhile.
/// Returns `false` when shutting down.
async fn wait_retry(outbound: &mut mpsc::UnboundedReceiver<SignalingEnvelope>, sos: &SignalOfStop) -> bool {
    let sleep = tokio::time::sleep(RELAY_RETRY_DELAY);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            _ = sos.wait() => return false,
            dropped = outbound.recv() => match dropped {
                Some(envelope) => debug!(event = "relay_offline_drop", to = ?envelope.to, "Relay down, envelope dropped"),
                None => return false,
            },
        }
    }
}

// ── Server ───────────────────────────────────────────────────────────────────

struct RelayConn {
    peer_id: Option<String>,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct RelayState {
    next_id: u64,
    conns: HashMap<u64, RelayConn>,
}

impl RelayState {
    fn register(&mut self, conn: u64, peer_id: &str) {
        // A peer that reconnects takes its id over from the stale connection.
        for (id, c) in self.conns.iter_mut() {
            if *id != conn && c.peer_id.as_deref() == Some(peer_id) {
                c.peer_id = None;
            }
        }
        if let Some(c) = self.conns.get_mut(&conn) {
            c.peer_id = Some(peer_id.to_string());
        }
    }

    fn route(&self, conn: u64, envelope: &SignalingEnvelope, text: &str) -> usize {
        let targets: Vec<&RelayConn> = match envelope.to.as_deref() {
            Some(to) => self
                .conns
                .values()
                .filter(|c| c.peer_id.as_deref() == Some(to))
                .collect(),
            None => self
                .conns
                .iter()
                .filter(|(id, _)| **id != conn)
                .map(|(_, c)| c)
                .collect(),
        };
        targets
            .iter()
            .filter(|c| c.tx.send(Message::Text(text.to_string())).is_ok())
            .count()
    }
}

/// Forwarding relay bound to a TCP port.
pub struct RelayServer {
    listener: TcpListener,
    state: Arc<Mutex<RelayState>>,
}

impl RelayServer {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding relay on {addr}"))?;
        Ok(Self {
            listener,
            state: Arc::new(Mutex::new(RelayState::default())),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `sos` fires.
    pub async fn run(self, sos: SignalOfStop) -> Result<()> {
        info!(event = "relay_listening", addr = %self.local_addr()?, "Signaling relay listening");
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            warn!(event = "relay_accept_failure", error = %e, "Accept failed");
                            continue;
                        }
                    };
                    let state = self.state.clone();
                    let sos = sos.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_conn(stream, state, sos).await {
                            debug!(event = "relay_conn_closed", remote = %remote, error = %e, "Relay connection ended");
                        }
                    });
                }
                _ = sos.wait() => return Ok(()),
            }
        }
    }
}

async fn serve_conn(stream: TcpStream, state: Arc<Mutex<RelayState>>, sos: SignalOfStop) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let conn = {
        let mut st = state.lock().await;
        let id = st.next_id;
        st.next_id += 1;
        st.conns.insert(id, RelayConn { peer_id: None, tx });
        id
    };

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if write.send(msg).await.is_err() {
                break;
            }
        }
    });

    let result = async {
        loop {
            tokio::select! {
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(envelope) = SignalingEnvelope::from_json(&text) else {
                            debug!(event = "relay_frame_invalid", conn, "Dropping malformed frame");
                            continue;
                        };
                        let mut st = state.lock().await;
                        st.register(conn, &envelope.from);
                        let delivered = st.route(conn, &envelope, &text);
                        if delivered == 0 && envelope.to.is_some() {
                            debug!(event = "relay_unroutable", to = ?envelope.to, "No connection for recipient");
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(anyhow::Error::from(e)),
                },
                _ = sos.wait() => return Ok(()),
            }
        }
    }
    .await;

    state.lock().await.conns.remove(&conn);
    writer.abort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::SignalBody;
    use crate::core::protocol::signaling::Hello;
    use std::time::Duration;

    async fn next_signal(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> SignalingEnvelope {
        let ev = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("relay event timed out")
            .expect("event channel closed");
        match ev {
            EngineEvent::Signal(env) => env,
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_broadcast_and_direct_routing() {
        let sos = SignalOfStop::new();
        let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", server.local_addr().unwrap());
        tokio::spawn(server.run(sos.clone()));

        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = RelayClient::spawn(url.clone(), a_tx, sos.clone());
        let b = RelayClient::spawn(url, b_tx, sos.clone());
        a.wait_connected().await;
        b.wait_connected().await;
        assert!(a.is_connected());

        let hello = SignalingEnvelope::broadcast("a", SignalBody::Hello(Hello { username: Some("alice".into()) }));
        a.send(hello.clone());
        assert_eq!(next_signal(&mut b_rx).await, hello);

        let offer = SignalingEnvelope::direct("b", "a", SignalBody::Offer("sdp".into()));
        b.send(SignalingEnvelope::direct("b", "nobody", SignalBody::Ice("x".into())));
        b.send(offer.clone());
        assert_eq!(next_signal(&mut a_rx).await, offer);

        sos.cancel();
    }

    #[test]
    fn test_reregistration_moves_peer_id() {
        let mut st = RelayState::default();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        st.conns.insert(0, RelayConn { peer_id: None, tx: tx1 });
        st.conns.insert(1, RelayConn { peer_id: None, tx: tx2 });
        st.register(0, "a");
        st.register(1, "a");
        assert_eq!(st.conns[&0].peer_id, None);

        let env = SignalingEnvelope::direct("b", "a", SignalBody::Answer("sdp".into()));
        assert_eq!(st.route(5, &env, "frame"), 1);
        assert!(matches!(rx2.try_recv(), Ok(Message::Text(t)) if t == "frame"));
    }
}
