// Deskline Chat Engine — Socket Connection Manager
//
// Owns the single WebSocket connection of the active conversation:
//   - connects with the bearer credential in the URL query
//   - parses inbound JSON frames and forwards them to the client loop
//   - exposes a watchable state in {connecting, open, closing, closed}
//   - retries once per abnormal closure after a fixed delay
//   - intentional closes (conversation switch, shutdown) never reconnect
//
// One Connection per conversation. Switching conversations closes the old
// Connection before opening a new one, so a pending reconnect delay for the
// old conversation dies with its task instead of firing into the new one.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use crate::atoms::constants::{RECONNECT_DELAY_SECS, SOCKET_KEEPALIVE_SECS};
use crate::atoms::error::{ClientError, ClientResult};
use crate::atoms::types::{ConnectionState, OutboundFrame, ServerFrame};
use crate::engine::config::ClientConfig;

// ── Closure reasons ────────────────────────────────────────────────────

/// Why the client is closing the connection on purpose. Consumed exactly
/// once by the socket task; an intentional close never reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The active conversation changed; a new connection replaces this one.
    Switch,
    /// The client is shutting down.
    Shutdown,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Switch => "switch",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

/// Server close codes that must not trigger a reconnect: normal closure,
/// server going away, policy violation.
fn should_retry(code: CloseCode) -> bool {
    !matches!(
        code,
        CloseCode::Normal | CloseCode::Away | CloseCode::Policy
    )
}

// ── URL handling ───────────────────────────────────────────────────────

fn socket_endpoint(ws_base: &str, conversation_id: &str, credential: &str) -> String {
    format!(
        "{}/ws/{}?token={}",
        ws_base,
        conversation_id,
        urlencoding::encode(credential)
    )
}

/// Replace the `token` query value so the URL is safe to log.
fn redact_token(endpoint: &str) -> String {
    match url::Url::parse(endpoint) {
        Ok(mut parsed) => {
            let pairs: Vec<(String, String)> = parsed
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            if pairs.iter().any(|(k, _)| k == "token") {
                parsed
                    .query_pairs_mut()
                    .clear()
                    .extend_pairs(pairs.iter().map(|(k, v)| {
                        if k == "token" {
                            (k.as_str(), "REDACTED")
                        } else {
                            (k.as_str(), v.as_str())
                        }
                    }));
            }
            parsed.to_string()
        }
        // Unparseable input: drop the whole query rather than risk leaking.
        Err(_) => endpoint
            .split('?')
            .next()
            .unwrap_or(endpoint)
            .to_string(),
    }
}

// ── Connection handle ──────────────────────────────────────────────────

pub struct Connection {
    conversation_id: String,
    outbound_tx: mpsc::UnboundedSender<OutboundFrame>,
    control_tx: mpsc::UnboundedSender<CloseReason>,
    state_rx: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl Connection {
    /// Open the connection for one conversation and start its socket task.
    /// Inbound frames are delivered through `frames_tx`.
    ///
    /// Errors when no credential is configured; the caller keeps the
    /// connection state at `closed` in that case.
    pub fn open(
        cfg: &ClientConfig,
        conversation_id: &str,
        frames_tx: mpsc::Sender<ServerFrame>,
    ) -> ClientResult<Connection> {
        let credential = cfg
            .credential
            .clone()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ClientError::config("no credential; connection stays closed"))?;

        let endpoint = socket_endpoint(&cfg.ws_base(), conversation_id, &credential);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let task = tokio::spawn(run_socket_task(
            endpoint,
            conversation_id.to_string(),
            frames_tx,
            outbound_rx,
            control_rx,
            state_tx,
        ));

        Ok(Connection {
            conversation_id: conversation_id.to_string(),
            outbound_tx,
            control_tx,
            state_rx,
            task,
        })
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch handle for state transitions; used by the client loop to relay
    /// `connection_changed` events.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Hand a frame to the socket task. Returns false — after a local
    /// warning — when the connection is not open; the payload is dropped,
    /// never queued.
    pub fn send(&self, frame: OutboundFrame) -> bool {
        if self.state() != ConnectionState::Open {
            warn!(
                "[socket] Not open ({:?}); dropping outbound frame for {}",
                self.state(),
                self.conversation_id
            );
            return false;
        }
        self.outbound_tx.send(frame).is_ok()
    }

    /// Intentional close. Consumes the handle; awaits task teardown so a
    /// successor connection never overlaps with this one.
    pub async fn close(self, reason: CloseReason) {
        let _ = self.control_tx.send(reason);
        let _ = self.task.await;
    }
}

// ── Socket task ────────────────────────────────────────────────────────

enum SessionEnd {
    Intentional(CloseReason),
    NoRetry(CloseCode),
    Abnormal(String),
}

async fn run_socket_task(
    endpoint: String,
    conversation_id: String,
    frames_tx: mpsc::Sender<ServerFrame>,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundFrame>,
    mut control_rx: mpsc::UnboundedReceiver<CloseReason>,
    state_tx: watch::Sender<ConnectionState>,
) {
    loop {
        let end = run_socket_session(
            &endpoint,
            &conversation_id,
            &frames_tx,
            &mut outbound_rx,
            &mut control_rx,
            &state_tx,
        )
        .await;

        let _ = state_tx.send(ConnectionState::Closed);

        match end {
            SessionEnd::Intentional(reason) => {
                info!(
                    "[socket] Closed intentionally ({}) for {}",
                    reason.as_str(),
                    conversation_id
                );
                break;
            }
            SessionEnd::NoRetry(code) => {
                info!(
                    "[socket] Server closed with {:?} for {}; not reconnecting",
                    code, conversation_id
                );
                break;
            }
            SessionEnd::Abnormal(detail) => {
                warn!(
                    "[socket] Abnormal closure for {} ({}); reconnecting in {}s",
                    conversation_id, detail, RECONNECT_DELAY_SECS
                );
                // An intentional close arriving during the delay means the
                // conversation moved on; the scheduled reconnect is stale.
                tokio::select! {
                    ctrl = control_rx.recv() => {
                        if let Some(reason) = ctrl {
                            info!(
                                "[socket] Reconnect for {} cancelled ({})",
                                conversation_id,
                                reason.as_str()
                            );
                        }
                        break;
                    }
                    _ = tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS)) => {}
                }
            }
        }
    }
    let _ = state_tx.send(ConnectionState::Closed);
}

async fn run_socket_session(
    endpoint: &str,
    conversation_id: &str,
    frames_tx: &mpsc::Sender<ServerFrame>,
    outbound_rx: &mut mpsc::UnboundedReceiver<OutboundFrame>,
    control_rx: &mut mpsc::UnboundedReceiver<CloseReason>,
    state_tx: &watch::Sender<ConnectionState>,
) -> SessionEnd {
    let _ = state_tx.send(ConnectionState::Connecting);
    info!("[socket] Connecting to {}", redact_token(endpoint));

    let (ws_stream, _) = match connect_async(endpoint).await {
        Ok(pair) => pair,
        Err(e) => return SessionEnd::Abnormal(format!("handshake failed: {}", e)),
    };
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let _ = state_tx.send(ConnectionState::Open);
    info!("[socket] Open for conversation {}", conversation_id);

    loop {
        tokio::select! {
            ctrl = control_rx.recv() => {
                let reason = ctrl.unwrap_or(CloseReason::Shutdown);
                let _ = state_tx.send(ConnectionState::Closing);
                let _ = ws_tx
                    .send(WsMessage::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: reason.as_str().into(),
                    })))
                    .await;
                return SessionEnd::Intentional(reason);
            }

            out = outbound_rx.recv() => {
                let Some(frame) = out else {
                    // Handle dropped without close(); tear down quietly.
                    return SessionEnd::Intentional(CloseReason::Shutdown);
                };
                let json = match serde_json::to_string(&frame) {
                    Ok(j) => j,
                    Err(e) => {
                        error!("[socket] Failed to encode outbound frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(WsMessage::Text(json)).await {
                    return SessionEnd::Abnormal(format!("send failed: {}", e));
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(raw))) => {
                        match serde_json::from_str::<ServerFrame>(&raw) {
                            Ok(frame) => {
                                if frames_tx.send(frame).await.is_err() {
                                    return SessionEnd::Intentional(CloseReason::Shutdown);
                                }
                            }
                            Err(e) => {
                                debug!("[socket] Ignoring malformed frame: {}", e);
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(payload))) => {
                        let _ = ws_tx.send(WsMessage::Pong(payload)).await;
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        let code = frame.map(|f| f.code);
                        return match code {
                            Some(code) if !should_retry(code) => SessionEnd::NoRetry(code),
                            Some(code) => SessionEnd::Abnormal(format!("server close {:?}", code)),
                            None => SessionEnd::Abnormal("server close without code".into()),
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Abnormal(format!("read failed: {}", e)),
                    None => return SessionEnd::Abnormal("stream ended".into()),
                }
            }

            _ = tokio::time::sleep(Duration::from_secs(SOCKET_KEEPALIVE_SECS)) => {
                let _ = ws_tx.send(WsMessage::Ping(vec![])).await;
            }
        }
    }
}
