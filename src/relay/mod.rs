// =============================================================================
// Relay & Auth
// =============================================================================
//
// Single authenticated WebSocket endpoint fanning messages between the
// trading bot, dashboards, and LLM ("trai") clients. Grounded on the
// teacher's `api/ws.rs` push loop (`tokio::select!` over a push interval and
// a recv stream) generalized from one privileged dashboard connection to
// many classified peers with typed routing rules, and on `api/auth.rs`'s
// constant-time token comparator, reused via `relay::auth`.

pub mod auth;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(15);
const MAX_MISSED_PINGS: u32 = 3;
const MAX_BUFFERED_BYTES: usize = 1_000_000;
const OUTBOUND_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientClass {
    TradingBot,
    Dashboard,
    TraiClient,
}

/// Message-type sets routed bot -> {dashboard, trai_client}.
const BOT_BROADCAST_TYPES: &[&str] = &["price", "decision", "status", "alert", "pattern_update"];

/// Message-type prefixes/exact matches routed dashboard -> bot.
fn is_dashboard_to_bot_type(frame_type: &str) -> bool {
    matches!(
        frame_type,
        "trai_query" | "timeframe_change" | "asset_change" | "request_historical"
    ) || frame_type.starts_with("request_journal_")
        || frame_type.starts_with("request_replay_")
}

struct ClientHandle {
    class: Option<ClientClass>,
    sender: mpsc::Sender<Message>,
    buffered_bytes: Arc<AtomicUsize>,
}

/// Process-wide fan-out hub. One instance is shared (via `Arc`) across every
/// accepted connection.
pub struct RelayHub {
    token: String,
    clients: RwLock<HashMap<u64, ClientHandle>>,
    next_id: AtomicU64,
}

impl RelayHub {
    pub fn new(token: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            token: token.into(),
            clients: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    fn register(&self) -> (u64, mpsc::Receiver<Message>, Arc<AtomicUsize>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let buffered_bytes = Arc::new(AtomicUsize::new(0));
        self.clients.write().insert(
            id,
            ClientHandle {
                class: None,
                sender: tx,
                buffered_bytes: buffered_bytes.clone(),
            },
        );
        (id, rx, buffered_bytes)
    }

    fn set_class(&self, id: u64, class: ClientClass) {
        if let Some(handle) = self.clients.write().get_mut(&id) {
            handle.class = Some(class);
        }
    }

    fn remove(&self, id: u64) {
        self.clients.write().remove(&id);
    }

    /// Enqueue `message` for `target`, dropping it and closing the
    /// connection if the per-connection buffer would exceed
    /// [`MAX_BUFFERED_BYTES`]. The bot never blocks on a slow dashboard.
    fn send_to(&self, target: u64, message: Message) {
        let size = match &message {
            Message::Text(t) => t.len(),
            Message::Binary(b) => b.len(),
            _ => 0,
        };
        let should_close = {
            let clients = self.clients.read();
            let Some(handle) = clients.get(&target) else {
                return;
            };
            let projected = handle.buffered_bytes.fetch_add(size, Ordering::Relaxed) + size;
            if projected > MAX_BUFFERED_BYTES {
                true
            } else {
                let _ = handle.sender.try_send(message);
                false
            }
        };
        if should_close {
            warn!(connection = target, "relay backpressure exceeded, dropping slow client");
            self.clients.write().remove(&target);
        }
    }

    fn broadcast_to(&self, classes: &[ClientClass], raw: &str) {
        let targets: Vec<u64> = self
            .clients
            .read()
            .iter()
            .filter(|(_, h)| h.class.map(|c| classes.contains(&c)).unwrap_or(false))
            .map(|(id, _)| *id)
            .collect();
        for id in targets {
            self.send_to(id, Message::Text(raw.to_string().into()));
        }
    }

    /// Route an inbound frame according to the sender's class and the
    /// frame's `type` field.
    fn route(&self, from: u64, raw: &str) {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) else {
            debug!(connection = from, "dropping unparseable relay frame");
            return;
        };
        let Some(frame_type) = value.get("type").and_then(|t| t.as_str()) else {
            return;
        };
        let sender_class = self.clients.read().get(&from).and_then(|h| h.class);
        match sender_class {
            Some(ClientClass::TradingBot) if BOT_BROADCAST_TYPES.contains(&frame_type) => {
                self.broadcast_to(&[ClientClass::Dashboard, ClientClass::TraiClient], raw);
            }
            Some(ClientClass::Dashboard) if is_dashboard_to_bot_type(frame_type) => {
                self.broadcast_to(&[ClientClass::TradingBot], raw);
            }
            _ => {
                debug!(connection = from, frame_type, "relay frame does not match any routing rule, dropping");
            }
        }
    }
}

#[derive(Deserialize)]
struct AuthFrame {
    #[serde(rename = "type")]
    frame_type: String,
    token: String,
}

#[derive(Deserialize)]
struct IdentifyFrame {
    #[serde(rename = "type")]
    frame_type: String,
    source: ClientClass,
}

#[derive(Serialize)]
struct PingFrame<'a> {
    #[serde(rename = "type")]
    frame_type: &'a str,
    id: u64,
}

/// Drives a single accepted connection end to end: auth handshake, identify,
/// heartbeat, and bidirectional routing. Mirrors the teacher's push/recv
/// `tokio::select!` loop in `api/ws.rs`.
pub async fn handle_connection(socket: WebSocket, hub: Arc<RelayHub>) {
    let (mut sender, mut receiver) = socket.split();

    let auth_result = timeout(AUTH_TIMEOUT, receiver.next()).await;
    let authed = match auth_result {
        Ok(Some(Ok(Message::Text(text)))) => serde_json::from_str::<AuthFrame>(&text)
            .ok()
            .filter(|f| f.frame_type == "auth")
            .map(|f| auth::validate_token(&f.token, &hub.token))
            .unwrap_or(false),
        _ => false,
    };
    if !authed {
        warn!("relay connection failed auth handshake, closing with 1008");
        let _ = sender
            .send(Message::Close(Some(CloseFrame {
                code: 1008,
                reason: "invalid or missing auth token".into(),
            })))
            .await;
        return;
    }

    let (id, mut outbound, _buffered) = hub.register();
    info!(connection = id, "relay connection authenticated");

    let mut missed_pings: u32 = 0;
    let mut next_ping_id: u64 = 0;
    let mut ping_tick = interval(PING_INTERVAL);

    loop {
        tokio::select! {
            _ = ping_tick.tick() => {
                if missed_pings >= MAX_MISSED_PINGS {
                    warn!(connection = id, "relay peer missed {MAX_MISSED_PINGS} consecutive pings, closing");
                    break;
                }
                next_ping_id += 1;
                let frame = PingFrame { frame_type: "ping", id: next_ping_id };
                if let Ok(json) = serde_json::to_string(&frame) {
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                    missed_pings += 1;
                }
            }
            outgoing = outbound.recv() => {
                match outgoing {
                    Some(message) => {
                        if sender.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(identify) = serde_json::from_str::<IdentifyFrame>(&text) {
                            if identify.frame_type == "identify" {
                                hub.set_class(id, identify.source);
                                info!(connection = id, class = ?identify.source, "relay client identified");
                                continue;
                            }
                        }
                        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
                            if value.get("type").and_then(|t| t.as_str()) == Some("pong") {
                                missed_pings = 0;
                                continue;
                            }
                        }
                        hub.route(id, &text);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        missed_pings = 0;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(connection = id, "relay connection closed by peer");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!(connection = id, "binary relay frame rejected");
                    }
                    Some(Err(err)) => {
                        warn!(connection = id, error = %err, "relay receive error, disconnecting");
                        break;
                    }
                }
            }
        }
    }

    hub.remove(id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bot_broadcast_types_match_spec_set() {
        for t in ["price", "decision", "status", "alert", "pattern_update"] {
            assert!(BOT_BROADCAST_TYPES.contains(&t));
        }
    }

    #[test]
    fn dashboard_to_bot_exact_types_recognized() {
        assert!(is_dashboard_to_bot_type("trai_query"));
        assert!(is_dashboard_to_bot_type("timeframe_change"));
        assert!(is_dashboard_to_bot_type("asset_change"));
        assert!(is_dashboard_to_bot_type("request_historical"));
    }

    #[test]
    fn dashboard_to_bot_wildcard_prefixes_recognized() {
        assert!(is_dashboard_to_bot_type("request_journal_export"));
        assert!(is_dashboard_to_bot_type("request_replay_start"));
        assert!(!is_dashboard_to_bot_type("unrelated_type"));
    }

    #[tokio::test]
    async fn routing_respects_class_and_type_rules() {
        let hub = RelayHub::new("secret");
        let (bot_id, mut bot_rx, _) = hub.register();
        hub.set_class(bot_id, ClientClass::TradingBot);
        let (dash_id, mut dash_rx, _) = hub.register();
        hub.set_class(dash_id, ClientClass::Dashboard);

        hub.route(bot_id, r#"{"type":"price","symbol":"BTC/USD"}"#);
        let received = dash_rx.recv().await.unwrap();
        assert!(matches!(received, Message::Text(_)));
        assert!(bot_rx.try_recv().is_err());

        hub.route(dash_id, r#"{"type":"trai_query","question":"why"}"#);
        let received = bot_rx.recv().await.unwrap();
        assert!(matches!(received, Message::Text(_)));
    }

    #[tokio::test]
    async fn unrouted_type_is_dropped_silently() {
        let hub = RelayHub::new("secret");
        let (bot_id, _bot_rx, _) = hub.register();
        hub.set_class(bot_id, ClientClass::TradingBot);
        let (dash_id, mut dash_rx, _) = hub.register();
        hub.set_class(dash_id, ClientClass::Dashboard);

        hub.route(bot_id, r#"{"type":"unknown_type"}"#);
        assert!(dash_rx.try_recv().is_err());
    }
}
