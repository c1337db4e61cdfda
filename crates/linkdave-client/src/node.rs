use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use linkdave_protocol::*;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::ClientError;
use crate::events::{decode_event, NodeEvent};

const CLIENT_NAME: &str = "linkdave-client/1.0";
const PING_INTERVAL: Duration = Duration::from_secs(30);
const MIGRATE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct NodeOptions {
    pub auto_reconnect: bool,
    /// Base reconnect delay; attempt N waits `base * 2^N`.
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for NodeOptions {
    fn default() -> Self {
        NodeOptions {
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Disconnected,
    Connecting,
    Connected,
    Draining,
}

enum Outbound {
    Frame(Message),
    Close,
}

/// One WebSocket to one node, with reconnect and an application-level ping.
pub struct NodeClient {
    pub name: String,
    pub url: String,
    options: NodeOptions,
    state: Mutex<NodeState>,
    session_id: Mutex<Option<String>>,
    player_count: AtomicUsize,
    draining: AtomicBool,
    reconnect_attempts: AtomicU32,
    closed_by_user: AtomicBool,
    bot_id: Mutex<Option<Snowflake>>,
    out_tx: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    event_tx: mpsc::UnboundedSender<(String, NodeEvent)>,
    pending_migrations: Mutex<HashMap<Snowflake, oneshot::Sender<MigrateReadyData>>>,
}

impl NodeClient {
    pub fn new(
        name: &str,
        url: &str,
        options: NodeOptions,
        event_tx: mpsc::UnboundedSender<(String, NodeEvent)>,
    ) -> Arc<NodeClient> {
        Arc::new(NodeClient {
            name: name.to_string(),
            url: url.to_string(),
            options,
            state: Mutex::new(NodeState::Disconnected),
            session_id: Mutex::new(None),
            player_count: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
            reconnect_attempts: AtomicU32::new(0),
            closed_by_user: AtomicBool::new(false),
            bot_id: Mutex::new(None),
            out_tx: Mutex::new(None),
            event_tx,
            pending_migrations: Mutex::new(HashMap::new()),
        })
    }

    pub fn state(&self) -> NodeState {
        *self.state.lock().unwrap()
    }

    pub(crate) fn set_state(&self, state: NodeState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().unwrap().clone()
    }

    pub fn is_available(&self) -> bool {
        self.state() == NodeState::Connected && !self.draining.load(Ordering::Acquire)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub fn player_count(&self) -> usize {
        self.player_count.load(Ordering::Acquire)
    }

    pub(crate) fn increment_players(&self) {
        self.player_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn decrement_players(&self) {
        let _ = self
            .player_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                Some(c.saturating_sub(1))
            });
    }

    /// Open the socket and send Identify. Resolves once the socket is open;
    /// the Ready frame arrives on the event stream.
    pub async fn connect(self: &Arc<Self>, bot_id: Snowflake) -> Result<(), ClientError> {
        *self.bot_id.lock().unwrap() = Some(bot_id);
        self.set_state(NodeState::Connecting);

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        request
            .headers_mut()
            .insert("Client-Name", HeaderValue::from_static(CLIENT_NAME));

        let (ws, _) = match connect_async(request).await {
            Ok(ok) => ok,
            Err(e) => {
                self.set_state(NodeState::Disconnected);
                self.schedule_reconnect();
                return Err(ClientError::Connect(e.to_string()));
            }
        };

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        *self.out_tx.lock().unwrap() = Some(out_tx);
        self.set_state(NodeState::Connected);

        let node = self.clone();
        tokio::spawn(node.run(ws, out_rx));

        self.send_frame(Message::new(OP_IDENTIFY, &IdentifyData { bot_id }))?;
        tracing::info!(node = %self.name, url = %self.url, "connected to node");
        Ok(())
    }

    /// Stop reconnecting and close with a normal status.
    pub fn disconnect(&self) {
        self.closed_by_user.store(true, Ordering::Release);
        let out = self.out_tx.lock().unwrap().clone();
        if let Some(out) = out {
            let _ = out.send(Outbound::Close);
        }
    }

    async fn run(
        self: Arc<Self>,
        ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
        mut out_rx: mpsc::UnboundedReceiver<Outbound>,
    ) {
        let (mut sink, mut stream) = ws.split();

        let mut ping_interval = tokio::time::interval(PING_INTERVAL);
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ping_interval.tick().await;

        let (code, reason) = loop {
            tokio::select! {
                outbound = out_rx.recv() => {
                    match outbound {
                        Some(Outbound::Frame(msg)) => {
                            let Ok(text) = serde_json::to_string(&msg) else { continue };
                            if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                                break (None, format!("send error: {e}"));
                            }
                        }
                        Some(Outbound::Close) => {
                            let _ = sink
                                .send(WsMessage::Close(Some(CloseFrame {
                                    code: CloseCode::Normal,
                                    reason: "Client disconnect".into(),
                                })))
                                .await;
                            break (Some(1000), "client disconnect".to_string());
                        }
                        None => break (None, "outbound channel closed".to_string()),
                    }
                }
                _ = ping_interval.tick() => {
                    let text = match serde_json::to_string(&Message::empty(OP_PING)) {
                        Ok(text) => text,
                        Err(_) => continue,
                    };
                    if sink.send(WsMessage::Text(text.into())).await.is_err() {
                        break (None, "ping send error".to_string());
                    }
                }
                msg = stream.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => self.handle_frame(text.as_str()),
                        Some(Ok(WsMessage::Close(frame))) => {
                            let code = frame.as_ref().map(|f| u16::from(f.code));
                            let reason = frame
                                .map(|f| f.reason.to_string())
                                .unwrap_or_default();
                            break (code, reason);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break (None, format!("receive error: {e}")),
                        None => break (None, "stream ended".to_string()),
                    }
                }
            }
        };

        *self.out_tx.lock().unwrap() = None;
        if self.state() != NodeState::Draining {
            self.set_state(NodeState::Disconnected);
        }
        tracing::info!(node = %self.name, code = ?code, reason = %reason, "node socket closed");

        let _ = self
            .event_tx
            .send((self.name.clone(), NodeEvent::Closed { code, reason }));

        self.schedule_reconnect();
    }

    fn handle_frame(&self, text: &str) {
        let Some(event) = decode_event(text) else {
            return;
        };

        match &event {
            NodeEvent::Ready(ready) => {
                *self.session_id.lock().unwrap() = Some(ready.session_id.clone());
                self.reconnect_attempts.store(0, Ordering::Release);
            }
            NodeEvent::Stats(stats) => {
                self.player_count.store(stats.players, Ordering::Release);
                self.draining.store(stats.draining, Ordering::Release);
                if stats.draining {
                    self.set_state(NodeState::Draining);
                }
            }
            NodeEvent::NodeDraining(_) => {
                self.draining.store(true, Ordering::Release);
                self.set_state(NodeState::Draining);
            }
            NodeEvent::MigrateReady(data) => {
                // Correlated request/response: deliver to the awaiting
                // migration instead of the event stream.
                let pending = self.pending_migrations.lock().unwrap().remove(&data.guild_id);
                if let Some(tx) = pending {
                    let _ = tx.send(data.clone());
                    return;
                }
            }
            _ => {}
        }

        let _ = self.event_tx.send((self.name.clone(), event));
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.closed_by_user.load(Ordering::Acquire)
            || !self.options.auto_reconnect
            || self.is_draining()
        {
            return;
        }

        let attempts = self.reconnect_attempts.load(Ordering::Acquire);
        if attempts >= self.options.max_reconnect_attempts {
            tracing::warn!(node = %self.name, attempts, "giving up on reconnection");
            return;
        }
        self.reconnect_attempts.store(attempts + 1, Ordering::Release);

        let delay = reconnect_delay(self.options.reconnect_delay, attempts);
        tracing::info!(node = %self.name, attempt = attempts + 1, delay_ms = delay.as_millis() as u64, "scheduling reconnect");

        let node = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let bot_id = *node.bot_id.lock().unwrap();
            if let Some(bot_id) = bot_id {
                if let Err(e) = node.connect(bot_id).await {
                    tracing::warn!(node = %node.name, error = %e, "reconnect attempt failed");
                }
            }
        });
    }

    fn send_frame(&self, msg: Message) -> Result<(), ClientError> {
        let out = self.out_tx.lock().unwrap().clone();
        match out {
            Some(out) => out
                .send(Outbound::Frame(msg))
                .map_err(|_| ClientError::NotConnected),
            None => Err(ClientError::NotConnected),
        }
    }

    // Outbound helpers, one per client opcode.

    pub fn voice_update(&self, update: VoiceUpdateData) -> Result<(), ClientError> {
        self.send_frame(Message::new(OP_VOICE_UPDATE, &update))
    }

    pub fn play(&self, play: PlayData) -> Result<(), ClientError> {
        self.send_frame(Message::new(OP_PLAY, &play))
    }

    pub fn pause(&self, guild_id: Snowflake) -> Result<(), ClientError> {
        self.send_frame(Message::new(OP_PAUSE, &GuildData { guild_id }))
    }

    pub fn resume(&self, guild_id: Snowflake) -> Result<(), ClientError> {
        self.send_frame(Message::new(OP_RESUME, &GuildData { guild_id }))
    }

    pub fn stop(&self, guild_id: Snowflake) -> Result<(), ClientError> {
        self.send_frame(Message::new(OP_STOP, &GuildData { guild_id }))
    }

    pub fn seek(&self, guild_id: Snowflake, position: i64) -> Result<(), ClientError> {
        self.send_frame(Message::new(OP_SEEK, &SeekData { guild_id, position }))
    }

    pub fn disconnect_guild(&self, guild_id: Snowflake) -> Result<(), ClientError> {
        self.send_frame(Message::new(OP_DISCONNECT, &GuildData { guild_id }))
    }

    pub fn ping(&self) -> Result<(), ClientError> {
        self.send_frame(Message::empty(OP_PING))
    }

    pub fn volume(&self, guild_id: Snowflake, volume: i64) -> Result<(), ClientError> {
        self.send_frame(Message::new(OP_VOLUME, &VolumeData { guild_id, volume }))
    }

    /// PlayerMigrate and wait for the node's MigrateReady snapshot.
    pub async fn migrate_player(
        &self,
        guild_id: Snowflake,
    ) -> Result<MigrateReadyData, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.pending_migrations.lock().unwrap().insert(guild_id, tx);

        if let Err(e) = self.send_frame(Message::new(OP_PLAYER_MIGRATE, &GuildData { guild_id })) {
            self.pending_migrations.lock().unwrap().remove(&guild_id);
            return Err(e);
        }

        match tokio::time::timeout(MIGRATE_TIMEOUT, rx).await {
            Ok(Ok(data)) => Ok(data),
            _ => {
                self.pending_migrations.lock().unwrap().remove(&guild_id);
                Err(ClientError::MigrateTimeout)
            }
        }
    }
}

/// Exponential backoff: `base * 2^attempt`.
fn reconnect_delay(base: Duration, attempt: u32) -> Duration {
    base * 2u32.saturating_pow(attempt.min(16))
}
