//! The shipped voice transport: a WebSocket driver speaking the platform's
//! voice gateway protocol, pumping 20 ms Opus frames as binary frames.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use linkdave_protocol::{Snowflake, VoiceServerEvent};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::error::VoiceError;
use crate::socket::{OpusFrameProvider, VoiceSocket, VoiceSocketFactory, VoiceStateUpdate};

// Platform voice gateway opcodes.
const OP_VOICE_IDENTIFY: u8 = 0;
const OP_VOICE_READY: u8 = 2;
const OP_VOICE_HEARTBEAT: u8 = 3;
const OP_VOICE_HELLO: u8 = 8;

const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 13_750;
const FRAME_INTERVAL: Duration = Duration::from_millis(20);

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub struct PlatformSocketFactory;

impl VoiceSocketFactory for PlatformSocketFactory {
    fn create(&self, bot_id: Snowflake, guild_id: Snowflake) -> Arc<dyn VoiceSocket> {
        Arc::new(PlatformSocket::new(bot_id, guild_id))
    }
}

pub struct PlatformSocket {
    shared: Arc<Shared>,
}

struct Shared {
    guild_id: Snowflake,
    pending: Mutex<PendingCredentials>,
    /// Bumped whenever a credential half lands so `open` can re-check.
    pending_tx: watch::Sender<u64>,
    provider: RwLock<Option<Arc<dyn OpusFrameProvider>>>,
    close_handler: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    cancel: CancellationToken,
    done_tx: watch::Sender<bool>,
    opened: AtomicBool,
    heartbeat_nonce: AtomicU64,
}

#[derive(Default)]
struct PendingCredentials {
    state: Option<VoiceStateUpdate>,
    server: Option<VoiceServerEvent>,
}

impl PendingCredentials {
    fn is_complete(&self) -> bool {
        self.state.is_some() && self.server.is_some()
    }
}

impl PlatformSocket {
    pub fn new(_bot_id: Snowflake, guild_id: Snowflake) -> PlatformSocket {
        PlatformSocket {
            shared: Arc::new(Shared {
                guild_id,
                pending: Mutex::new(PendingCredentials::default()),
                pending_tx: watch::Sender::new(0),
                provider: RwLock::new(None),
                close_handler: Mutex::new(None),
                cancel: CancellationToken::new(),
                done_tx: watch::Sender::new(false),
                opened: AtomicBool::new(false),
                heartbeat_nonce: AtomicU64::new(0),
            }),
        }
    }
}

impl Shared {
    fn fire_close_handler(&self) {
        let handler = self.close_handler.lock().unwrap().take();
        if let Some(handler) = handler {
            handler();
        }
    }
}

fn normalize_endpoint(endpoint: &str) -> String {
    if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
        endpoint.to_string()
    } else {
        format!("wss://{endpoint}")
    }
}

#[async_trait]
impl VoiceSocket for PlatformSocket {
    async fn open(&self, timeout: Duration) -> Result<(), VoiceError> {
        let shared = self.shared.clone();
        let deadline = tokio::time::Instant::now() + timeout;

        // Both credential halves arrive on other tasks; wait for the pair.
        let mut pending_rx = shared.pending_tx.subscribe();
        let credentials = pending_rx.wait_for(|_| shared.pending.lock().unwrap().is_complete());
        tokio::select! {
            res = tokio::time::timeout_at(deadline, credentials) => {
                res.map_err(|_| VoiceError::HandshakeTimeout)?
                    .map_err(|_| VoiceError::Closed)?;
            }
            _ = shared.cancel.cancelled() => return Err(VoiceError::Closed),
        }

        let (state, server) = {
            let pending = shared.pending.lock().unwrap();
            match (pending.state.clone(), pending.server.clone()) {
                (Some(state), Some(server)) => (state, server),
                _ => return Err(VoiceError::Closed),
            }
        };

        let url = normalize_endpoint(&server.endpoint);
        tracing::debug!(guild_id = %shared.guild_id, url = %url, "opening voice socket");

        let (ws, _) = tokio::time::timeout_at(deadline, connect_async(url))
            .await
            .map_err(|_| VoiceError::HandshakeTimeout)?
            .map_err(|e| VoiceError::Open(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let identify = serde_json::json!({
            "op": OP_VOICE_IDENTIFY,
            "d": {
                "server_id": server.guild_id,
                "user_id": state.user_id,
                "session_id": state.session_id,
                "token": server.token,
            }
        });
        sink.send(WsMessage::Text(identify.to_string().into()))
            .await
            .map_err(|e| VoiceError::Open(e.to_string()))?;

        let mut heartbeat_ms = DEFAULT_HEARTBEAT_INTERVAL_MS;
        loop {
            let frame = tokio::time::timeout_at(deadline, stream.next())
                .await
                .map_err(|_| VoiceError::HandshakeTimeout)?;
            let msg = match frame {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Err(VoiceError::Open(e.to_string())),
                None => return Err(VoiceError::Open("socket closed during handshake".into())),
            };
            let WsMessage::Text(text) = msg else { continue };
            let Ok(value) = serde_json::from_str::<serde_json::Value>(text.as_str()) else {
                continue;
            };
            match value.get("op").and_then(|v| v.as_u64()) {
                Some(op) if op == OP_VOICE_HELLO as u64 => {
                    if let Some(ms) = value
                        .pointer("/d/heartbeat_interval")
                        .and_then(|v| v.as_u64())
                    {
                        heartbeat_ms = ms;
                    }
                }
                Some(op) if op == OP_VOICE_READY as u64 => break,
                _ => {}
            }
        }

        shared.opened.store(true, Ordering::Release);

        let (frame_tx, frame_rx) = mpsc::channel::<Vec<u8>>(8);
        let pump_shared = shared.clone();
        std::thread::spawn(move || frame_pump(pump_shared, frame_tx));

        tokio::spawn(run_socket(
            shared,
            sink,
            stream,
            frame_rx,
            Duration::from_millis(heartbeat_ms),
        ));

        Ok(())
    }

    fn handle_state_update(&self, update: VoiceStateUpdate) {
        self.shared.pending.lock().unwrap().state = Some(update);
        self.shared.pending_tx.send_modify(|v| *v += 1);
    }

    fn handle_server_update(&self, update: VoiceServerEvent) {
        self.shared.pending.lock().unwrap().server = Some(update);
        self.shared.pending_tx.send_modify(|v| *v += 1);
    }

    fn set_frame_provider(&self, provider: Option<Arc<dyn OpusFrameProvider>>) {
        *self.shared.provider.write().unwrap() = provider;
    }

    fn set_close_handler(&self, handler: Box<dyn Fn() + Send + Sync>) {
        *self.shared.close_handler.lock().unwrap() = Some(handler);
    }

    async fn close(&self) {
        self.shared.cancel.cancel();
        if self.shared.opened.load(Ordering::Acquire) {
            let mut done_rx = self.shared.done_tx.subscribe();
            let _ = done_rx.wait_for(|done| *done).await;
        }
    }
}

/// Pulls one frame per 20 ms tick from the installed provider. Runs on a
/// plain thread because frame production blocks on HTTP reads and decode.
fn frame_pump(shared: Arc<Shared>, tx: mpsc::Sender<Vec<u8>>) {
    while !shared.cancel.is_cancelled() {
        std::thread::sleep(FRAME_INTERVAL);
        let provider = shared.provider.read().unwrap().clone();
        let Some(provider) = provider else { continue };
        if let Some(frame) = provider.provide() {
            if tx.blocking_send(frame).is_err() {
                break;
            }
        }
    }
}

async fn run_socket(
    shared: Arc<Shared>,
    mut sink: futures_util::stream::SplitSink<WsStream, WsMessage>,
    mut stream: futures_util::stream::SplitStream<WsStream>,
    mut frame_rx: mpsc::Receiver<Vec<u8>>,
    heartbeat: Duration,
) {
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await; // first tick resolves immediately

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                break;
            }
            frame = frame_rx.recv() => {
                let Some(frame) = frame else { break };
                if sink.send(WsMessage::Binary(frame.into())).await.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let nonce = shared.heartbeat_nonce.fetch_add(1, Ordering::Relaxed);
                let hb = serde_json::json!({"op": OP_VOICE_HEARTBEAT, "d": nonce});
                if sink.send(WsMessage::Text(hb.to_string().into())).await.is_err() {
                    break;
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(
                            guild_id = %shared.guild_id,
                            error = %e,
                            "voice socket receive error"
                        );
                        break;
                    }
                }
            }
        }
    }

    shared.cancel.cancel();
    let _ = shared.done_tx.send(true);
    shared.fire_close_handler();
}
