//! End-to-end protocol tests: a real node on an ephemeral port driven by a
//! tokio-tungstenite client, with deterministic voice sockets and sources.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use linkdave_audio::{Source, SourceError, SourceFactory};
use linkdave_protocol::*;
use linkdave_voice::{
    OpusFrameProvider, VoiceManager, VoiceSocket, VoiceSocketFactory, VoiceStateUpdate,
};
use linkdave_ws::NodeServer;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const BOT_ID: &str = "1116414956972290119";
const GUILD_ID: &str = "81384788765712384";

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

struct StubSocket {
    provider: RwLock<Option<Arc<dyn OpusFrameProvider>>>,
    close_handler: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    closed: AtomicBool,
}

impl StubSocket {
    fn new() -> StubSocket {
        StubSocket {
            provider: RwLock::new(None),
            close_handler: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn provider(&self) -> Option<Arc<dyn OpusFrameProvider>> {
        self.provider.read().unwrap().clone()
    }

    fn trigger_close(&self) {
        let handler = self.close_handler.lock().unwrap().take();
        if let Some(handler) = handler {
            handler();
        }
    }
}

#[async_trait]
impl VoiceSocket for StubSocket {
    async fn open(&self, _timeout: Duration) -> Result<(), linkdave_voice::VoiceError> {
        Ok(())
    }

    fn handle_state_update(&self, _update: VoiceStateUpdate) {}

    fn handle_server_update(&self, _update: VoiceServerEvent) {}

    fn set_frame_provider(&self, provider: Option<Arc<dyn OpusFrameProvider>>) {
        *self.provider.write().unwrap() = provider;
    }

    fn set_close_handler(&self, handler: Box<dyn Fn() + Send + Sync>) {
        *self.close_handler.lock().unwrap() = Some(handler);
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[derive(Default)]
struct StubSocketFactory {
    sockets: Mutex<Vec<Arc<StubSocket>>>,
}

impl StubSocketFactory {
    fn latest(&self) -> Arc<StubSocket> {
        self.sockets.lock().unwrap().last().unwrap().clone()
    }
}

impl VoiceSocketFactory for StubSocketFactory {
    fn create(&self, _bot_id: Snowflake, _guild_id: Snowflake) -> Arc<dyn VoiceSocket> {
        let socket = Arc::new(StubSocket::new());
        self.sockets.lock().unwrap().push(socket.clone());
        socket
    }
}

struct FakeSource {
    url: String,
    frames_left: AtomicI64,
    position: AtomicI64,
    closed: AtomicBool,
}

impl FakeSource {
    fn new(url: &str, frames: i64) -> Arc<FakeSource> {
        Arc::new(FakeSource {
            url: url.to_string(),
            frames_left: AtomicI64::new(frames),
            position: AtomicI64::new(0),
            closed: AtomicBool::new(false),
        })
    }
}

impl Source for FakeSource {
    fn next_opus_frame(&self) -> Result<Option<Vec<u8>>, SourceError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        if self.frames_left.fetch_sub(1, Ordering::AcqRel) <= 0 {
            return Ok(None);
        }
        self.position.fetch_add(20, Ordering::Release);
        Ok(Some(vec![0xF8]))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn position_ms(&self) -> i64 {
        self.position.load(Ordering::Acquire)
    }

    fn seek(&self, _position_ms: i64) -> Result<(), SourceError> {
        Err(SourceError::SeekUnsupported)
    }

    fn duration_ms(&self) -> i64 {
        0
    }

    fn can_seek(&self) -> bool {
        false
    }

    fn url(&self) -> String {
        self.url.clone()
    }
}

#[derive(Default)]
struct FakeSourceFactory {
    scripted: Mutex<VecDeque<Arc<FakeSource>>>,
}

impl FakeSourceFactory {
    fn push(&self, source: Arc<FakeSource>) {
        self.scripted.lock().unwrap().push_back(source);
    }
}

impl SourceFactory for FakeSourceFactory {
    fn create_from_url(
        &self,
        url: &str,
        _start_time_ms: i64,
    ) -> Result<Arc<dyn Source>, SourceError> {
        match self.scripted.lock().unwrap().pop_front() {
            Some(source) => Ok(source),
            None => Err(SourceError::Http(format!("no scripted source for {url}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct TestNode {
    server: Arc<NodeServer>,
    sockets: Arc<StubSocketFactory>,
    sources: Arc<FakeSourceFactory>,
    addr: SocketAddr,
}

async fn start_node() -> TestNode {
    let sockets = Arc::new(StubSocketFactory::default());
    let sources = Arc::new(FakeSourceFactory::default());
    let manager = VoiceManager::new(sockets.clone(), sources.clone());
    let server = NodeServer::new("1.0.0", manager);

    let app = linkdave_ws::gateway_router(server.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestNode {
        server,
        sockets,
        sources,
        addr,
    }
}

struct WsClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsClient {
    async fn connect(addr: SocketAddr) -> WsClient {
        let (ws, _) = connect_async(format!("ws://{addr}/ws?node=main"))
            .await
            .expect("connect to node");
        WsClient { ws }
    }

    async fn send_op(&mut self, op: u8, d: Value) {
        let frame = json!({"op": op, "d": d}).to_string();
        self.ws.send(WsMessage::Text(frame.into())).await.unwrap();
    }

    /// Next text frame as (op, payload); protocol pings are skipped.
    async fn recv(&mut self) -> (u8, Value) {
        let deadline = Duration::from_secs(5);
        loop {
            let msg = tokio::time::timeout(deadline, self.ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("websocket error");
            if let WsMessage::Text(text) = msg {
                let value: Value = serde_json::from_str(text.as_str()).unwrap();
                let op = value["op"].as_u64().unwrap() as u8;
                return (op, value.get("d").cloned().unwrap_or(Value::Null));
            }
        }
    }

    async fn identify(&mut self) -> Value {
        self.send_op(OP_IDENTIFY, json!({"bot_id": BOT_ID})).await;
        let (op, d) = self.recv().await;
        assert_eq!(op, OP_READY);
        d
    }

    async fn join_voice(&mut self, channel_id: &str) {
        self.send_op(
            OP_VOICE_UPDATE,
            json!({
                "guild_id": GUILD_ID,
                "channel_id": channel_id,
                "session_id": "platform-session",
                "event": {"token": "tok", "guild_id": GUILD_ID, "endpoint": "voice.example"}
            }),
        )
        .await;
        let (op, d) = self.recv().await;
        assert_eq!(op, OP_VOICE_CONNECT);
        assert_eq!(d["channel_id"], channel_id);
    }
}

/// Pull frames until the source reports EOF.
fn drain_provider(provider: &Arc<dyn OpusFrameProvider>) {
    while provider.provide().is_some() {}
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn identify_returns_ready_with_session_id() {
    let node = start_node().await;
    let mut client = WsClient::connect(node.addr).await;

    let ready = client.identify().await;
    assert_eq!(ready["resumed"], false);
    assert!(!ready["session_id"].as_str().unwrap().is_empty());
    assert_eq!(node.server.session_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn voice_update_replies_voice_connect() {
    let node = start_node().await;
    let mut client = WsClient::connect(node.addr).await;
    client.identify().await;
    client.join_voice("123").await;
    assert_eq!(node.server.player_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn play_pause_resume_stop_reply_sequence() {
    let node = start_node().await;
    node.sources.push(FakeSource::new("http://host/a.mp3", 10_000));

    let mut client = WsClient::connect(node.addr).await;
    client.identify().await;
    client.join_voice("123").await;

    client
        .send_op(OP_PLAY, json!({"guild_id": GUILD_ID, "url": "http://host/a.mp3"}))
        .await;

    let (op, d) = client.recv().await;
    assert_eq!(op, OP_TRACK_START);
    assert_eq!(d["track"]["url"], "http://host/a.mp3");

    let (op, d) = client.recv().await;
    assert_eq!(op, OP_PLAYER_UPDATE);
    assert_eq!(d["state"], "playing");

    client.send_op(OP_PAUSE, json!({"guild_id": GUILD_ID})).await;
    let (op, d) = client.recv().await;
    assert_eq!(op, OP_PLAYER_UPDATE);
    assert_eq!(d["state"], "paused");

    client.send_op(OP_RESUME, json!({"guild_id": GUILD_ID})).await;
    let (op, d) = client.recv().await;
    assert_eq!(op, OP_PLAYER_UPDATE);
    assert_eq!(d["state"], "playing");

    client.send_op(OP_STOP, json!({"guild_id": GUILD_ID})).await;
    let (op, d) = client.recv().await;
    assert_eq!(op, OP_TRACK_END);
    assert_eq!(d["reason"], "stopped");

    let (op, d) = client.recv().await;
    assert_eq!(op, OP_PLAYER_UPDATE);
    assert_eq!(d["state"], "idle");
    assert_eq!(d["position"], 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn volume_clamps_to_limits() {
    let node = start_node().await;
    let mut client = WsClient::connect(node.addr).await;
    client.identify().await;
    client.join_voice("123").await;

    client
        .send_op(OP_VOLUME, json!({"guild_id": GUILD_ID, "volume": 75}))
        .await;
    let (op, d) = client.recv().await;
    assert_eq!(op, OP_PLAYER_UPDATE);
    assert_eq!(d["volume"], 75);

    client
        .send_op(OP_VOLUME, json!({"guild_id": GUILD_ID, "volume": 9999}))
        .await;
    let (_, d) = client.recv().await;
    assert_eq!(d["volume"], 1000);
}

#[tokio::test(flavor = "multi_thread")]
async fn finished_track_fans_out_to_all_sessions_of_the_bot() {
    let node = start_node().await;
    node.sources.push(FakeSource::new("http://host/a.mp3", 3));

    let mut first = WsClient::connect(node.addr).await;
    first.identify().await;
    first.join_voice("123").await;

    let mut second = WsClient::connect(node.addr).await;
    second.identify().await;
    second.join_voice("123").await;

    first
        .send_op(OP_PLAY, json!({"guild_id": GUILD_ID, "url": "http://host/a.mp3"}))
        .await;
    let (op, _) = first.recv().await;
    assert_eq!(op, OP_TRACK_START);
    let (op, _) = first.recv().await;
    assert_eq!(op, OP_PLAYER_UPDATE);

    let provider = node.sockets.latest().provider().expect("provider installed");
    drain_provider(&provider);

    let (op, d) = first.recv().await;
    assert_eq!(op, OP_TRACK_END);
    assert_eq!(d["reason"], "finished");

    let (op, d) = second.recv().await;
    assert_eq!(op, OP_TRACK_END);
    assert_eq!(d["reason"], "finished");
}

#[tokio::test(flavor = "multi_thread")]
async fn voice_socket_loss_disconnects_every_session() {
    let node = start_node().await;

    let mut first = WsClient::connect(node.addr).await;
    first.identify().await;
    first.join_voice("123").await;

    let mut second = WsClient::connect(node.addr).await;
    second.identify().await;
    second.join_voice("123").await;

    node.sockets.latest().trigger_close();

    let (op, d) = first.recv().await;
    assert_eq!(op, OP_VOICE_DISCONNECT);
    assert_eq!(d["reason"], "connection_lost");

    let (op, _) = second.recv().await;
    assert_eq!(op, OP_VOICE_DISCONNECT);

    assert_eq!(node.server.player_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_frames_do_not_kill_the_session() {
    let node = start_node().await;
    let mut client = WsClient::connect(node.addr).await;
    client.identify().await;

    client
        .ws
        .send(WsMessage::Text("this is not json".into()))
        .await
        .unwrap();
    client.send_op(99, json!({})).await;

    client.send_op(OP_PING, json!({})).await;
    let (op, _) = client.recv().await;
    assert_eq!(op, OP_PONG);
}

#[tokio::test(flavor = "multi_thread")]
async fn play_failure_replies_track_error() {
    let node = start_node().await;
    // No scripted source: the factory fails.
    let mut client = WsClient::connect(node.addr).await;
    client.identify().await;
    client.join_voice("123").await;

    client
        .send_op(OP_PLAY, json!({"guild_id": GUILD_ID, "url": "http://host/missing.mp3"}))
        .await;
    let (op, d) = client.recv().await;
    assert_eq!(op, OP_TRACK_ERROR);
    assert_eq!(d["track"]["url"], "http://host/missing.mp3");
}

#[tokio::test(flavor = "multi_thread")]
async fn seek_on_http_stream_replies_track_error() {
    let node = start_node().await;
    node.sources.push(FakeSource::new("http://host/a.mp3", 100));

    let mut client = WsClient::connect(node.addr).await;
    client.identify().await;
    client.join_voice("123").await;
    client
        .send_op(OP_PLAY, json!({"guild_id": GUILD_ID, "url": "http://host/a.mp3"}))
        .await;
    let (op, _) = client.recv().await;
    assert_eq!(op, OP_TRACK_START);
    let (op, _) = client.recv().await;
    assert_eq!(op, OP_PLAYER_UPDATE);

    client
        .send_op(OP_SEEK, json!({"guild_id": GUILD_ID, "position": 5000}))
        .await;
    let (op, d) = client.recv().await;
    assert_eq!(op, OP_TRACK_ERROR);
    assert!(d["error"].as_str().unwrap().contains("seek not supported"));
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_removes_player_and_replies() {
    let node = start_node().await;
    let mut client = WsClient::connect(node.addr).await;
    client.identify().await;
    client.join_voice("123").await;

    client
        .send_op(OP_DISCONNECT, json!({"guild_id": GUILD_ID}))
        .await;
    let (op, d) = client.recv().await;
    assert_eq!(op, OP_VOICE_DISCONNECT);
    assert_eq!(d["reason"], "requested");
    assert_eq!(node.server.player_count(), 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(node.sockets.latest().closed.load(Ordering::Acquire));
}

#[tokio::test(flavor = "multi_thread")]
async fn migrate_snapshot_reports_live_state() {
    let node = start_node().await;
    node.sources.push(FakeSource::new("http://host/a.mp3", 10_000));

    let mut client = WsClient::connect(node.addr).await;
    client.identify().await;
    client.join_voice("123").await;
    client
        .send_op(
            OP_PLAY,
            json!({"guild_id": GUILD_ID, "url": "http://host/a.mp3", "volume": 80}),
        )
        .await;
    let (op, _) = client.recv().await;
    assert_eq!(op, OP_TRACK_START);
    let (op, _) = client.recv().await;
    assert_eq!(op, OP_PLAYER_UPDATE);

    client
        .send_op(OP_PLAYER_MIGRATE, json!({"guild_id": GUILD_ID}))
        .await;
    let (op, d) = client.recv().await;
    assert_eq!(op, OP_MIGRATE_READY);
    assert_eq!(d["url"], "http://host/a.mp3");
    assert_eq!(d["state"], "playing");
    assert_eq!(d["volume"], 80);
}

#[tokio::test(flavor = "multi_thread")]
async fn drain_broadcasts_node_draining() {
    let node = start_node().await;
    let mut client = WsClient::connect(node.addr).await;
    client.identify().await;

    node.server.drain("shutdown", 30_000);

    let (op, d) = client.recv().await;
    assert_eq!(op, OP_NODE_DRAINING);
    assert_eq!(d["reason"], "shutdown");
    assert_eq!(d["deadline_ms"], 30_000);
    assert!(node.server.is_draining());
}

#[tokio::test(flavor = "multi_thread")]
async fn monitor_endpoints_serve_json() {
    use tower::util::ServiceExt;

    let node = start_node().await;
    let app = linkdave_ws::monitor_router(node.server.clone());

    let response = app
        .clone()
        .oneshot(
            axum::http::Request::builder()
                .uri("/health")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024).await.unwrap();
    let health: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["version"], "1.0.0");

    let response = app
        .oneshot(
            axum::http::Request::builder()
                .uri("/stats")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024).await.unwrap();
    let stats: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(stats["players"], 0);
    assert_eq!(stats["draining"], false);
}
