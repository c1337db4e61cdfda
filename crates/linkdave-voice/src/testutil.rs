//! Deterministic socket and source doubles for driving the voice state
//! machine in tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use linkdave_audio::{Source, SourceError, SourceFactory};
use linkdave_protocol::{Snowflake, VoiceServerEvent};

use crate::error::VoiceError;
use crate::socket::{OpusFrameProvider, VoiceSocket, VoiceSocketFactory, VoiceStateUpdate};

pub(crate) struct MockSocket {
    pub(crate) opened: AtomicBool,
    pub(crate) closed: AtomicBool,
    provider: RwLock<Option<Arc<dyn OpusFrameProvider>>>,
    close_handler: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    pub(crate) state_updates: Mutex<Vec<VoiceStateUpdate>>,
    pub(crate) server_updates: Mutex<Vec<VoiceServerEvent>>,
}

impl MockSocket {
    fn new() -> MockSocket {
        MockSocket {
            opened: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            provider: RwLock::new(None),
            close_handler: Mutex::new(None),
            state_updates: Mutex::new(Vec::new()),
            server_updates: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn provider(&self) -> Option<Arc<dyn OpusFrameProvider>> {
        self.provider.read().unwrap().clone()
    }

    /// Simulate the transport shutting down on its own.
    pub(crate) fn trigger_close(&self) {
        let handler = self.close_handler.lock().unwrap().take();
        if let Some(handler) = handler {
            handler();
        }
    }
}

#[async_trait]
impl VoiceSocket for MockSocket {
    async fn open(&self, _timeout: Duration) -> Result<(), VoiceError> {
        self.opened.store(true, Ordering::Release);
        Ok(())
    }

    fn handle_state_update(&self, update: VoiceStateUpdate) {
        self.state_updates.lock().unwrap().push(update);
    }

    fn handle_server_update(&self, update: VoiceServerEvent) {
        self.server_updates.lock().unwrap().push(update);
    }

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
pub(crate) struct MockSocketFactory {
    pub(crate) sockets: Mutex<Vec<Arc<MockSocket>>>,
}

impl MockSocketFactory {
    pub(crate) fn socket(&self, index: usize) -> Arc<MockSocket> {
        self.sockets.lock().unwrap()[index].clone()
    }

    pub(crate) fn created(&self) -> usize {
        self.sockets.lock().unwrap().len()
    }
}

impl VoiceSocketFactory for MockSocketFactory {
    fn create(&self, _bot_id: Snowflake, _guild_id: Snowflake) -> Arc<dyn VoiceSocket> {
        let socket = Arc::new(MockSocket::new());
        self.sockets.lock().unwrap().push(socket.clone());
        socket
    }
}

/// Produces a fixed number of dummy frames, then EOF (or a scripted error).
pub(crate) struct MockSource {
    url: String,
    frames: Mutex<VecDeque<Result<Option<Vec<u8>>, SourceError>>>,
    pub(crate) closed: AtomicBool,
    position: AtomicI64,
}

impl MockSource {
    pub(crate) fn with_frames(url: &str, count: usize) -> Arc<MockSource> {
        let mut frames: VecDeque<_> = (0..count).map(|i| Ok(Some(vec![i as u8]))).collect();
        frames.push_back(Ok(None));
        Arc::new(MockSource {
            url: url.to_string(),
            frames: Mutex::new(frames),
            closed: AtomicBool::new(false),
            position: AtomicI64::new(0),
        })
    }

    pub(crate) fn failing(url: &str) -> Arc<MockSource> {
        let mut frames = VecDeque::new();
        frames.push_back(Err(SourceError::Read("mid-stream failure".to_string())));
        Arc::new(MockSource {
            url: url.to_string(),
            frames: Mutex::new(frames),
            closed: AtomicBool::new(false),
            position: AtomicI64::new(0),
        })
    }
}

impl Source for MockSource {
    fn next_opus_frame(&self) -> Result<Option<Vec<u8>>, SourceError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        match self.frames.lock().unwrap().pop_front() {
            Some(Ok(Some(frame))) => {
                self.position.fetch_add(20, Ordering::Release);
                Ok(Some(frame))
            }
            Some(other) => other,
            None => Ok(None),
        }
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

/// Hands out pre-seeded sources by URL.
#[derive(Default)]
pub(crate) struct MockSourceFactory {
    pub(crate) sources: Mutex<VecDeque<Arc<MockSource>>>,
}

impl MockSourceFactory {
    pub(crate) fn push(&self, source: Arc<MockSource>) {
        self.sources.lock().unwrap().push_back(source);
    }
}

impl SourceFactory for MockSourceFactory {
    fn create_from_url(
        &self,
        url: &str,
        _start_time_ms: i64,
    ) -> Result<Arc<dyn Source>, SourceError> {
        match self.sources.lock().unwrap().pop_front() {
            Some(source) => Ok(source),
            None => Err(SourceError::Http(format!("no scripted source for {url}"))),
        }
    }
}

pub(crate) fn server_event() -> VoiceServerEvent {
    VoiceServerEvent {
        token: "token".to_string(),
        guild_id: "1".to_string(),
        endpoint: "voice.example".to_string(),
    }
}
