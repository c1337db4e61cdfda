use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use linkdave_audio::{Source, SourceError};
use linkdave_protocol::{Snowflake, TrackEndReason, VoiceServerEvent};

use crate::error::VoiceError;
use crate::socket::{OpusFrameProvider, VoiceSocket, VoiceSocketFactory, VoiceStateUpdate};

/// Some voice transports deadlock if the credential updates arrive on the
/// task that is blocking in `open`; defer them briefly on a separate task.
const HANDSHAKE_FEED_DELAY: Duration = Duration::from_millis(50);
const OLD_SOCKET_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
const SOCKET_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

pub type TrackEndCallback =
    Box<dyn Fn(Arc<dyn Source>, TrackEndReason, Option<SourceError>) + Send + Sync>;
pub type DisconnectCallback = Box<dyn Fn() + Send + Sync>;

/// Owns one voice socket and at most one active source for a (bot, guild).
pub struct VoiceConnection {
    bot_id: Snowflake,
    guild_id: Snowflake,
    factory: Arc<dyn VoiceSocketFactory>,
    state: Mutex<ConnState>,
    paused: AtomicBool,
    closed: AtomicBool,
    /// Serializes socket setup/reconfiguration.
    setup_lock: tokio::sync::Mutex<()>,
    on_track_end: TrackEndCallback,
    on_disconnect: DisconnectCallback,
}

struct ConnState {
    socket: Option<Arc<dyn VoiceSocket>>,
    source: Option<Arc<dyn Source>>,
    channel_id: Snowflake,
}

impl VoiceConnection {
    /// Open the voice socket and block until the handshake completes.
    #[allow(clippy::too_many_arguments)]
    pub async fn connect(
        factory: Arc<dyn VoiceSocketFactory>,
        bot_id: Snowflake,
        guild_id: Snowflake,
        channel_id: Snowflake,
        session_id: String,
        event: VoiceServerEvent,
        on_track_end: TrackEndCallback,
        on_disconnect: DisconnectCallback,
        timeout: Duration,
    ) -> Result<Arc<VoiceConnection>, VoiceError> {
        let conn = Arc::new(VoiceConnection {
            bot_id,
            guild_id,
            factory,
            state: Mutex::new(ConnState {
                socket: None,
                source: None,
                channel_id,
            }),
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            setup_lock: tokio::sync::Mutex::new(()),
            on_track_end,
            on_disconnect,
        });
        conn.setup_socket(channel_id, session_id, event, timeout)
            .await?;
        Ok(conn)
    }

    /// Channel move or voice-server rotation: build a new socket, swap it in,
    /// and close the old one in the background.
    pub async fn handle_voice_update(
        self: &Arc<Self>,
        channel_id: Snowflake,
        session_id: String,
        event: VoiceServerEvent,
        timeout: Duration,
    ) -> Result<(), VoiceError> {
        tracing::info!(
            guild_id = %self.guild_id,
            new_channel_id = %channel_id,
            "handling voice update (channel move/server change)"
        );
        self.setup_socket(channel_id, session_id, event, timeout)
            .await
    }

    async fn setup_socket(
        self: &Arc<Self>,
        channel_id: Snowflake,
        session_id: String,
        event: VoiceServerEvent,
        timeout: Duration,
    ) -> Result<(), VoiceError> {
        let _guard = self.setup_lock.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(VoiceError::Closed);
        }

        let socket = self.factory.create(self.bot_id, self.guild_id);

        // The close handler only fires on_disconnect while this socket is
        // still the current one; a swapped-out socket closing is routine.
        let conn_weak = Arc::downgrade(self);
        let socket_weak = Arc::downgrade(&socket);
        socket.set_close_handler(Box::new(move || {
            let Some(conn) = conn_weak.upgrade() else {
                return;
            };
            let Some(socket) = socket_weak.upgrade() else {
                return;
            };
            if conn.closed.load(Ordering::Acquire) {
                return;
            }
            let is_current = {
                let state = conn.state.lock().unwrap();
                state
                    .socket
                    .as_ref()
                    .is_some_and(|current| Arc::ptr_eq(current, &socket))
            };
            if is_current {
                (conn.on_disconnect)();
            }
        }));

        let feed_socket = socket.clone();
        let state_update = VoiceStateUpdate {
            guild_id: self.guild_id,
            channel_id,
            user_id: self.bot_id,
            session_id,
        };
        tokio::spawn(async move {
            tokio::time::sleep(HANDSHAKE_FEED_DELAY).await;
            feed_socket.handle_state_update(state_update);
            feed_socket.handle_server_update(event);
        });

        socket.open(timeout).await?;

        let (old_socket, source) = {
            let mut state = self.state.lock().unwrap();
            let old = state.socket.replace(socket.clone());
            state.channel_id = channel_id;
            (old, state.source.clone())
        };

        if let Some(old) = old_socket {
            tokio::spawn(async move {
                let _ = tokio::time::timeout(OLD_SOCKET_CLOSE_TIMEOUT, old.close()).await;
            });
        }

        if let Some(source) = source {
            socket.set_frame_provider(Some(self.track_provider(source)));
        }

        Ok(())
    }

    /// Install a new source, detaching and closing any current one first.
    pub fn play(self: &Arc<Self>, source: Arc<dyn Source>) {
        let (old_source, socket) = {
            let mut state = self.state.lock().unwrap();
            let old = state.source.replace(source.clone());
            (old, state.socket.clone())
        };

        if let Some(old) = old_source {
            old.close();
            (self.on_track_end)(old, TrackEndReason::Replaced, None);
        }

        self.paused.store(false, Ordering::Release);

        if let Some(socket) = socket {
            socket.set_frame_provider(Some(self.track_provider(source)));
        }

        tracing::debug!(guild_id = %self.guild_id, "started playback");
    }

    /// Detach the frame provider; the source stays installed.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        let socket = self.state.lock().unwrap().socket.clone();
        if let Some(socket) = socket {
            socket.set_frame_provider(None);
        }
    }

    pub fn resume(self: &Arc<Self>) {
        self.paused.store(false, Ordering::Release);
        let (socket, source) = {
            let state = self.state.lock().unwrap();
            (state.socket.clone(), state.source.clone())
        };
        if let (Some(socket), Some(source)) = (socket, source) {
            socket.set_frame_provider(Some(self.track_provider(source)));
        }
    }

    /// Close and detach the current source, reporting it as stopped.
    pub fn stop(&self) {
        let (old_source, socket) = {
            let mut state = self.state.lock().unwrap();
            (state.source.take(), state.socket.clone())
        };

        if let Some(socket) = socket {
            socket.set_frame_provider(None);
        }
        if let Some(old) = old_source {
            old.close();
            (self.on_track_end)(old, TrackEndReason::Stopped, None);
        }
    }

    pub fn seek(&self, position_ms: i64) -> Result<(), VoiceError> {
        let source = self.state.lock().unwrap().source.clone();
        match source {
            Some(source) => Ok(source.seek(position_ms)?),
            None => Err(VoiceError::NoActiveSource),
        }
    }

    pub fn position(&self) -> i64 {
        let source = self.state.lock().unwrap().source.clone();
        source.map_or(0, |s| s.position_ms())
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn channel_id(&self) -> Snowflake {
        self.state.lock().unwrap().channel_id
    }

    /// Idempotent; stops playback and closes the socket with a bounded wait.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop();

        let socket = self.state.lock().unwrap().socket.take();
        if let Some(socket) = socket {
            let _ = tokio::time::timeout(SOCKET_CLOSE_TIMEOUT, socket.close()).await;
        }
        tracing::debug!(guild_id = %self.guild_id, "voice connection closed");
    }

    fn track_provider(self: &Arc<Self>, source: Arc<dyn Source>) -> Arc<dyn OpusFrameProvider> {
        Arc::new(TrackWrapper {
            source,
            conn: Arc::downgrade(self),
        })
    }

    /// Terminal handling for a source that hit EOF or a fatal error. Fires the
    /// callback only while the source is still the current one; `play` and
    /// `stop` have already reported replaced/stopped sources.
    fn handle_track_end(&self, source: &Arc<dyn Source>, error: Option<SourceError>) {
        let socket = {
            let mut state = self.state.lock().unwrap();
            let is_current = state
                .source
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, source));
            if !is_current {
                return;
            }
            state.source = None;
            state.socket.clone()
        };

        if let Some(socket) = socket {
            socket.set_frame_provider(None);
        }
        source.close();

        let reason = if error.is_some() {
            TrackEndReason::Error
        } else {
            TrackEndReason::Finished
        };
        (self.on_track_end)(source.clone(), reason, error);
    }
}

struct TrackWrapper {
    source: Arc<dyn Source>,
    conn: Weak<VoiceConnection>,
}

impl OpusFrameProvider for TrackWrapper {
    fn provide(&self) -> Option<Vec<u8>> {
        let conn = self.conn.upgrade()?;
        match self.source.next_opus_frame() {
            Ok(Some(frame)) => Some(frame),
            Ok(None) => {
                conn.handle_track_end(&self.source, None);
                None
            }
            Err(e) => {
                conn.handle_track_end(&self.source, Some(e));
                None
            }
        }
    }
}
