use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use linkdave_audio::{Source, SourceError, SourceFactory};
use linkdave_protocol::{Snowflake, TrackEndReason, VoiceServerEvent};

use crate::connection::VoiceConnection;
use crate::error::VoiceError;
use crate::socket::VoiceSocketFactory;

/// Callbacks the node server registers to fan events out to its sessions.
/// Invoked without manager locks held; implementations must not block.
pub trait VoiceEvents: Send + Sync {
    fn on_track_end(
        &self,
        bot_id: Snowflake,
        guild_id: Snowflake,
        source: Arc<dyn Source>,
        reason: TrackEndReason,
    );

    fn on_track_exception(
        &self,
        bot_id: Snowflake,
        guild_id: Snowflake,
        source: Arc<dyn Source>,
        error: &SourceError,
    );

    fn on_voice_disconnected(&self, bot_id: Snowflake, guild_id: Snowflake);
}

/// Thread-safe index of voice connections keyed by (bot, guild).
pub struct VoiceManager {
    connections: RwLock<HashMap<(Snowflake, Snowflake), Entry>>,
    handler: RwLock<Option<Arc<dyn VoiceEvents>>>,
    socket_factory: Arc<dyn VoiceSocketFactory>,
    source_factory: Arc<dyn SourceFactory>,
    conn_seq: AtomicU64,
}

struct Entry {
    conn: Arc<VoiceConnection>,
    /// Distinguishes this connection from a successor under the same key when
    /// a stale close handler fires.
    conn_id: u64,
}

impl VoiceManager {
    pub fn new(
        socket_factory: Arc<dyn VoiceSocketFactory>,
        source_factory: Arc<dyn SourceFactory>,
    ) -> Arc<VoiceManager> {
        Arc::new(VoiceManager {
            connections: RwLock::new(HashMap::new()),
            handler: RwLock::new(None),
            socket_factory,
            source_factory,
            conn_seq: AtomicU64::new(1),
        })
    }

    pub fn set_event_handler(&self, handler: Arc<dyn VoiceEvents>) {
        *self.handler.write().unwrap() = Some(handler);
    }

    fn event_handler(&self) -> Option<Arc<dyn VoiceEvents>> {
        self.handler.read().unwrap().clone()
    }

    fn get(&self, bot_id: Snowflake, guild_id: Snowflake) -> Option<Arc<VoiceConnection>> {
        self.connections
            .read()
            .unwrap()
            .get(&(bot_id, guild_id))
            .map(|e| e.conn.clone())
    }

    /// Join or move within a guild. An existing connection is reconfigured in
    /// place so the voice socket survives channel moves.
    pub async fn connect(
        self: &Arc<Self>,
        bot_id: Snowflake,
        guild_id: Snowflake,
        channel_id: Snowflake,
        session_id: String,
        event: VoiceServerEvent,
        timeout: Duration,
    ) -> Result<(), VoiceError> {
        if let Some(existing) = self.get(bot_id, guild_id) {
            return existing
                .handle_voice_update(channel_id, session_id, event, timeout)
                .await;
        }

        let conn_id = self.conn_seq.fetch_add(1, Ordering::Relaxed);
        let key = (bot_id, guild_id);

        let track_mgr = Arc::downgrade(self);
        let on_track_end = Box::new(
            move |source: Arc<dyn Source>,
                  reason: TrackEndReason,
                  error: Option<SourceError>| {
                if let Some(mgr) = track_mgr.upgrade() {
                    mgr.dispatch_track_end(bot_id, guild_id, source, reason, error);
                }
            },
        );

        let close_mgr = Arc::downgrade(self);
        let on_disconnect = Box::new(move || {
            if let Some(mgr) = close_mgr.upgrade() {
                mgr.handle_socket_closed(bot_id, guild_id, conn_id);
            }
        });

        let conn = VoiceConnection::connect(
            self.socket_factory.clone(),
            bot_id,
            guild_id,
            channel_id,
            session_id.clone(),
            event.clone(),
            on_track_end,
            on_disconnect,
            timeout,
        )
        .await?;

        // Another task may have connected this guild while ours was opening;
        // the first insert wins and the loser is closed in the background.
        let raced = {
            let mut map = self.connections.write().unwrap();
            match map.get(&key) {
                Some(existing) => Some(existing.conn.clone()),
                None => {
                    map.insert(key, Entry { conn: conn.clone(), conn_id });
                    None
                }
            }
        };

        if let Some(existing) = raced {
            tokio::spawn(async move {
                conn.close().await;
            });
            return existing
                .handle_voice_update(channel_id, session_id, event, timeout)
                .await;
        }

        Ok(())
    }

    /// Build a source for `url` and start playing it on the guild's
    /// connection. The factory may block on network I/O, so it runs off the
    /// async runtime.
    pub async fn play(
        &self,
        bot_id: Snowflake,
        guild_id: Snowflake,
        url: &str,
        start_time_ms: i64,
    ) -> Result<Arc<dyn Source>, VoiceError> {
        let conn = self
            .get(bot_id, guild_id)
            .ok_or(VoiceError::NotFound(guild_id))?;

        let factory = self.source_factory.clone();
        let url = url.to_string();
        let source = tokio::task::spawn_blocking(move || factory.create_from_url(&url, start_time_ms))
            .await
            .map_err(|e| VoiceError::Open(e.to_string()))??;

        conn.play(source.clone());
        Ok(source)
    }

    pub fn pause(&self, bot_id: Snowflake, guild_id: Snowflake) -> Result<(), VoiceError> {
        self.get(bot_id, guild_id)
            .ok_or(VoiceError::NotFound(guild_id))?
            .pause();
        Ok(())
    }

    pub fn resume(&self, bot_id: Snowflake, guild_id: Snowflake) -> Result<(), VoiceError> {
        self.get(bot_id, guild_id)
            .ok_or(VoiceError::NotFound(guild_id))?
            .resume();
        Ok(())
    }

    pub fn stop(&self, bot_id: Snowflake, guild_id: Snowflake) -> Result<(), VoiceError> {
        self.get(bot_id, guild_id)
            .ok_or(VoiceError::NotFound(guild_id))?
            .stop();
        Ok(())
    }

    pub fn seek(
        &self,
        bot_id: Snowflake,
        guild_id: Snowflake,
        position_ms: i64,
    ) -> Result<(), VoiceError> {
        self.get(bot_id, guild_id)
            .ok_or(VoiceError::NotFound(guild_id))?
            .seek(position_ms)
    }

    pub fn position(&self, bot_id: Snowflake, guild_id: Snowflake) -> i64 {
        self.get(bot_id, guild_id).map_or(0, |c| c.position())
    }

    /// Remove the connection and close it in the background.
    pub fn disconnect(&self, bot_id: Snowflake, guild_id: Snowflake) {
        let entry = self
            .connections
            .write()
            .unwrap()
            .remove(&(bot_id, guild_id));
        if let Some(entry) = entry {
            tokio::spawn(async move {
                entry.conn.close().await;
                tracing::info!(
                    bot_id = %bot_id,
                    guild_id = %guild_id,
                    "voice connection closed"
                );
            });
        }
    }

    pub async fn close(&self) {
        let entries: Vec<Entry> = {
            let mut map = self.connections.write().unwrap();
            map.drain().map(|(_, e)| e).collect()
        };
        for entry in entries {
            entry.conn.close().await;
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().unwrap().len()
    }

    fn dispatch_track_end(
        &self,
        bot_id: Snowflake,
        guild_id: Snowflake,
        source: Arc<dyn Source>,
        reason: TrackEndReason,
        error: Option<SourceError>,
    ) {
        let Some(handler) = self.event_handler() else {
            return;
        };
        if reason == TrackEndReason::Error {
            if let Some(error) = &error {
                handler.on_track_exception(bot_id, guild_id, source.clone(), error);
            }
        }
        handler.on_track_end(bot_id, guild_id, source, reason);
    }

    /// A socket close handler fired while its connection was still current.
    fn handle_socket_closed(&self, bot_id: Snowflake, guild_id: Snowflake, conn_id: u64) {
        let removed = {
            let mut map = self.connections.write().unwrap();
            match map.get(&(bot_id, guild_id)) {
                Some(entry) if entry.conn_id == conn_id => {
                    map.remove(&(bot_id, guild_id));
                    true
                }
                _ => false,
            }
        };
        if removed {
            if let Some(handler) = self.event_handler() {
                handler.on_voice_disconnected(bot_id, guild_id);
            }
        }
    }
}
