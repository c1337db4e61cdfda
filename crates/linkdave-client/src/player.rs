use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use linkdave_protocol::{
    PlayData, PlayerStateKind, PlayerUpdateData, Snowflake, TrackInfo, VoiceServerEvent,
    VoiceUpdateData,
};
use serde_json::json;

use crate::error::ClientError;
use crate::node::NodeClient;

/// The host supplies this: forward a payload to the chat-platform gateway for
/// the given guild's shard.
pub(crate) type GatewaySend = dyn Fn(Snowflake, serde_json::Value) + Send + Sync;

/// Chat-platform gateway opcode for a voice state update.
const GATEWAY_OP_VOICE_STATE: u8 = 4;

/// One guild's logical player, pinned to a node until migration moves it.
pub struct Player {
    pub guild_id: Snowflake,
    node: Mutex<Arc<NodeClient>>,
    send_gateway: Arc<GatewaySend>,
    channel_id: Mutex<Option<Snowflake>>,
    self_mute: AtomicBool,
    self_deaf: AtomicBool,
    last_update: Mutex<Option<(PlayerUpdateData, Instant)>>,
    track: Mutex<Option<TrackInfo>>,
    /// Complete credentials from the last successful VoiceUpdate, replayed on
    /// the target node after a migration.
    cached_voice: Mutex<Option<CachedVoice>>,
    /// Credential halves that arrived alone so far.
    pending: Mutex<PendingVoice>,
    migrating: AtomicBool,
}

#[derive(Clone)]
struct CachedVoice {
    channel_id: Snowflake,
    session_id: String,
    token: String,
    endpoint: String,
}

#[derive(Default)]
struct PendingVoice {
    channel_id: Option<Snowflake>,
    session_id: Option<String>,
    token: Option<String>,
    endpoint: Option<String>,
}

impl Player {
    pub(crate) fn new(
        guild_id: Snowflake,
        node: Arc<NodeClient>,
        send_gateway: Arc<GatewaySend>,
    ) -> Arc<Player> {
        Arc::new(Player {
            guild_id,
            node: Mutex::new(node),
            send_gateway,
            channel_id: Mutex::new(None),
            self_mute: AtomicBool::new(false),
            self_deaf: AtomicBool::new(false),
            last_update: Mutex::new(None),
            track: Mutex::new(None),
            cached_voice: Mutex::new(None),
            pending: Mutex::new(PendingVoice::default()),
            migrating: AtomicBool::new(false),
        })
    }

    pub fn node(&self) -> Arc<NodeClient> {
        self.node.lock().unwrap().clone()
    }

    pub(crate) fn set_node(&self, node: Arc<NodeClient>) {
        *self.node.lock().unwrap() = node;
    }

    pub fn channel_id(&self) -> Option<Snowflake> {
        *self.channel_id.lock().unwrap()
    }

    pub fn is_migrating(&self) -> bool {
        self.migrating.load(Ordering::Acquire)
    }

    pub(crate) fn set_migrating(&self, migrating: bool) {
        self.migrating.store(migrating, Ordering::Release);
    }

    pub fn current_track(&self) -> Option<TrackInfo> {
        self.track.lock().unwrap().clone()
    }

    pub(crate) fn set_track(&self, track: Option<TrackInfo>) {
        *self.track.lock().unwrap() = track;
    }

    pub(crate) fn record_update(&self, update: PlayerUpdateData) {
        *self.last_update.lock().unwrap() = Some((update, Instant::now()));
    }

    pub fn last_update(&self) -> Option<PlayerUpdateData> {
        self.last_update.lock().unwrap().as_ref().map(|(u, _)| u.clone())
    }

    /// Estimated position: the last reported position plus wall-clock drift,
    /// but only while the player was reported playing. The server's own
    /// PlayerUpdate frames stay authoritative.
    pub fn position_ms(&self) -> i64 {
        let guard = self.last_update.lock().unwrap();
        match guard.as_ref() {
            Some((update, at)) if update.state == PlayerStateKind::Playing => {
                update.position + at.elapsed().as_millis() as i64
            }
            Some((update, _)) => update.position,
            None => 0,
        }
    }

    /// Ask the chat platform to join (or move within) a voice channel. The
    /// credentials come back through `Manager::handle_raw`.
    pub fn connect(&self, channel_id: Snowflake, self_mute: bool, self_deaf: bool) {
        self.self_mute.store(self_mute, Ordering::Release);
        self.self_deaf.store(self_deaf, Ordering::Release);
        (self.send_gateway)(
            self.guild_id,
            json!({
                "op": GATEWAY_OP_VOICE_STATE,
                "d": {
                    "guild_id": self.guild_id.to_string(),
                    "channel_id": channel_id.to_string(),
                    "self_mute": self_mute,
                    "self_deaf": self_deaf,
                }
            }),
        );
    }

    /// Leave the voice channel and forget local voice state.
    pub fn disconnect(&self) {
        (self.send_gateway)(
            self.guild_id,
            json!({
                "op": GATEWAY_OP_VOICE_STATE,
                "d": {
                    "guild_id": self.guild_id.to_string(),
                    "channel_id": serde_json::Value::Null,
                    "self_mute": false,
                    "self_deaf": false,
                }
            }),
        );
        *self.pending.lock().unwrap() = PendingVoice::default();
        *self.cached_voice.lock().unwrap() = None;
        *self.channel_id.lock().unwrap() = None;
        *self.last_update.lock().unwrap() = None;
        *self.track.lock().unwrap() = None;
    }

    pub fn play(&self, url: &str, start_time: i64, volume: i64) -> Result<(), ClientError> {
        self.node().play(PlayData {
            guild_id: self.guild_id,
            url: url.to_string(),
            start_time,
            volume,
        })
    }

    pub fn pause(&self) -> Result<(), ClientError> {
        self.node().pause(self.guild_id)
    }

    pub fn resume(&self) -> Result<(), ClientError> {
        self.node().resume(self.guild_id)
    }

    pub fn stop(&self) -> Result<(), ClientError> {
        self.node().stop(self.guild_id)
    }

    pub fn seek(&self, position_ms: i64) -> Result<(), ClientError> {
        self.node().seek(self.guild_id, position_ms)
    }

    pub fn set_volume(&self, volume: i64) -> Result<(), ClientError> {
        self.node().volume(self.guild_id, volume)
    }

    /// One half of the credential set from VOICE_STATE_UPDATE. A null channel
    /// means the bot left the channel; buffered fragments are dropped.
    pub(crate) fn handle_voice_state(
        &self,
        channel_id: Option<Snowflake>,
        session_id: String,
    ) -> Result<(), ClientError> {
        let Some(channel_id) = channel_id else {
            *self.pending.lock().unwrap() = PendingVoice::default();
            return Ok(());
        };

        {
            let mut pending = self.pending.lock().unwrap();
            pending.channel_id = Some(channel_id);
            pending.session_id = Some(session_id);
        }
        self.try_flush_voice()
    }

    /// The other half, from VOICE_SERVER_UPDATE. A null endpoint keeps the
    /// previous endpoint when one is known and fails otherwise.
    pub(crate) fn handle_voice_server(
        &self,
        token: String,
        endpoint: Option<String>,
    ) -> Result<(), ClientError> {
        let endpoint = match endpoint {
            Some(endpoint) => endpoint,
            None => {
                let prior = {
                    let pending = self.pending.lock().unwrap();
                    pending.endpoint.clone()
                }
                .or_else(|| {
                    self.cached_voice
                        .lock()
                        .unwrap()
                        .as_ref()
                        .map(|c| c.endpoint.clone())
                });
                prior.ok_or(ClientError::MissingEndpoint)?
            }
        };

        {
            let mut pending = self.pending.lock().unwrap();
            pending.token = Some(token);
            pending.endpoint = Some(endpoint);
        }
        self.try_flush_voice()
    }

    /// Send VoiceUpdate once all three credential pieces are present.
    fn try_flush_voice(&self) -> Result<(), ClientError> {
        let (update, cached) = {
            let pending = self.pending.lock().unwrap();
            match (
                pending.channel_id,
                pending.session_id.clone(),
                pending.token.clone(),
                pending.endpoint.clone(),
            ) {
                (Some(channel_id), Some(session_id), Some(token), Some(endpoint)) => (
                    VoiceUpdateData {
                        guild_id: self.guild_id,
                        channel_id,
                        session_id: session_id.clone(),
                        event: VoiceServerEvent {
                            token: token.clone(),
                            guild_id: self.guild_id.to_string(),
                            endpoint: endpoint.clone(),
                        },
                    },
                    CachedVoice {
                        channel_id,
                        session_id,
                        token,
                        endpoint,
                    },
                ),
                _ => return Ok(()),
            }
        };

        self.node().voice_update(update)?;

        *self.channel_id.lock().unwrap() = Some(cached.channel_id);
        *self.cached_voice.lock().unwrap() = Some(cached);
        *self.pending.lock().unwrap() = PendingVoice::default();
        Ok(())
    }

    /// Rebuild a VoiceUpdate from the cached credentials for the new node.
    pub(crate) fn cached_voice_update(&self) -> Option<VoiceUpdateData> {
        let cached = self.cached_voice.lock().unwrap().clone()?;
        Some(VoiceUpdateData {
            guild_id: self.guild_id,
            channel_id: cached.channel_id,
            session_id: cached.session_id,
            event: VoiceServerEvent {
                token: cached.token,
                guild_id: self.guild_id.to_string(),
                endpoint: cached.endpoint,
            },
        })
    }

    #[cfg(test)]
    pub(crate) fn pending_is_empty(&self) -> bool {
        let pending = self.pending.lock().unwrap();
        pending.channel_id.is_none()
            && pending.session_id.is_none()
            && pending.token.is_none()
            && pending.endpoint.is_none()
    }

    #[cfg(test)]
    pub(crate) fn pending_has_state_half(&self) -> bool {
        let pending = self.pending.lock().unwrap();
        pending.channel_id.is_some() && pending.token.is_none()
    }
}
