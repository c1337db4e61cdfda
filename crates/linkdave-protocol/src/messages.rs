use serde::{Deserialize, Serialize};

use crate::id::Snowflake;
use crate::opcodes::{PlayerStateKind, TrackEndReason};

/// The base WebSocket frame: opcode plus an optional payload object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub op: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<serde_json::Value>,
}

impl Message {
    /// Build a frame from a serializable payload.
    ///
    /// Serialization of the payload types in this module cannot fail; a frame
    /// with no payload (Pong) uses [`Message::empty`].
    pub fn new<T: Serialize>(op: u8, payload: &T) -> Message {
        Message {
            op,
            d: serde_json::to_value(payload).ok(),
        }
    }

    pub fn empty(op: u8) -> Message {
        Message { op, d: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyData {
    pub bot_id: Snowflake,
}

/// The server half of a voice credential set, relayed verbatim from the
/// chat-platform gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceServerEvent {
    pub token: String,
    pub guild_id: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceUpdateData {
    pub guild_id: Snowflake,
    pub channel_id: Snowflake,
    pub session_id: String,
    pub event: VoiceServerEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayData {
    pub guild_id: Snowflake,
    pub url: String,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub start_time: i64,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub volume: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuildData {
    pub guild_id: Snowflake,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeekData {
    pub guild_id: Snowflake,
    pub position: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeData {
    pub guild_id: Snowflake,
    pub volume: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyData {
    pub session_id: String,
    pub resumed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerUpdateData {
    pub guild_id: Snowflake,
    pub state: PlayerStateKind,
    pub position: i64,
    pub volume: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackInfo {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub duration: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackStartData {
    pub guild_id: Snowflake,
    pub track: TrackInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackEndData {
    pub guild_id: Snowflake,
    pub track: TrackInfo,
    pub reason: TrackEndReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackErrorData {
    pub guild_id: Snowflake,
    #[serde(default)]
    pub track: TrackInfo,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConnectData {
    pub guild_id: Snowflake,
    pub channel_id: Snowflake,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceDisconnectData {
    pub guild_id: Snowflake,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsData {
    pub players: usize,
    pub playing_tracks: usize,
    pub uptime: i64,
    pub memory_used: u64,
    pub memory_alloc: u64,
    pub cpu_usage: f64,
    pub draining: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDrainingData {
    pub reason: String,
    pub deadline_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateReadyData {
    pub guild_id: Snowflake,
    pub url: String,
    pub position: i64,
    pub volume: i64,
    pub state: PlayerStateKind,
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}
