use serde::{Deserialize, Serialize};

// Client -> Server opcodes
pub const OP_IDENTIFY: u8 = 0;
pub const OP_VOICE_UPDATE: u8 = 1;
pub const OP_PLAY: u8 = 2;
pub const OP_PAUSE: u8 = 3;
pub const OP_RESUME: u8 = 4;
pub const OP_STOP: u8 = 5;
pub const OP_SEEK: u8 = 6;
pub const OP_DISCONNECT: u8 = 7;
pub const OP_PING: u8 = 8;
pub const OP_VOLUME: u8 = 9;
pub const OP_PLAYER_MIGRATE: u8 = 10;

// Server -> Client opcodes
pub const OP_READY: u8 = 0;
pub const OP_PLAYER_UPDATE: u8 = 1;
pub const OP_TRACK_START: u8 = 2;
pub const OP_TRACK_END: u8 = 3;
pub const OP_TRACK_ERROR: u8 = 4;
pub const OP_VOICE_CONNECT: u8 = 5;
pub const OP_VOICE_DISCONNECT: u8 = 6;
pub const OP_PONG: u8 = 7;
pub const OP_STATS: u8 = 8;
pub const OP_NODE_DRAINING: u8 = 9;
pub const OP_MIGRATE_READY: u8 = 10;

/// Why a track stopped producing frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackEndReason {
    Finished,
    Stopped,
    Replaced,
    Error,
    Cleanup,
}

impl TrackEndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackEndReason::Finished => "finished",
            TrackEndReason::Stopped => "stopped",
            TrackEndReason::Replaced => "replaced",
            TrackEndReason::Error => "error",
            TrackEndReason::Cleanup => "cleanup",
        }
    }
}

/// Logical player state as reported in PlayerUpdate frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerStateKind {
    Idle,
    Playing,
    Paused,
}

impl PlayerStateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PlayerStateKind::Idle => "idle",
            PlayerStateKind::Playing => "playing",
            PlayerStateKind::Paused => "paused",
        }
    }
}
