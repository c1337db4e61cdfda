use linkdave_protocol::*;

/// Typed server→client frames from one node.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    Ready(ReadyData),
    PlayerUpdate(PlayerUpdateData),
    TrackStart(TrackStartData),
    TrackEnd(TrackEndData),
    TrackError(TrackErrorData),
    VoiceConnect(VoiceConnectData),
    VoiceDisconnect(VoiceDisconnectData),
    Pong,
    Stats(StatsData),
    NodeDraining(NodeDrainingData),
    MigrateReady(MigrateReadyData),
    /// The socket closed (any reason); reconnection may follow.
    Closed { code: Option<u16>, reason: String },
}

/// What the manager surfaces to the host application.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    NodeReady {
        node: String,
        session_id: String,
    },
    NodeDraining {
        node: String,
        reason: String,
        deadline_ms: i64,
    },
    NodeClosed {
        node: String,
        code: Option<u16>,
        reason: String,
    },
    TrackStart {
        node: String,
        data: TrackStartData,
    },
    TrackEnd {
        node: String,
        data: TrackEndData,
    },
    TrackError {
        node: String,
        data: TrackErrorData,
    },
    PlayerUpdate {
        node: String,
        data: PlayerUpdateData,
    },
    VoiceConnect {
        node: String,
        data: VoiceConnectData,
    },
    VoiceDisconnect {
        node: String,
        data: VoiceDisconnectData,
    },
    PlayerMigrated {
        guild_id: Snowflake,
        from: String,
        to: String,
    },
    PlayerDestroyed {
        guild_id: Snowflake,
        reason: String,
    },
}

/// Decode one text frame. Unknown opcodes and malformed payloads are dropped
/// silently; the stream may carry noise the client does not understand.
pub(crate) fn decode_event(text: &str) -> Option<NodeEvent> {
    let msg: Message = serde_json::from_str(text).ok()?;
    let d = msg.d.unwrap_or(serde_json::Value::Null);

    let event = match msg.op {
        OP_READY => NodeEvent::Ready(serde_json::from_value(d).ok()?),
        OP_PLAYER_UPDATE => NodeEvent::PlayerUpdate(serde_json::from_value(d).ok()?),
        OP_TRACK_START => NodeEvent::TrackStart(serde_json::from_value(d).ok()?),
        OP_TRACK_END => NodeEvent::TrackEnd(serde_json::from_value(d).ok()?),
        OP_TRACK_ERROR => NodeEvent::TrackError(serde_json::from_value(d).ok()?),
        OP_VOICE_CONNECT => NodeEvent::VoiceConnect(serde_json::from_value(d).ok()?),
        OP_VOICE_DISCONNECT => NodeEvent::VoiceDisconnect(serde_json::from_value(d).ok()?),
        OP_PONG => NodeEvent::Pong,
        OP_STATS => NodeEvent::Stats(serde_json::from_value(d).ok()?),
        OP_NODE_DRAINING => NodeEvent::NodeDraining(serde_json::from_value(d).ok()?),
        OP_MIGRATE_READY => NodeEvent::MigrateReady(serde_json::from_value(d).ok()?),
        op => {
            tracing::debug!(op, "unknown server opcode");
            return None;
        }
    };
    Some(event)
}
