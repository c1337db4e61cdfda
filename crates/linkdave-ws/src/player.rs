use std::sync::Mutex;
use std::time::Instant;

use linkdave_protocol::{PlayerStateKind, Snowflake};

const MAX_VOLUME: i64 = 1000;
const DEFAULT_VOLUME: i64 = 100;

/// Per-(session, guild) logical player state.
///
/// Pure data behind a mutex; the voice manager owns the live audio, this
/// records what the controller has been told.
pub struct PlayerState {
    guild_id: Snowflake,
    inner: Mutex<Inner>,
}

struct Inner {
    state: PlayerStateKind,
    current_url: String,
    position_ms: i64,
    volume: i64,
    started_at: Instant,
    channel_id: Snowflake,
}

impl PlayerState {
    pub fn new(guild_id: Snowflake) -> PlayerState {
        PlayerState {
            guild_id,
            inner: Mutex::new(Inner {
                state: PlayerStateKind::Idle,
                current_url: String::new(),
                position_ms: 0,
                volume: DEFAULT_VOLUME,
                started_at: Instant::now(),
                channel_id: Snowflake::default(),
            }),
        }
    }

    pub fn guild_id(&self) -> Snowflake {
        self.guild_id
    }

    pub fn set_channel_id(&self, channel_id: Snowflake) {
        self.inner.lock().unwrap().channel_id = channel_id;
    }

    pub fn channel_id(&self) -> Snowflake {
        self.inner.lock().unwrap().channel_id
    }

    pub fn set_playing(&self, url: &str, position_ms: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = PlayerStateKind::Playing;
        inner.current_url = url.to_string();
        inner.position_ms = position_ms;
        inner.started_at = Instant::now();
    }

    pub fn set_paused(&self, position_ms: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = PlayerStateKind::Paused;
        inner.position_ms = position_ms;
    }

    /// Back to playing after a pause or seek, restarting the wall clock.
    pub fn set_resumed(&self, position_ms: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = PlayerStateKind::Playing;
        inner.position_ms = position_ms;
        inner.started_at = Instant::now();
    }

    /// New position reference after a seek; the state is left alone.
    pub fn refresh_position(&self, position_ms: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.position_ms = position_ms;
        inner.started_at = Instant::now();
    }

    pub fn set_idle(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = PlayerStateKind::Idle;
        inner.current_url = String::new();
        inner.position_ms = 0;
    }

    pub fn set_volume(&self, volume: i64) {
        self.inner.lock().unwrap().volume = volume.clamp(0, MAX_VOLUME);
    }

    pub fn is_playing(&self) -> bool {
        self.inner.lock().unwrap().state == PlayerStateKind::Playing
    }

    /// (state, position, volume) for a PlayerUpdate reply.
    pub fn update_data(&self) -> (PlayerStateKind, i64, i64) {
        let inner = self.inner.lock().unwrap();
        (inner.state, inner.position_ms, inner.volume)
    }

    /// Snapshot for migration: the live position only advances while playing;
    /// paused and idle players report their stored position unchanged.
    pub fn migrate_snapshot(&self) -> (String, i64, i64, PlayerStateKind) {
        let inner = self.inner.lock().unwrap();
        let position = match inner.state {
            PlayerStateKind::Playing => {
                inner.position_ms + inner.started_at.elapsed().as_millis() as i64
            }
            _ => inner.position_ms,
        };
        (inner.current_url.clone(), position, inner.volume, inner.state)
    }
}
