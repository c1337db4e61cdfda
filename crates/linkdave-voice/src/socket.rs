use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use linkdave_protocol::{Snowflake, VoiceServerEvent};

use crate::error::VoiceError;

/// The state half of a voice credential set, fed to a socket before `open`.
#[derive(Debug, Clone)]
pub struct VoiceStateUpdate {
    pub guild_id: Snowflake,
    pub channel_id: Snowflake,
    pub user_id: Snowflake,
    pub session_id: String,
}

/// Pull-driven frame supplier installed on a socket.
///
/// `provide` is called on the transport's 20 ms clock; `None` means nothing
/// should be sent this tick.
pub trait OpusFrameProvider: Send + Sync {
    fn provide(&self) -> Option<Vec<u8>>;
}

/// One voice transport toward the chat platform.
///
/// `open` blocks until the underlying handshake completes or the timeout
/// fires. The handshake needs both credential halves; callers feed them via
/// `handle_state_update` / `handle_server_update` concurrently with `open`.
#[async_trait]
pub trait VoiceSocket: Send + Sync {
    async fn open(&self, timeout: Duration) -> Result<(), VoiceError>;

    fn handle_state_update(&self, update: VoiceStateUpdate);

    fn handle_server_update(&self, update: VoiceServerEvent);

    fn set_frame_provider(&self, provider: Option<Arc<dyn OpusFrameProvider>>);

    /// Invoked at most once, when the transport shuts down for any reason.
    fn set_close_handler(&self, handler: Box<dyn Fn() + Send + Sync>);

    async fn close(&self);
}

pub trait VoiceSocketFactory: Send + Sync {
    fn create(&self, bot_id: Snowflake, guild_id: Snowflake) -> Arc<dyn VoiceSocket>;
}
