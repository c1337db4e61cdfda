use linkdave_audio::SourceError;
use linkdave_protocol::Snowflake;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("connection closed")]
    Closed,
    #[error("voice handshake timed out")]
    HandshakeTimeout,
    #[error("failed to open voice connection: {0}")]
    Open(String),
    #[error("no voice connection for guild {0}")]
    NotFound(Snowflake),
    #[error("no active playback")]
    NoActiveSource,
    #[error(transparent)]
    Source(#[from] SourceError),
}
