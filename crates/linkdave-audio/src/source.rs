use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),
    #[error("source scheme disabled: {0}")]
    SchemeDisabled(String),
    #[error("source address blocked: {0}")]
    AddressBlocked(String),
    #[error("invalid source url: {0}")]
    InvalidUrl(String),
    #[error("fetch audio: {0}")]
    Http(String),
    #[error("unexpected status: {0}")]
    HttpStatus(u16),
    #[error("create mp3 decoder: {0}")]
    DecoderInit(String),
    #[error("read pcm: {0}")]
    Read(String),
    #[error("encode opus: {0}")]
    Encode(String),
    #[error("seek not supported for HTTP streams")]
    SeekUnsupported,
}

/// A playable audio stream owned by at most one voice connection at a time.
///
/// `next_opus_frame` returns `Ok(Some(frame))` for a 20 ms Opus frame,
/// `Ok(None)` at end of stream, and `Err` for fatal read/decode/encode
/// failures. After `close()` every call returns `Ok(None)`.
pub trait Source: Send + Sync {
    fn next_opus_frame(&self) -> Result<Option<Vec<u8>>, SourceError>;

    /// Idempotent; safe to call concurrently with `next_opus_frame`.
    fn close(&self);

    /// Playback position in milliseconds, advanced 20 ms per produced frame.
    fn position_ms(&self) -> i64;

    fn seek(&self, position_ms: i64) -> Result<(), SourceError>;

    /// Total duration in milliseconds, 0 if unknown.
    fn duration_ms(&self) -> i64;

    fn can_seek(&self) -> bool;

    fn url(&self) -> String;
}

/// Builds sources from URLs. The node server calls this off the async runtime;
/// implementations may block on network I/O.
pub trait SourceFactory: Send + Sync {
    fn create_from_url(
        &self,
        url: &str,
        start_time_ms: i64,
    ) -> Result<Arc<dyn Source>, SourceError>;
}
