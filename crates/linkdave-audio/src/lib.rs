//! Audio sources: streaming MP3 over HTTP decoded into 20 ms Opus frames.
//!
//! A [`Source`] is pull-driven: the voice transport asks for one Opus frame at
//! a time on its own clock. The MP3 path fetches the remote body once, decodes
//! packets to interleaved s16le stereo PCM at the source rate, linearly
//! resamples to 48 kHz when needed, and encodes each 960-sample stereo frame.

mod config;
mod factory;
mod mp3;
mod opus;
mod pcm;
mod resample;
mod source;

pub use config::SourceConfig;
pub use factory::HttpSourceFactory;
pub use mp3::Mp3Source;
pub use opus::OpusEncoder;
pub use resample::{input_frame_bytes, resample_linear};
pub use source::{Source, SourceError, SourceFactory};

/// 48 kHz sample rate (native for Opus, expected by the chat platform).
pub const SAMPLE_RATE: u32 = 48_000;
/// Stereo output.
pub const CHANNELS: usize = 2;
/// 20 ms frame at 48 kHz = 960 samples per channel.
pub const FRAME_SIZE: usize = 960;
/// Interleaved samples per frame.
pub const FRAME_SAMPLES: usize = FRAME_SIZE * CHANNELS;
/// PCM bytes needed for one Opus frame: 960 samples * 2 channels * 2 bytes.
pub const PCM_FRAME_BYTES: usize = FRAME_SAMPLES * 2;
/// Milliseconds of audio per frame.
pub const FRAME_DURATION_MS: i64 = 20;
