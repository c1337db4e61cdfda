// Opus encode wrapper for the playback path.

use audiopus::coder::Encoder as OpusEncoderInner;
use audiopus::{Application, Channels, SampleRate};

use crate::source::SourceError;
use crate::FRAME_SAMPLES;

/// Maximum Opus packet size (recommended by RFC 6716).
const MAX_PACKET_SIZE: usize = 4000;

/// Opus encoder configured for music at 48 kHz stereo.
///
/// The encode scratch is allocated once; each call returns an owned copy of
/// the written prefix so frames outlive the encoder lock.
pub struct OpusEncoder {
    inner: OpusEncoderInner,
    encode_buf: Vec<u8>,
}

impl OpusEncoder {
    pub fn new() -> Result<Self, SourceError> {
        let encoder =
            OpusEncoderInner::new(SampleRate::Hz48000, Channels::Stereo, Application::Audio)
                .map_err(|e| SourceError::Encode(e.to_string()))?;

        Ok(Self {
            inner: encoder,
            encode_buf: vec![0u8; MAX_PACKET_SIZE],
        })
    }

    /// Encode one 20 ms frame of interleaved s16 stereo (1920 samples).
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, SourceError> {
        if pcm.len() != FRAME_SAMPLES {
            return Err(SourceError::Encode(format!(
                "frame size mismatch: expected {FRAME_SAMPLES}, got {}",
                pcm.len()
            )));
        }

        let len = self
            .inner
            .encode(pcm, &mut self.encode_buf)
            .map_err(|e| SourceError::Encode(e.to_string()))?;
        Ok(self.encode_buf[..len].to_vec())
    }
}
