//! Adapter from symphonia's packet decoder to a flat PCM byte reader.
//!
//! Downstream always sees interleaved s16le stereo at the source sample rate;
//! mono input is upmixed by duplicating each sample across both channels.

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::source::SourceError;
use crate::CHANNELS;

pub(crate) struct PcmReader {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    channels: usize,
    /// Interleaved stereo samples decoded but not yet handed out.
    pending: Vec<i16>,
    pending_pos: usize,
    eof: bool,
}

impl PcmReader {
    pub(crate) fn new(source: Box<dyn MediaSource>, hint: Hint) -> Result<PcmReader, SourceError> {
        let mss = MediaSourceStream::new(source, Default::default());
        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| SourceError::DecoderInit(e.to_string()))?;

        let format = probed.format;
        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| SourceError::DecoderInit("no audio track".to_string()))?;

        let sample_rate = track
            .codec_params
            .sample_rate
            .ok_or_else(|| SourceError::DecoderInit("unknown sample rate".to_string()))?;
        let channels = track
            .codec_params
            .channels
            .map(|c| c.count())
            .ok_or_else(|| SourceError::DecoderInit("unknown channel layout".to_string()))?;

        let track_id = track.id;
        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| SourceError::DecoderInit(e.to_string()))?;

        Ok(PcmReader {
            format,
            decoder,
            track_id,
            sample_rate,
            channels,
            pending: Vec::new(),
            pending_pos: 0,
            eof: false,
        })
    }

    pub(crate) fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Fill `out` with s16le stereo bytes. Returns the bytes written; fewer
    /// than `out.len()` means the stream ended mid-frame, zero means EOF.
    pub(crate) fn read_pcm(&mut self, out: &mut [u8]) -> Result<usize, SourceError> {
        let mut written = 0;
        while written < out.len() {
            if self.pending_pos >= self.pending.len() {
                if self.eof || !self.decode_next()? {
                    break;
                }
            }

            let available = &self.pending[self.pending_pos..];
            let want_samples = (out.len() - written) / 2;
            let take = want_samples.min(available.len());
            for sample in &available[..take] {
                let bytes = sample.to_le_bytes();
                out[written] = bytes[0];
                out[written + 1] = bytes[1];
                written += 2;
            }
            self.pending_pos += take;
        }
        Ok(written)
    }

    /// Decode one packet into `pending`. Returns false on end of stream.
    fn decode_next(&mut self) -> Result<bool, SourceError> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    self.eof = true;
                    return Ok(false);
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.eof = true;
                    return Ok(false);
                }
                Err(e) => return Err(SourceError::Read(e.to_string())),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                // Recoverable per symphonia's contract: skip the packet.
                Err(SymphoniaError::DecodeError(_)) => continue,
                Err(e) => return Err(SourceError::Read(e.to_string())),
            };

            if decoded.frames() == 0 {
                continue;
            }

            let mut sample_buf = SampleBuffer::<i16>::new(decoded.frames() as u64, *decoded.spec());
            sample_buf.copy_interleaved_ref(decoded);

            self.pending.clear();
            self.pending_pos = 0;
            interleave_to_stereo(sample_buf.samples(), self.channels, &mut self.pending);
            return Ok(true);
        }
    }
}

/// Re-lay interleaved `channels`-wide samples as interleaved stereo.
pub(crate) fn interleave_to_stereo(samples: &[i16], channels: usize, out: &mut Vec<i16>) {
    match channels {
        0 => {}
        1 => {
            out.reserve(samples.len() * 2);
            for &s in samples {
                out.push(s);
                out.push(s);
            }
        }
        CHANNELS => out.extend_from_slice(samples),
        n => {
            // More than two channels: keep the front pair of each frame.
            out.reserve(samples.len() / n * 2);
            for frame in samples.chunks_exact(n) {
                out.push(frame[0]);
                out.push(frame[1]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mono_upmix_duplicates_samples() {
        let mut out = Vec::new();
        interleave_to_stereo(&[1, -2, 3], 1, &mut out);
        assert_eq!(out, vec![1, 1, -2, -2, 3, 3]);
    }

    #[test]
    fn stereo_passes_through() {
        let mut out = Vec::new();
        interleave_to_stereo(&[1, 2, 3, 4], 2, &mut out);
        assert_eq!(out, vec![1, 2, 3, 4]);
    }

    #[test]
    fn surround_keeps_front_pair() {
        let mut out = Vec::new();
        interleave_to_stereo(&[1, 2, 9, 3, 4, 9], 3, &mut out);
        assert_eq!(out, vec![1, 2, 3, 4]);
    }
}
