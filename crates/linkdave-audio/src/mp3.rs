use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Mutex, OnceLock};

use symphonia::core::io::ReadOnlySource;
use symphonia::core::probe::Hint;
use ureq::http::StatusCode;

use crate::opus::OpusEncoder;
use crate::pcm::PcmReader;
use crate::resample::{input_frame_bytes, resample_linear};
use crate::source::{Source, SourceError};
use crate::{FRAME_DURATION_MS, FRAME_SAMPLES, SAMPLE_RATE};

const USER_AGENT: &str = "LinkDave/1.0";

fn http_agent() -> &'static ureq::Agent {
    static AGENT: OnceLock<ureq::Agent> = OnceLock::new();
    AGENT.get_or_init(|| {
        ureq::Agent::config_builder()
            .http_status_as_error(false)
            .build()
            .new_agent()
    })
}

/// Streaming MP3 source: one GET, decode, resample to 48 kHz stereo, encode
/// 20 ms Opus frames on demand.
pub struct Mp3Source {
    url: String,
    position_ms: AtomicI64,
    closed: AtomicBool,
    inner: Mutex<Option<Inner>>,
}

struct Inner {
    pcm: PcmReader,
    encoder: OpusEncoder,
    /// Exactly `input_frame_bytes(src_rate)` bytes read per frame.
    pcm_buf: Vec<u8>,
    samples: Vec<i16>,
    frame: Vec<i16>,
    ratio: f64,
    /// The previous read came up short; the next call reports EOF.
    finished: bool,
}

/// The HTTP body reader, locked so the media source is shareable across the
/// frame mutex.
struct SyncBody(Mutex<Box<dyn Read + Send>>);

impl Read for SyncBody {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().read(buf)
    }
}

impl Mp3Source {
    /// Issue the GET and set up the decode pipeline.
    ///
    /// `start_time_ms` is accepted for wire compatibility; an HTTP stream
    /// cannot be repositioned, so decoding starts at the stream head.
    pub fn open(url: &str, _start_time_ms: i64) -> Result<Mp3Source, SourceError> {
        let resp = http_agent()
            .get(url)
            .header("User-Agent", USER_AGENT)
            .call()
            .map_err(|e| SourceError::Http(e.to_string()))?;

        let status = resp.status();
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(SourceError::HttpStatus(status.as_u16()));
        }

        let (_, body) = resp.into_parts();
        let reader = SyncBody(Mutex::new(Box::new(body.into_reader())));

        let mut hint = Hint::new();
        hint.with_extension("mp3").mime_type("audio/mpeg");

        let pcm = PcmReader::new(Box::new(ReadOnlySource::new(reader)), hint)?;
        let src_rate = pcm.sample_rate();
        let ratio = SAMPLE_RATE as f64 / src_rate as f64;
        let frame_bytes = input_frame_bytes(src_rate);

        tracing::debug!(url, src_rate, frame_bytes, "mp3 source opened");

        Ok(Mp3Source {
            url: url.to_string(),
            position_ms: AtomicI64::new(0),
            closed: AtomicBool::new(false),
            inner: Mutex::new(Some(Inner {
                pcm,
                encoder: OpusEncoder::new()?,
                pcm_buf: vec![0u8; frame_bytes],
                samples: vec![0i16; frame_bytes / 2],
                frame: vec![0i16; FRAME_SAMPLES],
                ratio,
                finished: false,
            })),
        })
    }
}

impl Source for Mp3Source {
    fn next_opus_frame(&self) -> Result<Option<Vec<u8>>, SourceError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }

        let mut guard = self.inner.lock().unwrap();
        let inner = match guard.as_mut() {
            Some(inner) => inner,
            None => return Ok(None),
        };
        if inner.finished {
            return Ok(None);
        }

        let n = inner.pcm.read_pcm(&mut inner.pcm_buf)?;
        if n == 0 {
            inner.finished = true;
            return Ok(None);
        }
        if n < inner.pcm_buf.len() {
            // Partial read at end of stream: pad with silence and emit one
            // final frame.
            inner.pcm_buf[n..].fill(0);
            inner.finished = true;
        }

        for (i, chunk) in inner.pcm_buf.chunks_exact(2).enumerate() {
            inner.samples[i] = i16::from_le_bytes([chunk[0], chunk[1]]);
        }

        if (inner.ratio - 1.0).abs() > f64::EPSILON {
            resample_linear(&inner.samples, &mut inner.frame, inner.ratio);
        } else {
            inner.frame.copy_from_slice(&inner.samples);
        }

        let packet = inner.encoder.encode(&inner.frame)?;
        self.position_ms
            .fetch_add(FRAME_DURATION_MS, Ordering::Release);
        Ok(Some(packet))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Dropping the pipeline hangs up the HTTP body.
        let mut guard = self.inner.lock().unwrap();
        *guard = None;
    }

    fn position_ms(&self) -> i64 {
        self.position_ms.load(Ordering::Acquire)
    }

    fn seek(&self, _position_ms: i64) -> Result<(), SourceError> {
        Err(SourceError::SeekUnsupported)
    }

    fn duration_ms(&self) -> i64 {
        0
    }

    fn can_seek(&self) -> bool {
        false
    }

    fn url(&self) -> String {
        self.url.clone()
    }
}
