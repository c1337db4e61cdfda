use crate::{CHANNELS, PCM_FRAME_BYTES, SAMPLE_RATE};

/// PCM bytes to read from the decoder per output frame.
///
/// `ratio = 48000 / src_rate`; the byte count is rounded up to a multiple of 4
/// so reads always end on a whole stereo s16 frame.
pub fn input_frame_bytes(src_rate: u32) -> usize {
    let ratio = SAMPLE_RATE as f64 / src_rate as f64;
    let bytes = (PCM_FRAME_BYTES as f64 / ratio) as usize;
    (bytes + 3) / 4 * 4
}

/// Per-channel linear interpolation from the source rate to 48 kHz.
///
/// For each output sample index `i`, `src_pos = i / ratio`; the sample is
/// interpolated between `floor(src_pos)` and `floor(src_pos) + 1`, clamped so
/// the last output never reads past the input buffer. Input and output are
/// interleaved stereo.
pub fn resample_linear(input: &[i16], output: &mut [i16], ratio: f64) {
    let input_len = input.len() / CHANNELS;
    let output_len = output.len() / CHANNELS;

    for i in 0..output_len {
        let src_pos = i as f64 / ratio;
        let mut src_idx = src_pos as usize;
        let mut frac = src_pos - src_idx as f64;

        if src_idx + 1 >= input_len {
            src_idx = input_len.saturating_sub(2);
            frac = 1.0;
        }

        for ch in 0..CHANNELS {
            let idx0 = src_idx * CHANNELS + ch;
            let mut idx1 = (src_idx + 1) * CHANNELS + ch;
            if idx1 >= input.len() {
                idx1 = idx0;
            }

            let sample0 = input[idx0] as f64;
            let sample1 = input[idx1] as f64;
            let interpolated = sample0 + frac * (sample1 - sample0);
            output[i * CHANNELS + ch] = interpolated as i16;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FRAME_SAMPLES, FRAME_SIZE};

    #[test]
    fn input_frame_bytes_at_48k_is_full_frame() {
        assert_eq!(input_frame_bytes(48_000), PCM_FRAME_BYTES);
    }

    #[test]
    fn input_frame_bytes_at_44100_is_multiple_of_four() {
        let bytes = input_frame_bytes(44_100);
        assert_eq!(bytes % 4, 0);
        assert_eq!(bytes, 3528);
    }

    #[test]
    fn ratio_one_is_bit_identical() {
        let input: Vec<i16> = (0..FRAME_SAMPLES as i32)
            .map(|i| ((i * 37) % 4096 - 2048) as i16)
            .collect();
        let mut output = vec![0i16; FRAME_SAMPLES];
        resample_linear(&input, &mut output, 1.0);
        assert_eq!(input, output);
    }

    /// Single-bin DFT magnitude at `freq` over interleaved stereo samples.
    fn bin_magnitude(samples: &[i16], freq: f64, rate: f64) -> f64 {
        let frames = samples.len() / CHANNELS;
        let (mut re, mut im) = (0.0f64, 0.0f64);
        for n in 0..frames {
            let s = samples[n * CHANNELS] as f64;
            let phase = 2.0 * std::f64::consts::PI * freq * n as f64 / rate;
            re += s * phase.cos();
            im += s * phase.sin();
        }
        (re * re + im * im).sqrt()
    }

    #[test]
    fn sine_survives_44100_to_48000() {
        let src_rate = 44_100.0;
        let tone = 1_000.0;
        let ratio = 48_000.0 / src_rate;

        let input_frames = input_frame_bytes(44_100) / (CHANNELS * 2);
        let mut input = Vec::with_capacity(input_frames * CHANNELS);
        for n in 0..input_frames {
            let s = (2.0 * std::f64::consts::PI * tone * n as f64 / src_rate).sin();
            let v = (s * 8000.0) as i16;
            input.push(v);
            input.push(v);
        }

        let mut output = vec![0i16; FRAME_SAMPLES];
        resample_linear(&input, &mut output, ratio);

        // The tone bin must dominate; the bin resolution over 960 frames at
        // 48 kHz is 50 Hz, so check the expected bin against ones far away.
        let rate = 48_000.0;
        let peak = bin_magnitude(&output, tone, rate);
        for off_tone in [500.0, 2_000.0, 4_000.0] {
            let off = bin_magnitude(&output, off_tone, rate);
            assert!(
                peak > off * 4.0,
                "tone bin {tone} ({peak:.0}) not dominant over {off_tone} ({off:.0})"
            );
        }

        // Within +-1 bin of expected: the neighbours may carry leakage but the
        // exact bin must be at least as large as bins two steps away.
        let two_bins_up = bin_magnitude(&output, tone + 100.0, rate);
        assert!(peak > two_bins_up * 2.0);
    }

    #[test]
    fn clamps_final_samples_to_input_tail() {
        // Upsampling: the last output samples interpolate toward the final
        // input sample instead of reading past the buffer.
        let input = vec![100i16; 8 * CHANNELS];
        let mut output = vec![0i16; FRAME_SIZE * CHANNELS];
        resample_linear(&input, &mut output, (FRAME_SIZE / 8) as f64);
        assert!(output.iter().all(|&s| s == 100));
    }
}
