use std::time::Duration;

use bytes::Bytes;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};

const RESAMPLER_CHUNK_SIZE: usize = 1024;

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,                     // No cutoff frequency, pass all frequencies
        PolynomialDegree::Cubic, // Cubic interpolation for quality
        chunk_size,
        1, // 1 channel (mono)
    )?;
    Ok(resampler)
}

/// Interprets little-endian PCM16 bytes as samples normalized to -1.0..=1.0.
/// A trailing odd byte is ignored.
pub fn decode_pcm16_le(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|chunk| {
            let v = i16::from_le_bytes([chunk[0], chunk[1]]);
            (v as f32 / 32768.0).clamp(-1.0, 1.0)
        })
        .collect()
}

/// Encodes normalized samples as little-endian PCM16, clamping out-of-range
/// values.
pub fn encode_pcm16_le(samples: &[f32]) -> Bytes {
    samples
        .iter()
        .flat_map(|&sample| {
            let v = (sample * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            v.to_le_bytes()
        })
        .collect::<Vec<u8>>()
        .into()
}

/// Converts mono `samples` from `in_rate` to `out_rate`. The output is
/// aligned to the input (resampler delay removed) and holds exactly
/// `len * out_rate / in_rate` frames, rounded.
pub fn resample(samples: &[f32], in_rate: u32, out_rate: u32) -> anyhow::Result<Vec<f32>> {
    if in_rate == out_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }
    let ratio = f64::from(out_rate) / f64::from(in_rate);
    let expected = (samples.len() as f64 * ratio).round() as usize;

    let mut resampler = create_resampler(f64::from(in_rate), f64::from(out_rate), RESAMPLER_CHUNK_SIZE)?;
    let delay = resampler.output_delay();
    let mut out = Vec::with_capacity(expected + delay + RESAMPLER_CHUNK_SIZE);

    let mut chunks = samples.chunks_exact(resampler.input_frames_next());
    for chunk in &mut chunks {
        let res = resampler.process(&[chunk], None)?;
        out.extend_from_slice(&res[0]);
    }
    let tail = chunks.remainder();
    if !tail.is_empty() {
        let res = resampler.process_partial(Some(&[tail][..]), None)?;
        out.extend_from_slice(&res[0]);
    }
    // Push the delayed frames out.
    while out.len() < expected + delay {
        let res = resampler.process_partial::<&[f32]>(None, None)?;
        if res[0].is_empty() {
            break;
        }
        out.extend_from_slice(&res[0]);
    }

    let mut aligned: Vec<f32> = out.into_iter().skip(delay).take(expected).collect();
    aligned.resize(expected, 0.0);
    Ok(aligned)
}

/// Playback time of `frames` mono frames at `sample_rate`.
pub fn playback_duration(frames: usize, sample_rate: u32) -> Duration {
    Duration::from_secs_f64(frames as f64 / f64::from(sample_rate.max(1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_create_resampler() {
        assert!(create_resampler(16000.0, 24000.0, 1024).is_ok());
        assert!(create_resampler(24000.0, 24000.0, 1024).is_ok());
        assert!(create_resampler(48000.0, 24000.0, 1024).is_ok());
    }

    #[test]
    fn test_decode_pcm16_le() {
        // 16384 = 0x4000 -> 0.5; -32768 = 0x8000 -> -1.0
        let result = decode_pcm16_le(&[0x00, 0x40, 0x00, 0x80]);
        assert_eq!(result.len(), 2);
        assert_abs_diff_eq!(result[0], 0.5, epsilon = 0.0001);
        assert_abs_diff_eq!(result[1], -1.0, epsilon = 0.0001);

        assert!(decode_pcm16_le(&[]).is_empty());
        // Only 1 byte, can't form i16
        assert!(decode_pcm16_le(&[0x00]).is_empty());
    }

    #[test]
    fn test_encode_pcm16_le_clamps() {
        let encoded = encode_pcm16_le(&[0.5, 2.0, -2.0, f32::NAN]);
        assert_eq!(encoded.len(), 8);
        let decoded = decode_pcm16_le(&encoded);
        assert_abs_diff_eq!(decoded[0], 0.5, epsilon = 0.001);
        assert_abs_diff_eq!(decoded[1], 1.0, epsilon = 0.001);
        assert_abs_diff_eq!(decoded[2], -1.0, epsilon = 0.001);
        assert!(decoded.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn test_resample_identity_rate_is_passthrough() {
        let input = vec![0.1f32, -0.2, 0.3];
        assert_eq!(resample(&input, 24_000, 24_000).unwrap(), input);
    }

    #[test]
    fn test_resample_changes_length_by_ratio() {
        let input = vec![0.25f32; 2_400];
        let up = resample(&input, 24_000, 48_000).unwrap();
        assert_eq!(up.len(), 4_800);
        assert_abs_diff_eq!(up[2_400], 0.25, epsilon = 0.01);

        let down = resample(&input, 24_000, 16_000).unwrap();
        assert_eq!(down.len(), 1_600);
        assert_abs_diff_eq!(down[800], 0.25, epsilon = 0.01);
    }

    #[test]
    fn test_playback_duration() {
        assert_eq!(playback_duration(24_000, 24_000), Duration::from_secs(1));
        assert_eq!(playback_duration(12_000, 48_000), Duration::from_millis(250));
    }
}
