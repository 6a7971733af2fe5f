use hound::{SampleFormat, WavReader};
use std::path::Path;

use crate::error::ServiceError;

pub const SAMPLE_RATE: u32 = 16000; // Whisper requires 16kHz

/// Decodes a WAV file into 16kHz mono f32 samples.
pub fn load_pcm_16k(path: &Path) -> Result<Vec<f32>, ServiceError> {
    let reader = WavReader::open(path).map_err(|e| {
        ServiceError::Engine(format!(
            "cannot decode {} as WAV: {}",
            path.display(),
            e
        ))
    })?;
    let spec = reader.spec();

    let samples = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Float, 32) => reader
            .into_samples::<f32>()
            .collect::<Result<Vec<f32>, _>>(),
        (SampleFormat::Int, bits @ 8..=32) => {
            let scale = (1i64 << (bits - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|sample| sample as f32 / scale))
                .collect::<Result<Vec<f32>, _>>()
        }
        (format, bits) => {
            return Err(ServiceError::Engine(format!(
                "unsupported WAV encoding: {:?} {}-bit",
                format, bits
            )));
        }
    }
    .map_err(|e| ServiceError::Engine(format!("failed to read samples: {}", e)))?;

    let mono = downmix(&samples, spec.channels);
    Ok(resample(&mono, spec.sample_rate, SAMPLE_RATE))
}

/// Averages interleaved channels into one.
pub fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    match channels {
        0 => Vec::new(),
        1 => samples.to_vec(),
        n => samples
            .chunks_exact(n as usize)
            .map(|frame| frame.iter().sum::<f32>() / n as f32)
            .collect(),
    }
}

/// Linear-interpolation resampler, good enough for speech input.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 {
        return samples.to_vec();
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let out_len = (samples.len() as f64 * ratio).ceil() as usize;
    (0..out_len)
        .map(|i| {
            let src = i as f64 / ratio;
            let idx = src as usize;
            let frac = (src - idx as f64) as f32;
            match (samples.get(idx), samples.get(idx + 1)) {
                (Some(a), Some(b)) => a * (1.0 - frac) + b * frac,
                (Some(a), None) => *a,
                _ => 0.0,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{WavSpec, WavWriter};

    fn write_wav(path: &Path, rate: u32, channels: u16, frames: usize) {
        let spec = WavSpec {
            channels,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for _ in 0..frames * channels as usize {
            writer.write_sample(i16::MAX / 2).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn stereo_48k_becomes_mono_16k() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wav");
        write_wav(&path, 48000, 2, 4800);

        let pcm = load_pcm_16k(&path).unwrap();
        assert_eq!(pcm.len(), 1600);
        assert!(pcm.iter().all(|s| (s - 0.5).abs() < 0.01));
    }

    #[test]
    fn non_wav_input_is_an_engine_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.mp3");
        std::fs::write(&path, b"ID3 definitely not a wav").unwrap();
        assert!(matches!(load_pcm_16k(&path), Err(ServiceError::Engine(_))));
    }

    #[test]
    fn downmix_averages_frames() {
        assert_eq!(downmix(&[1.0, 0.0, 0.5, 0.5], 2), vec![0.5, 0.5]);
        assert_eq!(downmix(&[0.25], 1), vec![0.25]);
        assert!(downmix(&[0.25], 0).is_empty());
    }

    #[test]
    fn resample_same_rate_is_identity() {
        let input = vec![0.1, 0.2, 0.3];
        assert_eq!(resample(&input, 16000, 16000), input);
        assert_eq!(resample(&[0.5; 320], 32000, 16000).len(), 160);
    }
}
