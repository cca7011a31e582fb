//! Waveform sinks.
//!
//! The vocoder hands its `[-1, 1]` samples to a [`WaveformSink`]; the sinks
//! here cover the two formats the tooling uses: 16-bit PCM mono WAV and plain
//! text with one sample per line.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub trait WaveformSink {
    fn write(&mut self, samples: &[f32], sample_rate_hz: u32) -> Result<()>;
}

/// Scale so the peak maps to full scale: `wav * 32767 / max(0.01, max|wav|)`.
#[must_use]
pub fn peak_normalized_pcm16(samples: &[f32]) -> Vec<i16> {
    let peak = samples.iter().fold(0.0f32, |m, &v| m.max(v.abs())).max(0.01);
    let gain = 32767.0 / peak;
    samples
        .iter()
        .map(|&v| (v * gain).clamp(-32768.0, 32767.0) as i16)
        .collect()
}

/// Direct conversion of `[-1, 1]` samples, clamping out-of-range values.
#[must_use]
pub fn pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&v| (v.clamp(-1.0, 1.0) * 32767.0) as i16)
        .collect()
}

#[derive(Debug, Clone)]
pub struct WavFile {
    pub path: PathBuf,
    pub normalize: bool,
}

impl WavFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            normalize: true,
        }
    }
}

impl WaveformSink for WavFile {
    fn write(&mut self, samples: &[f32], sample_rate_hz: u32) -> Result<()> {
        let pcm = if self.normalize {
            peak_normalized_pcm16(samples)
        } else {
            pcm16(samples)
        };
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: sample_rate_hz,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&self.path, spec)
            .with_context(|| format!("create {}", self.path.display()))?;
        for &s in &pcm {
            writer.write_sample(s)?;
        }
        writer
            .finalize()
            .with_context(|| format!("finalize {}", self.path.display()))
    }
}

/// One `%.16f` value per line.
#[derive(Debug, Clone)]
pub struct TextFile {
    pub path: PathBuf,
}

impl TextFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl WaveformSink for TextFile {
    fn write(&mut self, samples: &[f32], _sample_rate_hz: u32) -> Result<()> {
        write_text(&self.path, samples)
    }
}

fn write_text(path: &Path, samples: &[f32]) -> Result<()> {
    let mut text = String::with_capacity(samples.len() * 20);
    for v in samples {
        let _ = writeln!(text, "{v:.16}");
    }
    std::fs::write(path, text).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::{WavFile, WaveformSink, pcm16, peak_normalized_pcm16};

    #[test]
    fn wav_file_is_mono_pcm16() {
        let mut path = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        path.push(format!("wavernn-audio-test-{nanos}.wav"));

        let mut sink = WavFile {
            path: path.clone(),
            normalize: false,
        };
        sink.write(&[0.0, 0.5, -1.0], 22_050).expect("write");

        let mut reader = hound::WavReader::open(&path).expect("open");
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, 22_050);
        assert_eq!(spec.bits_per_sample, 16);
        assert_eq!(spec.sample_format, hound::SampleFormat::Int);
        let samples: Vec<i16> = reader
            .samples::<i16>()
            .collect::<Result<_, _>>()
            .expect("samples");
        assert_eq!(samples, vec![0, 16383, -32767]);

        std::fs::remove_file(path).expect("cleanup");
    }

    #[test]
    fn normalization_hits_full_scale() {
        let pcm = peak_normalized_pcm16(&[0.25, -0.5, 0.0]);
        assert_eq!(pcm, vec![16383, -32767, 0]);

        // Near-silence is not blown up past the 0.01 floor.
        let quiet = peak_normalized_pcm16(&[0.001]);
        assert_eq!(quiet, vec![3276]);

        assert_eq!(pcm16(&[2.0, -1.0]), vec![32767, -32767]);
    }
}
