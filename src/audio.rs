//! Mono PCM buffers and WAV I/O.

use std::io::Read;
use std::path::Path;

use crate::error::{Result, RedubError};

/// Peak level at or above which a background bed is normalised before mixing.
pub const CLIP_THRESHOLD: f32 = 1.0;

/// Convert milliseconds to sample frames, rounding to the nearest frame.
pub fn ms_to_frames(ms: u64, sample_rate: u32) -> u64 {
    (ms * sample_rate as u64 + 500) / 1000
}

/// Convert sample frames to milliseconds, rounding to the nearest millisecond.
pub fn frames_to_ms(frames: u64, sample_rate: u32) -> u64 {
    let sr = sample_rate as u64;
    (frames * 1000 + sr / 2) / sr
}

/// Mono floating point audio in the range [-1.0, 1.0].
#[derive(Debug, Clone, PartialEq)]
pub struct PcmAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PcmAudio {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    pub fn silence(duration_ms: u64, sample_rate: u32) -> Self {
        let frames = ms_to_frames(duration_ms, sample_rate) as usize;
        Self::new(vec![0.0; frames], sample_rate)
    }

    pub fn frames(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_ms(&self) -> u64 {
        frames_to_ms(self.samples.len() as u64, self.sample_rate)
    }

    /// Copy of the `[start_ms, end_ms)` range, clamped to the buffer.
    pub fn slice_ms(&self, start_ms: u64, end_ms: u64) -> PcmAudio {
        let len = self.samples.len();
        let start = (ms_to_frames(start_ms, self.sample_rate) as usize).min(len);
        let end = (ms_to_frames(end_ms, self.sample_rate) as usize).clamp(start, len);
        PcmAudio::new(self.samples[start..end].to_vec(), self.sample_rate)
    }

    pub fn peak(&self) -> f32 {
        self.samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()))
    }

    /// Whether the buffer would clip when mixed, together with its peak level.
    pub fn needs_normalization(&self) -> (bool, f32) {
        let peak = self.peak();
        (peak >= CLIP_THRESHOLD, peak)
    }

    /// Scale so the peak equals `target`. Silent buffers are left untouched.
    pub fn normalize_peak(&mut self, target: f32) {
        let peak = self.peak();
        if peak <= f32::EPSILON {
            return;
        }
        let gain = target / peak;
        for sample in &mut self.samples {
            *sample *= gain;
        }
    }

    /// Linear interpolation resampling.
    ///
    /// Pitch follows the rate change, so this is only used to bring
    /// collaborator output onto the master sample rate.
    pub fn resample(&self, to_rate: u32) -> PcmAudio {
        if self.sample_rate == to_rate || self.samples.is_empty() {
            return PcmAudio::new(self.samples.clone(), to_rate);
        }

        let ratio = self.sample_rate as f64 / to_rate as f64;
        let output_len = (self.samples.len() as f64 / ratio).round() as usize;
        let last = self.samples.len() - 1;

        let samples = (0..output_len)
            .map(|i| {
                let pos = i as f64 * ratio;
                let idx = (pos.floor() as usize).min(last);
                let next = (idx + 1).min(last);
                let frac = (pos - idx as f64) as f32;
                self.samples[idx] * (1.0 - frac) + self.samples[next] * frac
            })
            .collect();

        PcmAudio::new(samples, to_rate)
    }
}

/// Decode WAV data from any reader, mixing channels down to mono.
pub fn decode_wav<R: Read>(reader: R) -> Result<PcmAudio> {
    let mut wav_reader = hound::WavReader::new(reader)?;
    let spec = wav_reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => wav_reader
            .samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            wav_reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
    };

    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };

    Ok(PcmAudio::new(samples, spec.sample_rate))
}

/// Read a WAV file from disk.
pub fn read_wav<P: AsRef<Path>>(path: P) -> Result<PcmAudio> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(RedubError::FileNotFound(path.display().to_string()));
    }
    let file = std::fs::File::open(path)?;
    decode_wav(std::io::BufReader::new(file))
}

pub fn wav_spec(sample_rate: u32) -> hound::WavSpec {
    hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}

pub fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16
}

/// Write mono 16-bit PCM WAV.
pub fn write_wav<P: AsRef<Path>>(path: P, audio: &PcmAudio) -> Result<()> {
    let mut writer = hound::WavWriter::create(path, wav_spec(audio.sample_rate))?;
    for &sample in &audio.samples {
        writer.write_sample(to_i16(sample))?;
    }
    writer.finalize()?;
    Ok(())
}
