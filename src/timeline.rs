use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

use crate::audio::{ms_to_frames, read_wav, to_i16, wav_spec, PcmAudio};
use crate::error::{Result, RedubError};
use crate::reconcile::Timeline;
use crate::utterance::UtteranceId;

/// Peak level a clipping background bed is normalised to
pub const BACKGROUND_PEAK: f32 = 0.9;

/// Load the separated background bed onto the master sample rate.
pub fn load_background<P: AsRef<Path>>(path: P, sample_rate: u32) -> Result<PcmAudio> {
    let mut bed = read_wav(path)?.resample(sample_rate);
    let (needs, peak) = bed.needs_normalization();
    if needs {
        info!("Background peaks at {:.3}, normalising to {:.2}", peak, BACKGROUND_PEAK);
        bed.normalize_peak(BACKGROUND_PEAK);
    }
    Ok(bed)
}

/// Writes the master track: bed (or silence) with clips at their placements.
pub struct TimelineAssembler {
    sample_rate: u32,
    background_gain: f32,
}

impl TimelineAssembler {
    pub fn new(sample_rate: u32, background_gain: f32) -> Self {
        Self {
            sample_rate,
            background_gain,
        }
    }

    /// Stream the master track to `output` in timeline order.
    ///
    /// Returns the number of frames written, which is always the media
    /// duration at the master sample rate.
    pub fn assemble(
        &self,
        output: &Path,
        duration_ms: u64,
        timeline: &Timeline,
        clips: &HashMap<UtteranceId, &PcmAudio>,
        background: Option<&PcmAudio>,
    ) -> Result<u64> {
        let total = ms_to_frames(duration_ms, self.sample_rate);
        let gain = self.background_gain;
        let bed = |frame: u64| -> f32 {
            background
                .and_then(|b| b.samples.get(frame as usize))
                .map(|s| s * gain)
                .unwrap_or(0.0)
        };

        let mut writer = hound::WavWriter::create(output, wav_spec(self.sample_rate))?;
        let mut cursor = 0u64;

        for entry in &timeline.entries {
            let audio = clips.get(&entry.utterance_id).ok_or_else(|| {
                RedubError::Media(format!("No audio for placed utterance {}", entry.utterance_id))
            })?;
            if entry.offset_frames < cursor {
                return Err(RedubError::Media(format!(
                    "Utterance {} placed before the previous clip ends",
                    entry.utterance_id
                )));
            }

            while cursor < entry.offset_frames.min(total) {
                writer.write_sample(to_i16(bed(cursor)))?;
                cursor += 1;
            }

            let end = (entry.offset_frames + entry.frames).min(total);
            for (i, frame) in (entry.offset_frames..end).enumerate() {
                let speech = audio.samples.get(i).copied().unwrap_or(0.0);
                writer.write_sample(to_i16(speech + bed(frame)))?;
            }
            cursor = cursor.max(end);
            debug!("Placed utterance {} at frame {}", entry.utterance_id, entry.offset_frames);
        }

        while cursor < total {
            writer.write_sample(to_i16(bed(cursor)))?;
            cursor += 1;
        }

        writer.finalize()?;
        info!(
            "Master track written: {} ({} frames, {} clips)",
            output.display(),
            total,
            timeline.entries.len()
        );
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::write_wav;
    use crate::reconcile::{cascade, CascadeInput};

    const SR: u32 = 8000;

    #[test]
    fn test_length_matches_source_duration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.wav");
        let clip = PcmAudio::new(vec![0.5; 4000], SR);
        let timeline = cascade(
            &[CascadeInput {
                utterance_id: 0,
                start_ms: 9_800,
                frames: 4000,
            }],
            SR,
            ms_to_frames(10_250, SR),
        );
        let clips = HashMap::from([(0, &clip)]);

        let written = TimelineAssembler::new(SR, 1.0)
            .assemble(&path, 10_250, &timeline, &clips, None)
            .unwrap();
        let decoded = read_wav(&path).unwrap();

        assert_eq!(written, ms_to_frames(10_250, SR));
        assert_eq!(decoded.frames() as u64, written);
        // truncated clip still sounds until the very end
        assert!(decoded.samples.last().copied().unwrap() > 0.4);
    }

    #[test]
    fn test_clip_lands_at_its_offset_over_the_bed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.wav");
        let clip = PcmAudio::new(vec![0.25; 800], SR);
        let bed = PcmAudio::new(vec![0.1; 16_000], SR);
        let timeline = cascade(
            &[CascadeInput {
                utterance_id: 3,
                start_ms: 1000,
                frames: 800,
            }],
            SR,
            16_000,
        );
        let clips = HashMap::from([(3, &clip)]);

        TimelineAssembler::new(SR, 0.5)
            .assemble(&path, 2000, &timeline, &clips, Some(&bed))
            .unwrap();
        let decoded = read_wav(&path).unwrap();

        assert!((decoded.samples[7999] - 0.05).abs() < 1e-3);
        assert!((decoded.samples[8000] - 0.30).abs() < 1e-3);
        assert!((decoded.samples[8799] - 0.30).abs() < 1e-3);
        assert!((decoded.samples[8800] - 0.05).abs() < 1e-3);
    }

    #[test]
    fn test_empty_timeline_is_silence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.wav");
        let written = TimelineAssembler::new(SR, 1.0)
            .assemble(&path, 1500, &Timeline::default(), &HashMap::new(), None)
            .unwrap();
        let decoded = read_wav(&path).unwrap();
        assert_eq!(written, 12_000);
        assert_eq!(decoded.peak(), 0.0);
    }

    #[test]
    fn test_quiet_background_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bed.wav");
        write_wav(&path, &PcmAudio::new(vec![0.5, -0.25, 0.0], 16_000)).unwrap();

        let bed = load_background(&path, 16_000).unwrap();
        assert!((bed.peak() - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_loud_background_is_normalised() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bed.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16_000,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for sample in [1.0f32, -1.0, 0.5, 0.0] {
            writer.write_sample(sample).unwrap();
        }
        writer.finalize().unwrap();

        let bed = load_background(&path, 16_000).unwrap();
        assert!((bed.peak() - BACKGROUND_PEAK).abs() < 1e-3);
    }
}
