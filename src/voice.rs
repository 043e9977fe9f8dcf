//! Speaker voice profiling.
//!
//! One profile per distinct speaker, created once after segmentation.
//! Assignment is deterministic: configured overrides first, then an
//! embedding derived from the speaker's own audio when cloning is enabled,
//! then round-robin over the preset pool, in speaker-id order, for the
//! speakers still without a voice.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{info, warn};

use crate::audio::{write_wav, PcmAudio};
use crate::error::{Result, RedubError};
use crate::utterance::{SpeakerProfile, Utterance, VoiceDescriptor};

/// Number of equal chunks the reference clip is split into for the embedding
const EMBEDDING_CHUNKS: usize = 8;

/// Distinct speaker ids in sorted order
pub fn speakers(utterances: &[Utterance]) -> Vec<String> {
    utterances
        .iter()
        .map(|u| u.speaker_id.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Overrides first, then the preset pool round-robin in speaker order.
pub fn assign_presets(
    speakers: &[String],
    overrides: &BTreeMap<String, String>,
    pool: &[String],
) -> Result<Vec<SpeakerProfile>> {
    let mut next = 0usize;
    speakers
        .iter()
        .map(|speaker_id| {
            let name = match overrides.get(speaker_id) {
                Some(name) => name.clone(),
                None => {
                    if pool.is_empty() {
                        return Err(RedubError::Config(format!(
                            "No preset voice available for {}",
                            speaker_id
                        )));
                    }
                    let name = pool[next % pool.len()].clone();
                    next += 1;
                    name
                }
            };
            Ok(SpeakerProfile {
                speaker_id: speaker_id.clone(),
                voice: VoiceDescriptor::Preset { name },
            })
        })
        .collect()
}

fn round4(value: f32) -> f32 {
    (value * 10_000.0).round() / 10_000.0
}

/// Fixed-length voice signature: RMS energy and zero-crossing rate per chunk.
pub fn embedding(reference: &PcmAudio) -> Vec<f32> {
    let samples = &reference.samples;
    let chunk_len = (samples.len() / EMBEDDING_CHUNKS).max(1);
    let mut vector = Vec::with_capacity(EMBEDDING_CHUNKS * 2);

    for i in 0..EMBEDDING_CHUNKS {
        let start = (i * chunk_len).min(samples.len());
        let end = if i + 1 == EMBEDDING_CHUNKS {
            samples.len()
        } else {
            ((i + 1) * chunk_len).min(samples.len())
        };
        let chunk = &samples[start..end];

        if chunk.is_empty() {
            vector.extend([0.0, 0.0]);
            continue;
        }
        let energy = (chunk.iter().map(|s| s * s).sum::<f32>() / chunk.len() as f32).sqrt();
        let crossings = chunk
            .windows(2)
            .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
            .count();
        let zcr = crossings as f32 / chunk.len() as f32;
        vector.push(round4(energy));
        vector.push(round4(zcr));
    }

    vector
}

/// Concatenate a speaker's usable source audio up to `max_ms`.
pub fn reference_clip(utterances: &[Utterance], speaker_id: &str, source: &PcmAudio, max_ms: u64) -> PcmAudio {
    let max_frames = crate::audio::ms_to_frames(max_ms, source.sample_rate) as usize;
    let mut samples = Vec::new();

    for utterance in utterances
        .iter()
        .filter(|u| u.speaker_id == speaker_id && u.is_dubbable())
    {
        if samples.len() >= max_frames {
            break;
        }
        let slice = source.slice_ms(utterance.start_ms, utterance.end_ms);
        let take = (max_frames - samples.len()).min(slice.frames());
        samples.extend_from_slice(&slice.samples[..take]);
    }

    PcmAudio::new(samples, source.sample_rate)
}

pub struct VoiceProfiler<'a> {
    overrides: &'a BTreeMap<String, String>,
    pool: Vec<String>,
    reference_max_ms: u64,
}

impl<'a> VoiceProfiler<'a> {
    /// `pool` is the preset list for the target language
    pub fn new(overrides: &'a BTreeMap<String, String>, pool: Vec<String>, reference_max_ms: u64) -> Self {
        Self {
            overrides,
            pool,
            reference_max_ms,
        }
    }

    /// Build profiles ordered by speaker id.
    ///
    /// With `cloning` set, reference clips are written under `reference_dir`.
    pub fn profile(
        &self,
        utterances: &[Utterance],
        source: &PcmAudio,
        cloning: bool,
        reference_dir: &Path,
    ) -> Result<Vec<SpeakerProfile>> {
        let speakers = speakers(utterances);
        let mut cloned = Vec::new();

        if cloning {
            std::fs::create_dir_all(reference_dir)?;
            for speaker_id in speakers.iter().filter(|s| !self.overrides.contains_key(*s)) {
                let clip = reference_clip(utterances, speaker_id, source, self.reference_max_ms);
                if clip.is_empty() {
                    warn!("No usable audio for {}, falling back to a preset voice", speaker_id);
                    continue;
                }
                let reference_audio = reference_dir.join(format!("{}.wav", speaker_id));
                write_wav(&reference_audio, &clip)?;
                cloned.push(SpeakerProfile {
                    speaker_id: speaker_id.clone(),
                    voice: VoiceDescriptor::Embedding {
                        vector: embedding(&clip),
                        reference_audio,
                    },
                });
            }
        }

        // Only speakers without an embedding draw from the preset pool
        let fallback: Vec<String> = speakers
            .into_iter()
            .filter(|s| !cloned.iter().any(|p| &p.speaker_id == s))
            .collect();
        let mut profiles = assign_presets(&fallback, self.overrides, &self.pool)?;
        profiles.extend(cloned);
        profiles.sort_by(|a, b| a.speaker_id.cmp(&b.speaker_id));

        for profile in &profiles {
            info!("Voice for {}: {}", profile.speaker_id, profile.voice.backend_value());
        }
        Ok(profiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utterance(id: u32, speaker: &str, start_ms: u64, end_ms: u64) -> Utterance {
        Utterance {
            id,
            start_ms,
            end_ms,
            speaker_id: speaker.to_string(),
            source_text: "text".to_string(),
            source_language: "en".to_string(),
            target_language: "de".to_string(),
            language_confidence: 1.0,
            flags: Vec::new(),
        }
    }

    fn names(profiles: &[SpeakerProfile]) -> Vec<String> {
        profiles.iter().map(|p| p.voice.backend_value()).collect()
    }

    #[test]
    fn test_round_robin_in_speaker_order_with_overrides() {
        let speakers = vec![
            "SPEAKER_00".to_string(),
            "SPEAKER_01".to_string(),
            "SPEAKER_02".to_string(),
            "SPEAKER_03".to_string(),
        ];
        let mut overrides = BTreeMap::new();
        overrides.insert("SPEAKER_01".to_string(), "custom".to_string());
        let pool = vec!["alloy".to_string(), "echo".to_string()];

        let profiles = assign_presets(&speakers, &overrides, &pool).unwrap();
        assert_eq!(names(&profiles), vec!["alloy", "custom", "echo", "alloy"]);
    }

    #[test]
    fn test_empty_pool_without_override_is_an_error() {
        let speakers = vec!["SPEAKER_00".to_string()];
        assert!(assign_presets(&speakers, &BTreeMap::new(), &[]).is_err());
    }

    #[test]
    fn test_profiles_are_one_per_speaker() {
        let utterances = vec![
            utterance(0, "SPEAKER_01", 0, 500),
            utterance(1, "SPEAKER_00", 500, 900),
            utterance(2, "SPEAKER_01", 900, 1200),
        ];
        assert_eq!(speakers(&utterances), vec!["SPEAKER_00", "SPEAKER_01"]);
    }

    #[test]
    fn test_cloning_writes_reference_and_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let samples: Vec<f32> = (0..16_000).map(|i| ((i % 40) as f32 / 40.0) - 0.5).collect();
        let source = PcmAudio::new(samples, 8000);
        let utterances = vec![utterance(0, "SPEAKER_00", 0, 1000), utterance(1, "SPEAKER_01", 1000, 1000)];
        let overrides = BTreeMap::new();
        let profiler = VoiceProfiler::new(&overrides, vec!["alloy".to_string()], 500);

        let first = profiler.profile(&utterances, &source, true, dir.path()).unwrap();
        let reference = dir.path().join("SPEAKER_00.wav");
        assert!(reference.exists());
        match &first[0].voice {
            VoiceDescriptor::Embedding { vector, .. } => assert_eq!(vector.len(), EMBEDDING_CHUNKS * 2),
            other => panic!("expected embedding, got {:?}", other),
        }
        // zero-length audio falls back to the preset policy
        assert_eq!(
            first[1].voice,
            VoiceDescriptor::Preset {
                name: "alloy".to_string()
            }
        );

        let second_dir = tempfile::tempdir().unwrap();
        let second = profiler.profile(&utterances, &source, true, second_dir.path()).unwrap();
        match (&first[0].voice, &second[0].voice) {
            (VoiceDescriptor::Embedding { vector: a, .. }, VoiceDescriptor::Embedding { vector: b, .. }) => {
                assert_eq!(a, b)
            }
            _ => panic!("expected embeddings"),
        }
    }

    #[test]
    fn test_cloned_speakers_need_no_preset() {
        let dir = tempfile::tempdir().unwrap();
        let source = PcmAudio::new(vec![0.25; 8000], 8000);
        let utterances = vec![utterance(0, "SPEAKER_00", 0, 1000)];
        let overrides = BTreeMap::new();
        let profiler = VoiceProfiler::new(&overrides, Vec::new(), 500);

        let profiles = profiler.profile(&utterances, &source, true, dir.path()).unwrap();
        assert_eq!(profiles.len(), 1);
        assert!(matches!(profiles[0].voice, VoiceDescriptor::Embedding { .. }));

        // without cloning the same speaker has nothing to fall back on
        assert!(profiler.profile(&utterances, &source, false, dir.path()).is_err());
    }

    #[test]
    fn test_preset_round_robin_skips_cloned_speakers() {
        let dir = tempfile::tempdir().unwrap();
        let source = PcmAudio::new(vec![0.25; 8000], 8000);
        let utterances = vec![
            utterance(0, "SPEAKER_00", 0, 0),
            utterance(1, "SPEAKER_01", 0, 500),
            utterance(2, "SPEAKER_02", 500, 500),
        ];
        let overrides = BTreeMap::new();
        let profiler = VoiceProfiler::new(&overrides, vec!["alloy".to_string(), "echo".to_string()], 500);

        let profiles = profiler.profile(&utterances, &source, true, dir.path()).unwrap();
        let ids: Vec<&str> = profiles.iter().map(|p| p.speaker_id.as_str()).collect();
        assert_eq!(ids, vec!["SPEAKER_00", "SPEAKER_01", "SPEAKER_02"]);
        assert_eq!(profiles[0].voice.backend_value(), "alloy");
        assert!(matches!(profiles[1].voice, VoiceDescriptor::Embedding { .. }));
        assert_eq!(profiles[2].voice.backend_value(), "echo");
    }

    #[test]
    fn test_reference_clip_respects_limit() {
        let source = PcmAudio::new(vec![0.2; 10_000], 1000);
        let utterances = vec![utterance(0, "A", 0, 3000), utterance(1, "A", 4000, 8000)];
        let clip = reference_clip(&utterances, "A", &source, 5000);
        assert_eq!(clip.frames(), 5000);
    }
}
