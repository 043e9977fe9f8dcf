use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::audio::PcmAudio;
use crate::config::SynthesisConfig;
use crate::error::{Result, RedubError};
use crate::pool::{TaskOutcome, WorkerPool};
use crate::snapshot::Stage;
use crate::utterance::{FlagEntry, SpeakerProfile, SynthesizedClip, TranslatedUtterance, UtteranceFlag, UtteranceId};
use super::{SynthesisRequest, Synthesizer};

/// Synthesize one request and bring the audio onto the master sample rate.
pub async fn synthesize_clip(
    synthesizer: &dyn Synthesizer,
    request: SynthesisRequest,
    sample_rate: u32,
) -> Result<PcmAudio> {
    let audio = synthesizer.synthesize(request).await?;
    if audio.is_empty() {
        return Err(RedubError::Synthesis("Synthesizer returned no audio".to_string()));
    }
    Ok(audio.resample(sample_rate))
}

/// Clips plus the utterances that could not be voiced.
#[derive(Debug, Default)]
pub struct SynthesisOutput {
    pub clips: Vec<SynthesizedClip>,
    pub failures: Vec<FlagEntry>,
}

pub struct SynthesisStage {
    synthesizer: Arc<dyn Synthesizer>,
    timeout: Duration,
    sample_rate: u32,
}

impl SynthesisStage {
    pub fn new(synthesizer: Arc<dyn Synthesizer>, config: &SynthesisConfig, sample_rate: u32) -> Self {
        Self {
            synthesizer,
            timeout: Duration::from_secs(config.timeout_secs),
            sample_rate,
        }
    }

    /// Synthesize every dubbable utterance with its speaker's voice.
    ///
    /// Clips come back in utterance order.
    pub async fn run(
        &self,
        pool: &WorkerPool,
        utterances: &[TranslatedUtterance],
        profiles: &[SpeakerProfile],
    ) -> Result<SynthesisOutput> {
        let voices: HashMap<&str, &SpeakerProfile> = profiles
            .iter()
            .map(|p| (p.speaker_id.as_str(), p))
            .collect();

        let mut output = SynthesisOutput::default();
        let mut jobs: Vec<(UtteranceId, SynthesisRequest)> = Vec::new();

        for translated in utterances.iter().filter(|t| t.utterance.is_dubbable()) {
            match voices.get(translated.utterance.speaker_id.as_str()) {
                Some(profile) => jobs.push((
                    translated.id(),
                    SynthesisRequest {
                        text: translated.target_text.clone(),
                        language: translated.utterance.target_language.clone(),
                        voice: profile.voice.clone(),
                        rate: None,
                    },
                )),
                None => {
                    warn!(
                        "No voice profile for {}; skipping utterance {}",
                        translated.utterance.speaker_id,
                        translated.id()
                    );
                    output.failures.push(FlagEntry {
                        utterance_id: translated.id(),
                        stage: Stage::Synthesis,
                        flags: vec![UtteranceFlag::SynthesisFailed {
                            reason: "no voice profile".to_string(),
                        }],
                    });
                }
            }
        }

        info!("Synthesizing {} utterances with {}", jobs.len(), self.synthesizer.name());

        let ids: Vec<UtteranceId> = jobs.iter().map(|(id, _)| *id).collect();
        let requests: Vec<SynthesisRequest> = jobs.into_iter().map(|(_, r)| r).collect();
        let synthesizer = self.synthesizer.clone();
        let sample_rate = self.sample_rate;

        let outcomes = pool
            .run("Synthesizing", requests, self.timeout, move |request| {
                let synthesizer = synthesizer.clone();
                async move { synthesize_clip(synthesizer.as_ref(), request, sample_rate).await }
            })
            .await?;

        for (utterance_id, outcome) in ids.into_iter().zip(outcomes) {
            match outcome {
                TaskOutcome::Completed { value, .. } => output.clips.push(SynthesizedClip {
                    utterance_id,
                    native_duration_ms: value.duration_ms(),
                    audio: value,
                }),
                TaskOutcome::Failed { error, attempts, timed_out } => {
                    warn!(
                        "Utterance {} not synthesized after {} attempts: {}",
                        utterance_id, attempts, error
                    );
                    let mut flags = Vec::new();
                    if timed_out {
                        flags.push(UtteranceFlag::TimedOut { stage: Stage::Synthesis });
                    }
                    flags.push(UtteranceFlag::SynthesisFailed {
                        reason: error.to_string(),
                    });
                    output.failures.push(FlagEntry {
                        utterance_id,
                        stage: Stage::Synthesis,
                        flags,
                    });
                }
            }
        }

        output.failures.sort_by_key(|f| f.utterance_id);
        Ok(output)
    }
}
