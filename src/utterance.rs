//! Records passed between pipeline stages.
//!
//! Each stage produces a new record layered on the previous one and keyed by
//! the stable [`UtteranceId`] assigned at segmentation:
//! [`Utterance`] -> [`TranslatedUtterance`] -> [`SynthesizedClip`] -> [`ReconciledClip`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::audio::PcmAudio;
use crate::snapshot::Stage;

pub type UtteranceId = u32;

/// Degradation markers recorded against an utterance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UtteranceFlag {
    TranscriptionRetried,
    TranscriptionFailed { reason: String },
    TranslationFailed { reason: String },
    SynthesisFailed { reason: String },
    TimedOut { stage: Stage },
    Resynthesized { rate: f64 },
    Overflow { ms: u64 },
    Collision { with: UtteranceId },
    Shifted { ms: u64 },
    Truncated { ms: u64 },
}

impl UtteranceFlag {
    /// Flags that remove the utterance from every later stage
    pub fn is_exclusion(&self) -> bool {
        matches!(
            self,
            Self::TranscriptionFailed { .. }
                | Self::TranslationFailed { .. }
                | Self::SynthesisFailed { .. }
        )
    }

    /// Stage that raised the flag
    pub fn stage(&self) -> Stage {
        match self {
            Self::TranscriptionRetried | Self::TranscriptionFailed { .. } => Stage::Segmentation,
            Self::TranslationFailed { .. } => Stage::Translation,
            Self::SynthesisFailed { .. } => Stage::Synthesis,
            Self::TimedOut { stage } => *stage,
            Self::Resynthesized { .. } | Self::Overflow { .. } => Stage::Reconciliation,
            Self::Collision { .. } | Self::Shifted { .. } | Self::Truncated { .. } => Stage::Timeline,
        }
    }
}

/// One detected speech region with a single speaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utterance {
    pub id: UtteranceId,
    pub start_ms: u64,
    pub end_ms: u64,
    pub speaker_id: String,
    pub source_text: String,
    pub source_language: String,
    pub target_language: String,
    pub language_confidence: f32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<UtteranceFlag>,
}

impl Utterance {
    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }

    /// Whether the utterance takes part in translation and synthesis
    pub fn is_dubbable(&self) -> bool {
        !self.flags.iter().any(UtteranceFlag::is_exclusion)
    }
}

/// An utterance enriched with its target-language text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslatedUtterance {
    #[serde(flatten)]
    pub utterance: Utterance,
    pub target_text: String,
}

impl TranslatedUtterance {
    pub fn id(&self) -> UtteranceId {
        self.utterance.id
    }
}

/// Voice used to render a speaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VoiceDescriptor {
    Preset {
        name: String,
    },
    Embedding {
        reference_audio: PathBuf,
        vector: Vec<f32>,
    },
}

impl VoiceDescriptor {
    /// Value handed to backends that address voices by a single string
    pub fn backend_value(&self) -> String {
        match self {
            Self::Preset { name } => name.clone(),
            Self::Embedding { reference_audio, .. } => reference_audio.display().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerProfile {
    pub speaker_id: String,
    pub voice: VoiceDescriptor,
}

/// Raw synthesizer output for one utterance.
#[derive(Debug, Clone, Serialize)]
pub struct SynthesizedClip {
    pub utterance_id: UtteranceId,
    #[serde(skip)]
    pub audio: PcmAudio,
    pub native_duration_ms: u64,
}

/// How the reconciler changed a clip.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Adjustment {
    None,
    Compressed { ratio: f64 },
    Resynthesized { rate: f64, ratio: f64 },
    SlowedDown { ratio: f64 },
}

/// A clip whose duration has been fitted to its source window.
#[derive(Debug, Clone, Serialize)]
pub struct ReconciledClip {
    pub utterance_id: UtteranceId,
    #[serde(skip)]
    pub audio: PcmAudio,
    pub final_duration_ms: u64,
    pub adjustment: Adjustment,
    /// Silence left at the end of the window
    pub padding_ms: u64,
    /// Amount by which the clip still exceeds its window
    pub overflow_ms: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<UtteranceFlag>,
}

/// One entry of the machine-readable degradation report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagEntry {
    pub utterance_id: UtteranceId,
    pub stage: Stage,
    pub flags: Vec<UtteranceFlag>,
}

/// Group flags by utterance and raising stage, ordered by id then pipeline order.
pub fn build_flag_report<'a, I>(flags: I) -> Vec<FlagEntry>
where
    I: IntoIterator<Item = (UtteranceId, &'a UtteranceFlag)>,
{
    let mut grouped: BTreeMap<(UtteranceId, Stage), Vec<UtteranceFlag>> = BTreeMap::new();
    for (id, flag) in flags {
        grouped.entry((id, flag.stage())).or_default().push(flag.clone());
    }
    grouped
        .into_iter()
        .map(|((utterance_id, stage), flags)| FlagEntry {
            utterance_id,
            stage,
            flags,
        })
        .collect()
}
