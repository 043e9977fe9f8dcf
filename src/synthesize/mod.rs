// Speech synthesis architecture
//
// - Synthesizer: capability trait implemented per backend
// - http: OpenAI-compatible speech endpoint returning WAV
// - command: external TTS command writing a WAV file
// - stage: pooled per-utterance synthesis with failure flagging

pub mod command;
pub mod http;
pub mod stage;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use stage::*;
use crate::audio::PcmAudio;
use crate::config::{SynthesisConfig, SynthesizerBackend};
use crate::error::Result;
use crate::utterance::VoiceDescriptor;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisRequest {
    pub text: String,
    pub language: String,
    pub voice: VoiceDescriptor,
    /// Speaking-rate directive, 1.0 = natural pace
    pub rate: Option<f64>,
}

/// Main trait for speech synthesis services
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Synthesizer: Send + Sync {
    fn name(&self) -> &str;

    /// Target languages this backend can speak (empty = any)
    fn supported_languages(&self) -> Vec<String>;

    /// Whether the backend honours [`SynthesisRequest::rate`]
    fn supports_rate(&self) -> bool;

    /// Preset voices available for `language`, in assignment order
    fn preset_voices(&self, language: &str) -> Vec<String>;

    async fn synthesize(&self, request: SynthesisRequest) -> Result<PcmAudio>;

    async fn check_availability(&self) -> Result<()>;
}

/// Language check shared by the pipeline and the `languages` listing
pub fn supports_language(synthesizer: &dyn Synthesizer, language: &str) -> bool {
    let languages = synthesizer.supported_languages();
    languages.is_empty() || languages.iter().any(|l| l.eq_ignore_ascii_case(language))
}

/// Factory for creating synthesizer instances
pub struct SynthesizerFactory;

impl SynthesizerFactory {
    pub fn create_synthesizer(config: SynthesisConfig) -> Result<Arc<dyn Synthesizer>> {
        match config.backend {
            SynthesizerBackend::Http => Ok(Arc::new(http::HttpSynthesizer::new(config)?)),
            SynthesizerBackend::Command => Ok(Arc::new(command::CommandSynthesizer::new(config))),
        }
    }
}
