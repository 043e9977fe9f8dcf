// Modular transcription architecture
//
// This module separates the transcription + diarization service from the
// segmentation rules applied to its output:
// - Transcriber: capability trait implemented per backend
// - command: external whisper-style CLI emitting diarized JSON
// - segment: normalisation into ordered, non-overlapping utterances
//
// To add a new transcription service, implement Transcriber for it and add
// the backend to TranscriberBackend and the factory below.

pub mod command;
pub mod segment;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

pub use segment::*;
use crate::config::{TranscriberBackend, TranscriberConfig};
use crate::error::Result;

/// Half-open time range `[start_ms, end_ms)` on the source timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_ms: u64,
    pub end_ms: u64,
}

impl TimeWindow {
    pub fn new(start_ms: u64, end_ms: u64) -> Self {
        Self { start_ms, end_ms }
    }

    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }
}

/// Speech region as reported by the service, before normalisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSegment {
    pub start_ms: u64,
    pub end_ms: u64,
    /// Service-specific speaker label, consistent across the whole file
    pub speaker: String,
    /// `None` when the model failed on this region
    pub text: Option<String>,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTranscription {
    pub language: String,
    pub segments: Vec<RawSegment>,
}

/// Main trait for transcription + diarization services
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Backend name used in logs and language checks
    fn name(&self) -> &str;

    /// Source languages this backend accepts (empty = any)
    fn supported_languages(&self) -> Vec<String>;

    fn supports_language(&self, language: &str) -> bool {
        let languages = self.supported_languages();
        languages.is_empty() || languages.iter().any(|l| l.eq_ignore_ascii_case(language))
    }

    /// Detect the spoken language of the audio
    async fn detect_language(&self, audio: &Path) -> Result<String>;

    /// Single whole-file transcription and diarization pass
    async fn transcribe(&self, audio: &Path, language: &str) -> Result<RawTranscription>;

    /// Re-transcribe one region of the audio
    async fn transcribe_region(&self, audio: &Path, window: TimeWindow, language: &str) -> Result<String>;
}

/// Factory for creating transcriber instances
pub struct TranscriberFactory;

impl TranscriberFactory {
    /// Create the transcriber selected in the configuration
    pub fn create_transcriber(config: TranscriberConfig) -> Arc<dyn Transcriber> {
        match config.backend {
            TranscriberBackend::Command => Arc::new(command::CommandTranscriber::new(config)),
        }
    }
}
