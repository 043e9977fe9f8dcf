use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::TranscriberConfig;
use crate::error::{Result, RedubError};
use crate::media::MediaCommand;
use super::{RawSegment, RawTranscription, TimeWindow, Transcriber};

/// JSON document written by the diarizing whisper CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiarizedOutput {
    pub language: Option<String>,
    #[serde(default)]
    pub segments: Vec<DiarizedSegment>,
}

/// Segment format of the CLI, times in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiarizedSegment {
    pub start: f64,
    pub end: f64,
    #[serde(default)]
    pub speaker: Option<String>,
    /// `null` when decoding failed for the region
    pub text: Option<String>,
    pub avg_logprob: Option<f64>,
}

fn seconds_to_ms(seconds: f64) -> u64 {
    (seconds.max(0.0) * 1000.0).round() as u64
}

impl DiarizedOutput {
    /// Map CLI output to the service-neutral representation
    pub fn into_raw(self, fallback_language: &str) -> RawTranscription {
        let segments = self
            .segments
            .into_iter()
            .map(|seg| RawSegment {
                start_ms: seconds_to_ms(seg.start),
                end_ms: seconds_to_ms(seg.end),
                speaker: seg.speaker.unwrap_or_else(|| "unknown".to_string()),
                text: seg.text,
                // Convert log probability to confidence score (0.0 to 1.0)
                confidence: seg
                    .avg_logprob
                    .map(|logprob| (logprob.exp() as f32).clamp(0.0, 1.0))
                    .unwrap_or(1.0),
            })
            .collect();

        RawTranscription {
            language: self.language.unwrap_or_else(|| fallback_language.to_string()),
            segments,
        }
    }
}

/// Transcriber driving an external diarizing whisper CLI
pub struct CommandTranscriber {
    config: TranscriberConfig,
}

impl CommandTranscriber {
    pub fn new(config: TranscriberConfig) -> Self {
        Self { config }
    }

    fn base_command(&self, description: &str, json_path: &Path) -> MediaCommand {
        MediaCommand::new(&self.config.binary_path, description)
            .arg("--model")
            .arg(&self.config.model)
            .arg("--output-json")
            .path(json_path)
            .timeout(Duration::from_secs(self.config.timeout_secs))
    }

    async fn run_json(&self, command: MediaCommand, json_path: &Path) -> Result<DiarizedOutput> {
        command.execute().await.map_err(|e| match e {
            RedubError::Media(msg) => RedubError::Transcription(msg),
            other => other,
        })?;

        let json_content = tokio::fs::read_to_string(json_path)
            .await
            .map_err(|e| RedubError::Transcription(format!("Failed to read output: {}", e)))?;

        serde_json::from_str(&json_content)
            .map_err(|e| RedubError::Transcription(format!("Failed to parse transcription JSON: {}", e)))
    }
}

#[async_trait]
impl Transcriber for CommandTranscriber {
    fn name(&self) -> &str {
        "whisper-command"
    }

    fn supported_languages(&self) -> Vec<String> {
        self.config.languages.clone()
    }

    async fn detect_language(&self, audio: &Path) -> Result<String> {
        let temp_dir = tempfile::tempdir()?;
        let json_path = temp_dir.path().join("language.json");
        let command = self
            .base_command("Language detection", &json_path)
            .arg("--detect-language")
            .path(audio);

        let output = self.run_json(command, &json_path).await?;
        let language = output
            .language
            .ok_or_else(|| RedubError::Transcription("No language detected".to_string()))?;
        info!("Detected source language: {}", language);
        Ok(language)
    }

    async fn transcribe(&self, audio: &Path, language: &str) -> Result<RawTranscription> {
        let temp_dir = tempfile::tempdir()?;
        let json_path = temp_dir.path().join("transcription.json");
        let command = self
            .base_command("Transcription", &json_path)
            .arg("--diarize")
            .arg("--language")
            .arg(language)
            .path(audio);

        let output = self.run_json(command, &json_path).await?;
        debug!("Transcriber returned {} segments", output.segments.len());
        Ok(output.into_raw(language))
    }

    async fn transcribe_region(&self, audio: &Path, window: TimeWindow, language: &str) -> Result<String> {
        let temp_dir = tempfile::tempdir()?;
        let json_path = temp_dir.path().join("region.json");
        let command = self
            .base_command("Region transcription", &json_path)
            .arg("--language")
            .arg(language)
            .arg("--offset-ms")
            .arg(window.start_ms.to_string())
            .arg("--duration-ms")
            .arg(window.duration_ms().to_string())
            .path(audio);

        let output = self.run_json(command, &json_path).await?;
        let text = output
            .segments
            .into_iter()
            .filter_map(|s| s.text)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        if text.is_empty() {
            return Err(RedubError::Transcription("Region produced no text".to_string()));
        }
        Ok(text)
    }
}
