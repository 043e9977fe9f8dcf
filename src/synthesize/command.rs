use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

use crate::audio::{read_wav, PcmAudio};
use crate::config::SynthesisConfig;
use crate::error::{Result, RedubError};
use crate::media::MediaCommand;
use crate::utterance::VoiceDescriptor;
use super::{SynthesisRequest, Synthesizer};

/// Synthesizer running an external TTS command.
///
/// Invocation: `<binary> --model M --language L (--voice V | --reference R)
/// [--rate X] --text-file in.txt --output out.wav`
pub struct CommandSynthesizer {
    config: SynthesisConfig,
}

impl CommandSynthesizer {
    pub fn new(config: SynthesisConfig) -> Self {
        Self { config }
    }

    fn build_command(&self, request: &SynthesisRequest, text_file: &std::path::Path, output: &std::path::Path) -> MediaCommand {
        let command = MediaCommand::new(&self.config.binary_path, "Speech synthesis")
            .arg("--model")
            .arg(&self.config.model)
            .arg("--language")
            .arg(&request.language);

        let command = match &request.voice {
            VoiceDescriptor::Preset { name } => command.arg("--voice").arg(name),
            VoiceDescriptor::Embedding { reference_audio, .. } => command.arg("--reference").path(reference_audio),
        };

        let command = match request.rate.filter(|_| self.config.supports_rate) {
            Some(rate) => command.arg("--rate").arg(format!("{:.3}", rate)),
            None => command,
        };

        command
            .arg("--text-file")
            .path(text_file)
            .arg("--output")
            .path(output)
            .timeout(Duration::from_secs(self.config.timeout_secs))
    }
}

#[async_trait]
impl Synthesizer for CommandSynthesizer {
    fn name(&self) -> &str {
        "command"
    }

    fn supported_languages(&self) -> Vec<String> {
        self.config.languages.clone()
    }

    fn supports_rate(&self) -> bool {
        self.config.supports_rate
    }

    fn preset_voices(&self, _language: &str) -> Vec<String> {
        self.config.voices.clone()
    }

    async fn synthesize(&self, request: SynthesisRequest) -> Result<PcmAudio> {
        let temp_dir = tempfile::tempdir()?;
        let text_file = temp_dir.path().join("input.txt");
        let output = temp_dir.path().join("speech.wav");
        tokio::fs::write(&text_file, request.text.as_bytes()).await?;

        let command = self.build_command(&request, &text_file, &output);
        debug!("Synthesizing {} chars via {}", request.text.len(), self.config.binary_path);
        command.execute().await.map_err(|e| match e {
            RedubError::Media(msg) => RedubError::Synthesis(msg),
            other => other,
        })?;

        read_wav(&output).map_err(|e| RedubError::Synthesis(format!("Synthesizer produced no audio: {}", e)))
    }

    async fn check_availability(&self) -> Result<()> {
        MediaCommand::new(&self.config.binary_path, "Synthesizer version check")
            .arg("--version")
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .execute()
            .await
            .map_err(|e| RedubError::Synthesis(format!("Synthesizer not available: {}", e)))?;
        info!("Synthesizer '{}' is available", self.config.binary_path);
        Ok(())
    }
}
