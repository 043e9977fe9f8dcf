use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::audio::{decode_wav, PcmAudio};
use crate::config::SynthesisConfig;
use crate::error::{Result, RedubError};
use super::{SynthesisRequest, Synthesizer};

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: String,
    response_format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    language: Option<&'a str>,
}

/// Synthesizer for OpenAI-compatible `/v1/audio/speech` endpoints
pub struct HttpSynthesizer {
    client: Client,
    config: SynthesisConfig,
    api_key: Option<String>,
}

impl HttpSynthesizer {
    pub fn new(config: SynthesisConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let api_key = std::env::var(&config.api_key_env).ok().filter(|k| !k.is_empty());
        if api_key.is_none() {
            warn!(
                "{} is not set; sending unauthenticated speech requests to {}",
                config.api_key_env, config.endpoint
            );
        }
        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    fn request_body<'a>(&'a self, request: &'a SynthesisRequest) -> SpeechRequest<'a> {
        SpeechRequest {
            model: &self.config.model,
            input: &request.text,
            voice: request.voice.backend_value(),
            response_format: "wav",
            speed: if self.config.supports_rate { request.rate } else { None },
            language: Some(request.language.as_str()),
        }
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    fn name(&self) -> &str {
        "http"
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
        let body = self.request_body(&request);
        debug!("Synthesizing {} chars with voice {}", request.text.len(), body.voice);

        let mut builder = self.client.post(&self.config.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                RedubError::Timeout(self.config.timeout_secs)
            } else {
                RedubError::Synthesis(format!("Speech request failed: {}", e))
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(RedubError::Synthesis(format!(
                "Speech API error {}: {}",
                status, error_text
            )));
        }

        let bytes = response.bytes().await?;
        decode_wav(std::io::Cursor::new(bytes))
            .map_err(|e| RedubError::Synthesis(format!("Speech API returned invalid WAV: {}", e)))
    }

    async fn check_availability(&self) -> Result<()> {
        if self.config.endpoint.starts_with("http://") || self.config.endpoint.starts_with("https://") {
            info!("Speech endpoint: {}", self.config.endpoint);
            Ok(())
        } else {
            Err(RedubError::Config(format!(
                "Invalid speech endpoint: {}",
                self.config.endpoint
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utterance::VoiceDescriptor;

    fn request(rate: Option<f64>) -> SynthesisRequest {
        SynthesisRequest {
            text: "Hola".to_string(),
            language: "es".to_string(),
            voice: VoiceDescriptor::Preset {
                name: "nova".to_string(),
            },
            rate,
        }
    }

    #[test]
    fn test_body_carries_speed_only_when_supported() {
        let synth = HttpSynthesizer::new(SynthesisConfig::default()).unwrap();
        let req = request(Some(1.2));
        let json = serde_json::to_value(synth.request_body(&req)).unwrap();
        assert_eq!(json["voice"], "nova");
        assert_eq!(json["response_format"], "wav");
        assert_eq!(json["speed"], 1.2);

        let mut config = SynthesisConfig::default();
        config.supports_rate = false;
        let synth = HttpSynthesizer::new(config).unwrap();
        let json = serde_json::to_value(synth.request_body(&req)).unwrap();
        assert!(json.get("speed").is_none());
    }

    #[tokio::test]
    async fn test_endpoint_must_be_http() {
        let mut config = SynthesisConfig::default();
        config.endpoint = "localhost:8000".to_string();
        let synth = HttpSynthesizer::new(config).unwrap();
        assert!(matches!(synth.check_availability().await, Err(RedubError::Config(_))));
    }
}
