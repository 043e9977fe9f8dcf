use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::TranslateConfig;
use crate::error::{Result, RedubError};
use crate::language::display_name;
use super::{TranslationRequest, Translator};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
    format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GenerateResponse {
    response: String,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TranslationResult {
    text: String,
}

/// Translator backed by a local Ollama model
pub struct OllamaTranslator {
    client: Client,
    config: TranslateConfig,
}

impl OllamaTranslator {
    pub fn new(config: TranslateConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    /// Build translation prompt with context, using JSON format
    pub fn build_prompt(request: &TranslationRequest) -> String {
        let source_name = display_name(&request.source_language);
        let target_name = display_name(&request.target_language);

        let mut prompt = format!(
            "You are a professional translator for film and video dubbing.\n\
             \n\
             Translate the text from {} to {} ONLY. The target language code is: {}\n\
             The translation will be spoken aloud in the same time slot as the original,\n\
             so keep it natural and about as long as the source.\n\
             \n\
             Return ONLY the translation in JSON format as {{\"text\":\"your {} translation here\"}}.\n\
             Do not include any explanations, alternatives, or text in other languages.\n\
             \n\
             [Text to translate]\n\
             {}\n\
             \n",
            source_name, target_name, request.target_language, target_name, request.text
        );

        if let Some(ctx) = request.context.as_deref().filter(|c| !c.trim().is_empty()) {
            prompt.push_str(&format!(
                "[Context for reference - DO NOT translate this part]\n\
                 {}\n\n\
                 Remember: Only translate the text in the [Text to translate] section above to {}.\n",
                ctx, target_name
            ));
        }

        prompt
    }

    /// Clean up a non-JSON response to extract just the translation
    pub fn clean_response(response: &str) -> String {
        let candidate = response.lines().map(str::trim).find(|line| {
            !line.is_empty()
                && !line.starts_with("Here are")
                && !line.starts_with("Option")
                && !line.starts_with("**Option")
                && !line.starts_with("Translation:")
                && !line.starts_with("- ")
                && !line.starts_with("* ")
                && !(line.starts_with("**") && line.ends_with("**"))
        });

        candidate
            .or_else(|| response.lines().map(str::trim).find(|line| !line.is_empty()))
            .unwrap_or(response)
            .trim_matches('"')
            .to_string()
    }

    fn parse_response(raw_response: &str) -> Result<String> {
        let raw_response = raw_response.trim();
        if raw_response.is_empty() {
            return Err(RedubError::Translation("Empty translation received".to_string()));
        }

        let text = match serde_json::from_str::<TranslationResult>(raw_response) {
            Ok(result) => result.text.trim().to_string(),
            Err(_) => Self::clean_response(raw_response),
        };

        if text.is_empty() {
            return Err(RedubError::Translation("Empty translation received".to_string()));
        }
        Ok(text)
    }
}

#[async_trait]
impl Translator for OllamaTranslator {
    fn name(&self) -> &str {
        "ollama"
    }

    fn supports_pair(&self, source: &str, target: &str) -> bool {
        if self.config.language_pairs.is_empty() {
            return true;
        }
        let pair = format!("{}-{}", source, target);
        self.config
            .language_pairs
            .iter()
            .any(|p| p.eq_ignore_ascii_case(&pair))
    }

    async fn translate(&self, request: TranslationRequest) -> Result<String> {
        let body = GenerateRequest {
            model: self.config.model.clone(),
            prompt: Self::build_prompt(&request),
            stream: false,
            format: "json".to_string(),
        };

        let url = format!("{}/api/generate", self.config.endpoint);
        debug!("Sending translation request to: {}", url);

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RedubError::Timeout(self.config.timeout_secs)
                } else {
                    RedubError::Translation(format!("HTTP request failed: {}", e))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(RedubError::Translation(format!(
                "Ollama API error {}: {}",
                status, error_text
            )));
        }

        let generated: GenerateResponse = response
            .json()
            .await
            .map_err(|e| RedubError::Translation(format!("Failed to parse response: {}", e)))?;
        debug!("Raw Ollama response (done: {}): {}", generated.done, generated.response);

        Self::parse_response(&generated.response)
    }

    async fn check_availability(&self) -> Result<()> {
        let url = format!("{}/api/show", self.config.endpoint);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "name": self.config.model }))
            .send()
            .await
            .map_err(|e| RedubError::Translation(format!("Failed to connect to Ollama: {}", e)))?;

        if response.status().is_success() {
            info!("Ollama model '{}' is available", self.config.model);
            Ok(())
        } else {
            Err(RedubError::Translation(format!(
                "Ollama model '{}' not found. Please pull the model first: ollama pull {}",
                self.config.model, self.config.model
            )))
        }
    }
}
