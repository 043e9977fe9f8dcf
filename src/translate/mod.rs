// Modular translation architecture
//
// This module separates the translation service from the per-utterance stage:
// - Translator: capability trait implemented per backend
// - ollama: LLM translation through the Ollama generate API
// - stage: context windows, pooled execution and failure flagging

pub mod ollama;
pub mod stage;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use stage::*;
use crate::config::{TranslateConfig, TranslatorBackend};
use crate::error::Result;

/// One utterance worth of text to translate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationRequest {
    pub text: String,
    pub source_language: String,
    pub target_language: String,
    /// Neighbouring source text for reference only
    pub context: Option<String>,
}

/// Main trait for translation services
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Translator: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the backend can translate `source` into `target`
    fn supports_pair(&self, source: &str, target: &str) -> bool;

    /// Translate exactly one utterance into exactly one target text
    async fn translate(&self, request: TranslationRequest) -> Result<String>;

    /// Check that the service is reachable before the run starts
    async fn check_availability(&self) -> Result<()>;
}

/// Factory for creating translator instances
pub struct TranslatorFactory;

impl TranslatorFactory {
    /// Create the translator selected in the configuration
    pub fn create_translator(config: TranslateConfig) -> Result<Arc<dyn Translator>> {
        match config.backend {
            TranslatorBackend::Ollama => Ok(Arc::new(ollama::OllamaTranslator::new(config)?)),
        }
    }
}
