use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::TranslateConfig;
use crate::error::{Result, RedubError};
use crate::pool::{TaskOutcome, WorkerPool};
use crate::snapshot::Stage;
use crate::utterance::{TranslatedUtterance, Utterance, UtteranceFlag};
use super::{TranslationRequest, Translator};

/// Join up to `size` neighbouring texts on each side of `index`.
pub fn build_context(texts: &[&str], index: usize, size: usize) -> Option<String> {
    if size == 0 || texts.len() <= 1 {
        return None;
    }

    let start = index.saturating_sub(size);
    let end = (index + 1 + size).min(texts.len());
    let parts: Vec<&str> = texts[start..index]
        .iter()
        .chain(texts[(index + 1).min(end)..end].iter())
        .copied()
        .filter(|t| !t.trim().is_empty())
        .collect();

    (!parts.is_empty()).then(|| parts.join(" "))
}

/// Translates every dubbable utterance on the worker pool.
pub struct TranslationStage {
    translator: Arc<dyn Translator>,
    context_window_size: usize,
    timeout: Duration,
}

impl TranslationStage {
    pub fn new(translator: Arc<dyn Translator>, config: &TranslateConfig) -> Self {
        Self {
            translator,
            context_window_size: config.context_window_size,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Returns one record per input utterance, in input order.
    ///
    /// Utterances excluded earlier pass through with an empty target text;
    /// a failed translation is flagged and excluded from synthesis.
    pub async fn run(&self, pool: &WorkerPool, utterances: &[Utterance]) -> Result<Vec<TranslatedUtterance>> {
        let dubbable: Vec<usize> = utterances
            .iter()
            .enumerate()
            .filter(|(_, u)| u.is_dubbable())
            .map(|(i, _)| i)
            .collect();
        let texts: Vec<&str> = dubbable
            .iter()
            .map(|&i| utterances[i].source_text.as_str())
            .collect();

        let requests: Vec<TranslationRequest> = dubbable
            .iter()
            .enumerate()
            .map(|(k, &i)| TranslationRequest {
                text: utterances[i].source_text.clone(),
                source_language: utterances[i].source_language.clone(),
                target_language: utterances[i].target_language.clone(),
                context: build_context(&texts, k, self.context_window_size),
            })
            .collect();

        info!("Translating {} of {} utterances", requests.len(), utterances.len());

        let translator = self.translator.clone();
        let outcomes = pool
            .run("Translating", requests, self.timeout, move |request| {
                let translator = translator.clone();
                async move {
                    let text = translator.translate(request).await?;
                    let text = text.trim().to_string();
                    if text.is_empty() {
                        return Err(RedubError::Translation("Empty translation received".to_string()));
                    }
                    Ok(text)
                }
            })
            .await?;

        let mut translated: Vec<TranslatedUtterance> = utterances
            .iter()
            .cloned()
            .map(|utterance| TranslatedUtterance {
                utterance,
                target_text: String::new(),
            })
            .collect();

        for (&index, outcome) in dubbable.iter().zip(outcomes) {
            let entry = &mut translated[index];
            match outcome {
                TaskOutcome::Completed { value, .. } => entry.target_text = value,
                TaskOutcome::Failed { error, attempts, timed_out } => {
                    warn!(
                        "Utterance {} not translated after {} attempts: {}",
                        entry.id(),
                        attempts,
                        error
                    );
                    if timed_out {
                        entry.utterance.flags.push(UtteranceFlag::TimedOut {
                            stage: Stage::Translation,
                        });
                    }
                    entry.utterance.flags.push(UtteranceFlag::TranslationFailed {
                        reason: error.to_string(),
                    });
                }
            }
        }

        Ok(translated)
    }
}
