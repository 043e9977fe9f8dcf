use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::TranscriberConfig;
use crate::error::{Result, RedubError};
use crate::run::RunContext;
use crate::utterance::{Utterance, UtteranceFlag};
use super::{RawSegment, TimeWindow, Transcriber};

/// A normalised speech region prior to id assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechRegion {
    pub window: TimeWindow,
    pub speaker_id: String,
    pub text: Option<String>,
    pub confidence: f32,
}

/// Canonical label for the n-th distinct speaker
pub fn speaker_label(index: usize) -> String {
    format!("SPEAKER_{:02}", index)
}

/// Turn raw service output into ordered, non-overlapping regions.
///
/// Zero-length regions are dropped; a region starting inside the previous
/// one is clipped to begin where the previous ends (and dropped if nothing
/// remains). Speaker labels are renamed in order of first appearance so the
/// same raw label always maps to the same canonical id.
pub fn normalize_segments(mut raw: Vec<RawSegment>) -> Vec<SpeechRegion> {
    raw.retain(|s| s.end_ms > s.start_ms);
    raw.sort_by(|a, b| {
        a.start_ms
            .cmp(&b.start_ms)
            .then(a.end_ms.cmp(&b.end_ms))
            .then(a.speaker.cmp(&b.speaker))
    });

    let mut speakers: HashMap<String, String> = HashMap::new();
    let mut regions: Vec<SpeechRegion> = Vec::with_capacity(raw.len());
    let mut previous_end = 0u64;

    for segment in raw {
        let start_ms = segment.start_ms.max(previous_end);
        if segment.end_ms <= start_ms {
            continue;
        }

        let next_label = speaker_label(speakers.len());
        let speaker_id = speakers
            .entry(segment.speaker.clone())
            .or_insert(next_label)
            .clone();

        let text = segment
            .text
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        previous_end = segment.end_ms;
        regions.push(SpeechRegion {
            window: TimeWindow::new(start_ms, segment.end_ms),
            speaker_id,
            text,
            confidence: segment.confidence.clamp(0.0, 1.0),
        });
    }

    regions
}

/// Shorter window used for the single retry of a failed region.
pub fn retry_window(window: TimeWindow, trim_ms: u64, min_region_ms: u64) -> TimeWindow {
    let len = window.duration_ms();
    if len <= min_region_ms {
        return window;
    }
    let trim = trim_ms.min((len - min_region_ms) / 2);
    TimeWindow::new(window.start_ms + trim, window.end_ms - trim)
}

/// Runs the transcriber and produces the utterance sequence.
pub struct Segmenter<'a> {
    transcriber: &'a dyn Transcriber,
    config: &'a TranscriberConfig,
}

impl<'a> Segmenter<'a> {
    pub fn new(transcriber: &'a dyn Transcriber, config: &'a TranscriberConfig) -> Self {
        Self { transcriber, config }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    /// Transcribe, diarize and normalise the whole file.
    ///
    /// No detected speech yields an empty list. Regions the model failed on
    /// are retried once on a shorter window, then kept with a
    /// `transcription_failed` flag.
    pub async fn segment(
        &self,
        ctx: &RunContext,
        audio: &Path,
        source_language: &str,
        target_language: &str,
        max_attempts: u32,
    ) -> Result<Vec<Utterance>> {
        info!("Transcribing {} with {}", audio.display(), self.transcriber.name());

        let mut attempts = 0;
        let transcription = loop {
            ctx.ensure_active()?;
            attempts += 1;
            let cancel = ctx.cancellation_token();
            let result = tokio::select! {
                result = tokio::time::timeout(self.timeout(), self.transcriber.transcribe(audio, source_language)) => {
                    result.map_err(|_| RedubError::Timeout(self.config.timeout_secs)).and_then(|r| r)
                }
                _ = cancel.cancelled() => Err(RedubError::Cancelled),
            };
            match result {
                Ok(transcription) => break transcription,
                Err(e) if e.is_transient() && attempts < max_attempts.max(1) => {
                    warn!("Transcription attempt {} failed: {}", attempts, e);
                }
                Err(e) => return Err(e),
            }
        };

        let regions = normalize_segments(transcription.segments);
        info!("Detected {} speech regions", regions.len());

        let mut utterances = Vec::with_capacity(regions.len());
        for (index, region) in regions.into_iter().enumerate() {
            ctx.ensure_active()?;
            let mut flags = Vec::new();

            let text = match region.text {
                Some(text) => text,
                None => match self.retry_region(ctx, audio, region.window, source_language).await? {
                    Ok(text) => {
                        flags.push(UtteranceFlag::TranscriptionRetried);
                        text
                    }
                    Err(reason) => {
                        warn!(
                            "Dropping region {}-{} ms from dubbing: {}",
                            region.window.start_ms, region.window.end_ms, reason
                        );
                        flags.push(UtteranceFlag::TranscriptionRetried);
                        flags.push(UtteranceFlag::TranscriptionFailed { reason });
                        String::new()
                    }
                },
            };

            utterances.push(Utterance {
                id: index as u32,
                start_ms: region.window.start_ms,
                end_ms: region.window.end_ms,
                speaker_id: region.speaker_id,
                source_text: text,
                source_language: source_language.to_string(),
                target_language: target_language.to_string(),
                language_confidence: region.confidence,
                flags,
            });
        }

        Ok(utterances)
    }

    /// Outer error aborts the run (cancellation); inner error is the local failure reason.
    async fn retry_region(
        &self,
        ctx: &RunContext,
        audio: &Path,
        window: TimeWindow,
        language: &str,
    ) -> Result<std::result::Result<String, String>> {
        let sub_window = retry_window(window, self.config.subwindow_trim_ms, self.config.min_region_ms);
        info!(
            "Retrying failed region {}-{} ms as {}-{} ms",
            window.start_ms, window.end_ms, sub_window.start_ms, sub_window.end_ms
        );

        let cancel = ctx.cancellation_token();
        let result = tokio::select! {
            result = tokio::time::timeout(self.timeout(), self.transcriber.transcribe_region(audio, sub_window, language)) => result,
            _ = cancel.cancelled() => return Err(RedubError::Cancelled),
        };

        Ok(match result {
            Ok(Ok(text)) if !text.trim().is_empty() => Ok(text.trim().to_string()),
            Ok(Ok(_)) => Err("empty transcription".to_string()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {} seconds", self.config.timeout_secs)),
        })
    }
}
