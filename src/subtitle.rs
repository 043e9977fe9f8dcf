use std::collections::HashMap;
use std::path::Path;
use tokio::fs;
use tracing::info;

use crate::error::Result;
use crate::reconcile::Timeline;
use crate::utterance::{TranslatedUtterance, Utterance};

#[derive(Debug, Clone, PartialEq)]
pub struct Cue {
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
}

/// Cues for the source transcription at the original timings
pub fn source_cues(utterances: &[Utterance]) -> Vec<Cue> {
    utterances
        .iter()
        .filter(|u| !u.source_text.trim().is_empty())
        .map(|u| Cue {
            start_ms: u.start_ms,
            end_ms: u.end_ms,
            text: u.source_text.trim().to_string(),
        })
        .collect()
}

/// Cues for the dubbed text at the final clip placements
pub fn dubbed_cues(translated: &[TranslatedUtterance], timeline: &Timeline) -> Vec<Cue> {
    let texts: HashMap<_, _> = translated
        .iter()
        .map(|t| (t.id(), t.target_text.trim()))
        .collect();

    timeline
        .entries
        .iter()
        .filter_map(|entry| {
            let text = texts.get(&entry.utterance_id).filter(|t| !t.is_empty())?;
            Some(Cue {
                start_ms: entry.offset_ms,
                end_ms: entry.offset_ms + entry.duration_ms,
                text: text.to_string(),
            })
        })
        .collect()
}

pub fn render_srt(cues: &[Cue]) -> String {
    let mut srt_content = String::new();
    for (index, cue) in cues.iter().enumerate() {
        srt_content.push_str(&format!(
            "{}\n{} --> {}\n{}\n\n",
            index + 1,
            format_srt_time(cue.start_ms),
            format_srt_time(cue.end_ms),
            cue.text
        ));
    }
    srt_content
}

/// Generate SRT subtitle file from cues
pub async fn write_srt<P: AsRef<Path>>(cues: &[Cue], output_path: P) -> Result<()> {
    let output_path = output_path.as_ref();
    info!("Generating SRT file: {}", output_path.display());
    fs::write(output_path, render_srt(cues)).await?;
    Ok(())
}

/// Format milliseconds to SRT time format (HH:MM:SS,mmm)
fn format_srt_time(total_milliseconds: u64) -> String {
    let hours = total_milliseconds / 3_600_000;
    let minutes = (total_milliseconds % 3_600_000) / 60_000;
    let secs = (total_milliseconds % 60_000) / 1_000;
    let millis = total_milliseconds % 1_000;

    format!("{:02}:{:02}:{:02},{:03}", hours, minutes, secs, millis)
}
