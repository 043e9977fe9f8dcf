use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::MediaConfig;
use crate::error::{Result, RedubError};
use super::{MediaCommand, MediaCommandBuilder, MediaInfo, MediaProcessor};

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    r_frame_rate: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Parse ffprobe's JSON report into [`MediaInfo`]
pub fn parse_probe_output(json: &[u8]) -> Result<MediaInfo> {
    let probe: ProbeOutput = serde_json::from_slice(json)
        .map_err(|e| RedubError::Media(format!("Failed to parse probe output: {}", e)))?;

    let video = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));
    let audio_streams = probe
        .streams
        .iter()
        .filter(|s| s.codec_type.as_deref() == Some("audio"))
        .count() as u32;

    let seconds = probe
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .or_else(|| probe.streams.iter().find_map(|s| s.duration.as_deref()))
        .and_then(|d| d.parse::<f64>().ok())
        .ok_or_else(|| RedubError::Media("Probe output has no duration".to_string()))?;

    let frame_rate = video
        .and_then(|s| s.r_frame_rate.as_deref())
        .and_then(parse_frame_rate);

    Ok(MediaInfo {
        duration_ms: (seconds * 1000.0).round() as u64,
        has_video: video.is_some(),
        frame_rate,
        audio_streams,
    })
}

fn parse_frame_rate(rate: &str) -> Option<f64> {
    match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().ok()?;
            let den: f64 = den.parse().ok()?;
            (den != 0.0).then(|| num / den)
        }
        None => rate.parse().ok(),
    }
}

/// ffmpeg/ffprobe backed media processor
pub struct FfmpegProcessor {
    config: MediaConfig,
    command_builder: MediaCommandBuilder,
}

impl FfmpegProcessor {
    pub fn new(config: MediaConfig) -> Self {
        let command_builder = MediaCommandBuilder::new(&config.binary_path, &config.probe_path);
        Self {
            config,
            command_builder,
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }
}

#[async_trait]
impl MediaProcessor for FfmpegProcessor {
    async fn probe(&self, input: &Path) -> Result<MediaInfo> {
        debug!("Probing {}", input.display());
        let stdout = self.command_builder.probe(input).timeout(self.timeout()).execute().await?;
        let info = parse_probe_output(&stdout)?;
        info!(
            "Input {}: {} ms, video: {}, audio streams: {}",
            input.display(),
            info.duration_ms,
            info.has_video,
            info.audio_streams
        );
        Ok(info)
    }

    async fn extract_audio(&self, input: &Path, output: &Path, sample_rate: u32) -> Result<()> {
        info!("Extracting audio from {} to {}", input.display(), output.display());
        self.command_builder
            .extract_audio(input, output, sample_rate)
            .timeout(self.timeout())
            .execute()
            .await?;
        Ok(())
    }

    async fn separate_background(&self, audio: &Path, work_dir: &Path) -> Result<Option<PathBuf>> {
        let Some(separator) = &self.config.separator else {
            return Ok(None);
        };

        let out_dir = work_dir.join("separated");
        info!("Separating background from {} with {}", audio.display(), separator.binary_path);

        MediaCommand::new(&separator.binary_path, "Background separation")
            .arg("--two-stems=vocals")
            .arg("-n")
            .arg(&separator.model)
            .arg("-o")
            .path(&out_dir)
            .path(audio)
            .timeout(self.timeout())
            .execute()
            .await?;

        let stem = audio
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let background = out_dir.join(&separator.model).join(stem).join("no_vocals.wav");
        if background.exists() {
            Ok(Some(background))
        } else {
            Err(RedubError::Media(format!(
                "Separation finished but {} was not produced",
                background.display()
            )))
        }
    }

    async fn mux(&self, input: &Path, dubbed_audio: &Path, output: &Path, info: &MediaInfo) -> Result<()> {
        let command = if info.has_video {
            info!("Muxing dubbed audio with video from {} -> {}", input.display(), output.display());
            self.command_builder.mux_dubbed_audio(
                input,
                dubbed_audio,
                output,
                &self.config.audio_codec,
                &self.config.mux_options,
            )
        } else {
            info!("Encoding dubbed audio -> {}", output.display());
            let codec = match output.extension().and_then(|e| e.to_str()) {
                Some(ext) if ext.eq_ignore_ascii_case("wav") => "pcm_s16le",
                _ => self.config.audio_codec.as_str(),
            };
            self.command_builder.encode_audio(dubbed_audio, output, codec)
        };

        command.timeout(self.timeout()).execute().await?;
        Ok(())
    }

    async fn check_availability(&self) -> Result<()> {
        self.command_builder
            .version_check()
            .execute()
            .await
            .map_err(|e| RedubError::Media(format!("Media processor not available: {}", e)))?;
        info!("Media processor is available");
        Ok(())
    }
}
