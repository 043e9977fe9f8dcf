// Media processing architecture
//
// This module provides an abstraction over the demux/mux tooling:
// - Processor: ffmpeg/ffprobe implementation built on abstract commands
// - Commands: command builders and execution with timeouts
//
// The pipeline only talks to MediaProcessor, so tests and alternative
// tooling can replace ffmpeg without touching the workflow.

pub mod commands;
pub mod processor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use commands::*;
pub use processor::*;

use crate::config::MediaConfig;
use crate::error::Result;

/// Container metadata needed by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub duration_ms: u64,
    pub has_video: bool,
    pub frame_rate: Option<f64>,
    pub audio_streams: u32,
}

/// Main trait for media processing operations
#[async_trait]
pub trait MediaProcessor: Send + Sync {
    /// Read duration and stream layout of the input container
    async fn probe(&self, input: &Path) -> Result<MediaInfo>;

    /// Extract a mono PCM WAV track at the given sample rate
    async fn extract_audio(&self, input: &Path, output: &Path, sample_rate: u32) -> Result<()>;

    /// Split the background/music bed from the speech, if separation is configured
    async fn separate_background(&self, audio: &Path, work_dir: &Path) -> Result<Option<PathBuf>>;

    /// Replace the input's audio with the dubbed track, copying any video stream
    async fn mux(&self, input: &Path, dubbed_audio: &Path, output: &Path, info: &MediaInfo) -> Result<()>;

    /// Check that the underlying tools are installed
    async fn check_availability(&self) -> Result<()>;
}

/// Factory for creating media processor instances
pub struct MediaProcessorFactory;

impl MediaProcessorFactory {
    /// Create the default media processor implementation (FFmpeg-based)
    pub fn create_processor(config: MediaConfig) -> Arc<dyn MediaProcessor> {
        Arc::new(processor::FfmpegProcessor::new(config))
    }
}
